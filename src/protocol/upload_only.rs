//! upload_only
//!
//! A one-byte payload: 1 when the sender only uploads (a seed or a partial
//! seed that wants nothing more), 0 otherwise.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::error::TorrentError;
use crate::protocol::extension::{ExtensionContext, ExtensionHandler, ExtensionType};

pub fn encode(upload_only: bool) -> Vec<u8> {
    vec![u8::from(upload_only)]
}

pub fn decode(payload: &[u8]) -> Result<bool> {
    match payload {
        [flag] => Ok(*flag != 0),
        _ => Err(TorrentError::malformed(format!("upload_only payload of {} bytes", payload.len())).into()),
    }
}

/// Marks the sending peer upload-only
pub struct UploadOnlyHandler;

#[async_trait]
impl ExtensionHandler for UploadOnlyHandler {
    fn extension(&self) -> ExtensionType {
        ExtensionType::UploadOnly
    }

    async fn handle(&self, payload: &[u8], ctx: &ExtensionContext) -> Result<()> {
        let upload_only = decode(payload)?;
        if upload_only != ctx.peer.is_upload_only() {
            debug!("{} is {} upload-only", ctx.peer.addr(), if upload_only { "now" } else { "no longer" });
        }
        ctx.peer.set_upload_only(upload_only);
        Ok(())
    }
}
