//! BitTorrent peer-wire protocol
//!
//! Handshake and message codec, optional MSE stream encryption and the
//! extension protocol with its ut_metadata, ut_pex and upload_only
//! handlers.

pub mod handshake;
pub mod message;
pub mod wire;
pub mod crypto;
pub mod mse;
pub mod extension;
pub mod metadata;
pub mod pex;
pub mod upload_only;

// Re-export main types
pub use handshake::{client_name, Handshake, LocalCapabilities, Reserved, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{write_handshake, write_message, FrameDecoder, GuardVerdict, HandshakeGuard, MAX_FRAME_LENGTH};
pub use crypto::CryptoStream;
pub use mse::EncryptionMode;
pub use extension::{
    ExtensionContext, ExtensionDispatcher, ExtensionHandler, ExtensionHandshake, ExtensionSender, ExtensionType,
};
pub use metadata::{MetadataAssembler, MetadataMessage};
pub use pex::{PexMessage, PexState};
