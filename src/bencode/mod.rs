//! Bencode codec
//!
//! The self-describing binary format used by every protocol layer of the
//! swarm: metainfo files, DHT datagrams, tracker responses and LTEP
//! payloads. Dictionaries keep their insertion order so that re-encoding a
//! decoded value reproduces the original bytes.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use value::{BencodeDict, BencodeValue};
