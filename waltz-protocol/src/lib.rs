//! # waltz-protocol
//!
//! Wire protocol implementation for Waltz.
//!
//! This crate provides:
//! - Binary framing with magic byte, version, length prefix and CRC32C validation
//! - The request identifier attached to every data-plane message
//! - Data-plane messages (mount, append, feed, transaction data, flush, ...)
//! - Admin-plane messages spoken with storage nodes
//! - Versioned codecs mapping both message sets to and from bytes
//! - The hello handshake that opens every connection

pub mod admin;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod reqid;
pub mod wire;

pub use admin::{AdminMessage, AdminMessageType};
pub use codec::{AdminMessageCodecV0, Decoder, Encoder, MessageCodec, MessageCodecV1};
pub use error::ProtocolError;
pub use frame::{Frame, FRAME_HEADER_SIZE};
pub use handshake::{Hello, HelloResponse};
pub use message::{Message, MessageType};
pub use reqid::ReqId;

/// Magic byte of data-plane frames.
pub const MESSAGE_MAGIC: u8 = b'L';

/// Data-plane codec version supported by this implementation.
pub const MESSAGE_VERSION: u16 = 1;

/// Magic byte of admin-plane frames.
pub const ADMIN_MAGIC: u8 = b'A';

/// Admin-plane codec version supported by this implementation.
pub const ADMIN_VERSION: u16 = 0;

/// Magic byte of handshake frames.
pub const HANDSHAKE_MAGIC: u8 = b'H';

/// Handshake layout version.
pub const HANDSHAKE_VERSION: u16 = 0;

/// Default port for a Waltz server.
pub const DEFAULT_PORT: u16 = 55180;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
