//! # Share Connector Protocol Library
//!
//! Wire definitions shared by both ends of a share connector session.
//!
//! ## Overview
//!
//! - **Commands**: numeric command codes grouped into operation families
//! - **Status codes**: connector-internal status values and their names
//! - **Messages**: the MessagePack-encoded envelope and its bodies
//! - **Framing**: the 16-byte packet header, packet reassembly and send cursor
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Message                    │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Packet                     │  16-byte header + payload
//! ├─────────────────────────────────────────┤
//! │        Transport (Unix socket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, FrameCodec, Message};
//!
//! let message = Message::bare("1234", Command::DeleteInitResp);
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&message).unwrap();
//! let (decoded, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod commands;
pub mod error;
pub mod framing;
pub mod messages;
pub mod status;

pub use commands::{command_name, Command, Family, INVALID_COMMAND};
pub use error::{ProtocolError, Result};
pub use framing::{
    FrameCodec, Packet, PacketHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use messages::{
    Body, CommandHeader, Credentials, FileInformation, FolderStructureRequest, Message,
    RangeDownloadRequest, RequestPacket, RequestParams, ResponsePacket, Status,
    FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_NORMAL,
};
