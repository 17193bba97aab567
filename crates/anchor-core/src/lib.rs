//! # anchor-core
//!
//! Wire-level types for the Anchor room relay.
//!
//! This crate provides the pieces shared by the relay and its clients:
//! - Client and room identities, mirrored client metadata
//! - The closed packet type and its JSON envelope
//! - Newline-delimited frame decoding and encoding
//! - Error types

pub mod error;
pub mod framing;
pub mod packet;
pub mod types;

pub use error::{RelayError, Result};
pub use framing::{DELIMITER, FrameDecoder, encode_frame};
pub use packet::{PACKET_TYPES, Packet, PacketBody};
pub use types::{ClientData, ClientId, ClientSnapshot, RoomId};
