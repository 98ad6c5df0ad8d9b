//! Wire-level types for the A314 bridge daemon.
//!
//! Two formats live here. [`packet`] is the on-ring format spoken with the
//! Amiga-side firmware across the two 256-byte SRAM rings. [`message`] is the
//! length-prefixed format spoken with local clients over stream sockets, with
//! [`framing`] providing buffered frame I/O over any async byte stream.
//! [`layout`] pins down the shared-memory layout both sides agree on.

pub mod framing;
pub mod layout;
pub mod message;
pub mod packet;

use std::fmt;

/// Decode error for either wire format.
///
/// Client-side errors (`UnknownMessageType`, `ShortMessage`) are tolerated:
/// the message is dropped and the connection stays up. Ring-side errors
/// (`UnknownPacketType`, `TruncatedPacket`, `UnexpectedPayload`) mean the
/// Amiga firmware and the daemon disagree about the protocol, which the
/// daemon treats as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Client message with an unassigned type byte.
    UnknownMessageType(u8),
    /// Client message too short for its type's fixed fields.
    ShortMessage { kind: u8, length: usize },
    /// Ring packet with an unassigned type byte.
    UnknownPacketType(u8),
    /// Ring contents ended in the middle of a packet.
    TruncatedPacket,
    /// Payload bytes on a packet type that carries none.
    UnexpectedPayload(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownMessageType(t) => write!(f, "unknown client message type {t}"),
            WireError::ShortMessage { kind, length } => {
                write!(f, "client message type {kind} too short ({length} bytes)")
            }
            WireError::UnknownPacketType(t) => write!(f, "unknown ring packet type {t}"),
            WireError::TruncatedPacket => write!(f, "ring contents ended mid-packet"),
            WireError::UnexpectedPayload(t) => {
                write!(f, "ring packet type {t} carries no payload")
            }
        }
    }
}

impl std::error::Error for WireError {}

impl WireError {
    /// True for errors the daemon can survive by dropping one client message.
    pub fn is_client_recoverable(&self) -> bool {
        matches!(
            self,
            WireError::UnknownMessageType(_) | WireError::ShortMessage { .. }
        )
    }
}
