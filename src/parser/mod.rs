//! Parser registry (component B): given a negotiated major version, a
//! channel type and message type, and raw payload bytes, produce a parsed
//! value.
//!
//! The registry has exactly two generations — major 1 and the current
//! major — selected once per channel during link negotiation (§4.5).
//! Everything outside the MAIN channel's own control traffic is, per §1,
//! an external collaborator's concern; this crate's parsers hand those
//! payloads through as raw bytes rather than decoding them.

pub mod v1;
pub mod v2;

use std::any::Any;

use crate::channel::ChannelKind;
use crate::error::*;

/// MAIN channel, client→server: request the server to start the other
/// channels (display/cursor/inputs/playback). Carries no body.
pub const MSG_MAIN_ATTACH_CHANNELS: u16 = 1;

/// MAIN channel, server→client: carries the connection identifier and the
/// ACK window size. Resolves the "how is the connection id assigned, and
/// how is the ACK window announced" pair of open questions the same way —
/// see DESIGN.md.
pub const MSG_MAIN_INIT: u16 = 103;

/// Parsed payload of `MSG_MAIN_INIT`.
#[derive(Debug, Copy, Clone)]
pub struct MainInit {
    pub connection_id: u32,
    pub ack_window: u32,
}

impl MainInit {
    pub const WIRE_LEN: usize = 8;

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        use byteorder::{ByteOrder, LittleEndian};
        if buf.len() < Self::WIRE_LEN {
            return Err("buffer too short to deserialize MainInit")
                .wrapped(ErrorKind::Protocol);
        }
        Ok(MainInit {
            connection_id: LittleEndian::read_u32(&buf[0..4]),
            ack_window: LittleEndian::read_u32(&buf[4..8]),
        })
    }

    pub fn serialize_into(&self, buf: &mut [u8]) {
        use byteorder::{ByteOrder, LittleEndian};
        LittleEndian::write_u32(&mut buf[0..4], self.connection_id);
        LittleEndian::write_u32(&mut buf[4..8], self.ack_window);
    }
}

/// A per-major-version parser table.
pub trait Parser {
    fn parse(&self, kind: ChannelKind, msg_type: u16, minor: u32, bytes: &[u8]) -> Result<Box<dyn Any>>;
}

/// Selects the parser table for a negotiated major version. Any major
/// other than the legacy `1` gets the current table — there is only ever
/// one "current", so no third generation is needed.
pub fn for_major(major: u32) -> &'static dyn Parser {
    match major {
        1 => &v1::PARSER,
        _ => &v2::PARSER,
    }
}

/// Shared by both generations: MAIN's own control messages decode to a
/// typed struct, every other message is passed through as raw bytes for
/// the out-of-scope collaborator (display/cursor/inputs/playback logic)
/// to interpret.
fn parse_common(kind: ChannelKind, msg_type: u16, _minor: u32, bytes: &[u8]) -> Result<Box<dyn Any>> {
    if kind == ChannelKind::Main && msg_type == MSG_MAIN_INIT {
        return Ok(Box::new(MainInit::deserialize_from(bytes)?));
    }
    Ok(Box::new(bytes.to_vec()))
}
