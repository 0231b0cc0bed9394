//! Wire format structs traded during the handshake and in steady state.
//!
//! All multi-byte integers on the wire are little-endian (see `byteorder`
//! usage throughout); this module only knows how to (de)serialize fixed
//! and semi-fixed structures, not what a payload *means* — that's `parser`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::*;

/// `"REDQ"` as a little-endian `u32`, i.e. `0x51444552`.
pub const MAGIC: u32 = 0x5144_4552;

/// The major protocol version this implementation prefers.
pub const CURRENT_MAJOR: u32 = 2;

/// The minor protocol version this implementation prefers.
pub const CURRENT_MINOR: u32 = 0;

/// The major version a peer may force a downgrade to.
pub const LEGACY_MAJOR: u32 = 1;

/// Link-message `error` field values.
pub mod link_error {
    pub const OK: u32 = 0;
    pub const NEED_SECURED: u32 = 1;
    pub const INVALID_MAGIC: u32 = 2;
    pub const VERSION_MISMATCH: u32 = 3;
}

/// Control message type used for ACK-window acknowledgments.
pub const MSGC_ACK: u16 = 0xFFFF;

/// The unencrypted (or TLS-framed) handshake preamble sent by both peers
/// before a `LinkMessage`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LinkHeader {
    pub magic: u32,
    pub major_version: u32,
    pub minor_version: u32,
    /// Size, in bytes, of the `LinkMessage` (plus capability arrays) that
    /// follows this header.
    pub size: u32,
}

impl LinkHeader {
    pub const LENGTH: usize = 16;

    pub fn new(major_version: u32, minor_version: u32, size: u32) -> Self {
        LinkHeader { magic: MAGIC, major_version, minor_version, size }
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to serialize LinkHeader")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.major_version);
        LittleEndian::write_u32(&mut buf[8..12], self.minor_version);
        LittleEndian::write_u32(&mut buf[12..16], self.size);
        Ok(())
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to deserialize LinkHeader")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(LinkHeader {
            magic: LittleEndian::read_u32(&buf[0..4]),
            major_version: LittleEndian::read_u32(&buf[4..8]),
            minor_version: LittleEndian::read_u32(&buf[8..12]),
            size: LittleEndian::read_u32(&buf[12..16]),
        })
    }
}

/// The client→server link message: identifies the connection, channel, and
/// (always empty, for now — see DESIGN.md) capability lists.
#[derive(Debug, Clone)]
pub struct LinkMessage {
    pub connection_id: u32,
    pub channel_type: u8,
    pub channel_id: u8,
    pub common_caps: Vec<u32>,
    pub channel_caps: Vec<u32>,
}

impl LinkMessage {
    /// Size of the fixed-length prefix, before the two capability arrays.
    pub const PREFIX_LENGTH: usize = 18;

    pub fn new(connection_id: u32, channel_type: u8, channel_id: u8) -> Self {
        LinkMessage {
            connection_id,
            channel_type,
            channel_id,
            common_caps: Vec::new(),
            channel_caps: Vec::new(),
        }
    }

    /// Total wire length, including the capability arrays.
    pub fn wire_len(&self) -> usize {
        Self::PREFIX_LENGTH + 4 * (self.common_caps.len() + self.channel_caps.len())
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.wire_len() {
            return Err("buffer too short to serialize LinkMessage")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        LittleEndian::write_u32(&mut buf[0..4], self.connection_id);
        buf[4] = self.channel_type;
        buf[5] = self.channel_id;
        LittleEndian::write_u32(&mut buf[6..10], self.common_caps.len() as u32);
        LittleEndian::write_u32(&mut buf[10..14], self.channel_caps.len() as u32);
        // caps_offset is relative to the start of this struct.
        LittleEndian::write_u32(&mut buf[14..18], Self::PREFIX_LENGTH as u32);
        let mut off = Self::PREFIX_LENGTH;
        for &cap in &self.common_caps {
            LittleEndian::write_u32(&mut buf[off..off + 4], cap);
            off += 4;
        }
        for &cap in &self.channel_caps {
            LittleEndian::write_u32(&mut buf[off..off + 4], cap);
            off += 4;
        }
        Ok(())
    }

    /// Parses a `LinkMessage` whose first `u32` is *not* an error code
    /// (i.e. the client→server shape).
    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::PREFIX_LENGTH {
            return Err("buffer too short to deserialize LinkMessage")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        let connection_id = LittleEndian::read_u32(&buf[0..4]);
        let channel_type = buf[4];
        let channel_id = buf[5];
        let num_common = LittleEndian::read_u32(&buf[6..10]) as usize;
        let num_channel = LittleEndian::read_u32(&buf[10..14]) as usize;
        let caps_offset = LittleEndian::read_u32(&buf[14..18]) as usize;
        let common_caps = read_u32_array(buf, caps_offset, num_common)?;
        let channel_caps = read_u32_array(buf, caps_offset + 4 * num_common, num_channel)?;
        Ok(LinkMessage { connection_id, channel_type, channel_id, common_caps, channel_caps })
    }
}

/// The server→client link message body: a `u32 error` followed by the DER
/// public key and then a `LinkMessage`-shaped capability section.
#[derive(Debug, Clone)]
pub struct PeerLinkMessage {
    pub error: u32,
    pub pub_key: Vec<u8>,
    pub common_caps: Vec<u32>,
    pub channel_caps: Vec<u32>,
}

impl PeerLinkMessage {
    /// `pub_key_len` is the number of DER bytes expected to make up the
    /// `SubjectPublicKeyInfo`; per §6 implementers must accept the peer's
    /// advertised length rather than hard-coding 162.
    pub fn deserialize_from(buf: &[u8], pub_key_len: usize) -> Result<Self> {
        if buf.len() < 4 + pub_key_len {
            return Err("buffer too short to deserialize PeerLinkMessage")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        let error = LittleEndian::read_u32(&buf[0..4]);
        let pub_key = buf[4..4 + pub_key_len].to_vec();
        let rest = &buf[4 + pub_key_len..];
        if error != link_error::OK {
            return Ok(PeerLinkMessage {
                error,
                pub_key,
                common_caps: Vec::new(),
                channel_caps: Vec::new(),
            });
        }
        if rest.len() < 14 {
            // Capability section may legitimately be absent on an error
            // reply; for OK replies we require it.
            return Err("missing capability section in PeerLinkMessage")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        let num_common = LittleEndian::read_u32(&rest[2..6]) as usize;
        let num_channel = LittleEndian::read_u32(&rest[6..10]) as usize;
        let caps_offset = LittleEndian::read_u32(&rest[10..14]) as usize;
        let common_caps = read_u32_array(rest, caps_offset, num_common)?;
        let channel_caps = read_u32_array(rest, caps_offset + 4 * num_common, num_channel)?;
        Ok(PeerLinkMessage { error, pub_key, common_caps, channel_caps })
    }
}

fn read_u32_array(buf: &[u8], offset: usize, count: usize) -> Result<Vec<u32>> {
    let end = offset
        .checked_add(4 * count)
        .ok_or_else(|| Error::simple(ErrorKind::CommunicationMessage))?;
    if end > buf.len() {
        return Err("capability array out of bounds")
            .wrapped(ErrorKind::CommunicationMessage);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = offset + 4 * i;
        out.push(LittleEndian::read_u32(&buf[off..off + 4]));
    }
    Ok(out)
}

/// Steady-state frame header: precedes every application payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DataHeader {
    pub serial: u64,
    pub msg_type: u16,
    pub size: u32,
    /// Byte offset, within the payload, of a `SubMessageList`; zero if
    /// there are no sub-messages.
    pub sub_list: u32,
}

impl DataHeader {
    pub const LENGTH: usize = 18;

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to serialize DataHeader")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        LittleEndian::write_u64(&mut buf[0..8], self.serial);
        LittleEndian::write_u16(&mut buf[8..10], self.msg_type);
        LittleEndian::write_u32(&mut buf[10..14], self.size);
        LittleEndian::write_u32(&mut buf[14..18], self.sub_list);
        Ok(())
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to deserialize DataHeader")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(DataHeader {
            serial: LittleEndian::read_u64(&buf[0..8]),
            msg_type: LittleEndian::read_u16(&buf[8..10]),
            size: LittleEndian::read_u32(&buf[10..14]),
            sub_list: LittleEndian::read_u32(&buf[14..18]),
        })
    }
}

/// One entry produced by walking a `SubMessageList`: the sub-message's
/// type and its body, as a slice borrowed from the parent's payload.
#[derive(Debug, Copy, Clone)]
pub struct SubMessageRef<'a> {
    pub msg_type: u16,
    pub body: &'a [u8],
}

/// Walks the `SubMessageList` at `sub_list_offset` within `payload` and
/// returns the sub-messages in listed order.
///
/// Every sub-offset must lie within `[0, payload.len())` and each
/// sub-message's declared `size` must fit within the payload, per §8's
/// invariant on sub-message bounds; violations are rejected with
/// `ErrorKind::Protocol`.
pub fn walk_sub_messages(payload: &[u8], sub_list_offset: u32) -> Result<Vec<SubMessageRef<'_>>> {
    let offset = sub_list_offset as usize;
    if offset + 2 > payload.len() {
        return Err("sub-message list offset out of bounds")
            .wrapped(ErrorKind::Protocol);
    }
    let count = LittleEndian::read_u16(&payload[offset..offset + 2]) as usize;
    let offsets_start = offset + 2;
    let offsets_end = offsets_start
        .checked_add(4 * count)
        .ok_or_else(|| Error::simple(ErrorKind::Protocol))?;
    if offsets_end > payload.len() {
        return Err("sub-message offset table out of bounds")
            .wrapped(ErrorKind::Protocol);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = offsets_start + 4 * i;
        let sub_offset = LittleEndian::read_u32(&payload[off..off + 4]) as usize;
        if sub_offset + 6 > payload.len() {
            return Err("sub-message header out of bounds")
                .wrapped(ErrorKind::Protocol);
        }
        let msg_type = LittleEndian::read_u16(&payload[sub_offset..sub_offset + 2]);
        let size = LittleEndian::read_u32(&payload[sub_offset + 2..sub_offset + 6]) as usize;
        let body_start = sub_offset + 6;
        let body_end = body_start
            .checked_add(size)
            .ok_or_else(|| Error::simple(ErrorKind::Protocol))?;
        if body_end > payload.len() {
            return Err("sub-message body exceeds payload bounds")
                .wrapped(ErrorKind::Protocol);
        }
        out.push(SubMessageRef { msg_type, body: &payload[body_start..body_end] });
    }
    Ok(out)
}
