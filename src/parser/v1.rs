//! Legacy (major version 1) parser table.
//!
//! Kept structurally distinct from `v2` so a real protocol revision could
//! diverge here without disturbing the current table — for now the two
//! agree, since this crate's parsers only ever decode MAIN's own control
//! traffic (everything else is a pass-through, see `super::parse_common`).

use std::any::Any;

use super::{parse_common, Parser};
use crate::channel::ChannelKind;
use crate::error::Result;

pub struct V1Parser;

pub static PARSER: V1Parser = V1Parser;

impl Parser for V1Parser {
    fn parse(&self, kind: ChannelKind, msg_type: u16, minor: u32, bytes: &[u8]) -> Result<Box<dyn Any>> {
        parse_common(kind, msg_type, minor, bytes)
    }
}
