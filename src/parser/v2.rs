//! Current (major version 2) parser table. See `v1` for why this is a
//! separate type rather than a shared constant.

use std::any::Any;

use super::{parse_common, Parser};
use crate::channel::ChannelKind;
use crate::error::Result;

pub struct V2Parser;

pub static PARSER: V2Parser = V2Parser;

impl Parser for V2Parser {
    fn parse(&self, kind: ChannelKind, msg_type: u16, minor: u32, bytes: &[u8]) -> Result<Box<dyn Any>> {
        parse_common(kind, msg_type, minor, bytes)
    }
}
