//! DISPLAY channel stub: rendering framebuffer updates is an out-of-scope
//! external collaborator (§1). This handler only proves `channel_up`/
//! `handle_msg` are reachable for the channel class; it logs and drops.

use super::Handler;
use crate::channel::Channel;
use crate::envelope::InboundMessage;
use crate::error::Result;

#[derive(Default)]
pub struct DisplayHandler;

impl Handler for DisplayHandler {
    fn channel_up(&mut self, channel: &mut Channel) -> Result<()> {
        log::info!("{}: ready", channel.name());
        Ok(())
    }

    fn handle_msg(&mut self, channel: &mut Channel, msg: &InboundMessage) -> Result<()> {
        log::trace!(
            "{}: dropping display message type {} ({} bytes)",
            channel.name(),
            msg.header().msg_type,
            msg.payload().len(),
        );
        Ok(())
    }
}
