//! CURSOR channel stub; see `display` for why this just logs and drops.

use super::Handler;
use crate::channel::Channel;
use crate::envelope::InboundMessage;
use crate::error::Result;

#[derive(Default)]
pub struct CursorHandler;

impl Handler for CursorHandler {
    fn channel_up(&mut self, channel: &mut Channel) -> Result<()> {
        log::info!("{}: ready", channel.name());
        Ok(())
    }

    fn handle_msg(&mut self, channel: &mut Channel, msg: &InboundMessage) -> Result<()> {
        log::trace!(
            "{}: dropping cursor message type {} ({} bytes)",
            channel.name(),
            msg.header().msg_type,
            msg.payload().len(),
        );
        Ok(())
    }
}
