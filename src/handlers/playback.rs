//! PLAYBACK channel stub; see `display` for why this just logs and drops.

use super::Handler;
use crate::channel::Channel;
use crate::envelope::InboundMessage;
use crate::error::Result;

#[derive(Default)]
pub struct PlaybackHandler;

impl Handler for PlaybackHandler {
    fn channel_up(&mut self, channel: &mut Channel) -> Result<()> {
        log::info!("{}: ready", channel.name());
        Ok(())
    }

    fn handle_msg(&mut self, channel: &mut Channel, msg: &InboundMessage) -> Result<()> {
        log::trace!(
            "{}: dropping playback message type {} ({} bytes)",
            channel.name(),
            msg.header().msg_type,
            msg.payload().len(),
        );
        Ok(())
    }
}
