//! MAIN channel handler: the only channel-class hook this crate's core
//! tests drive to completion, since it's also where the server announces
//! the connection id and ACK window (§9's resolved open question).

use super::Handler;
use crate::channel::Channel;
use crate::envelope::InboundMessage;
use crate::error::Result;
use crate::parser::{MainInit, MSG_MAIN_ATTACH_CHANNELS, MSG_MAIN_INIT};

#[derive(Default)]
pub struct MainHandler;

impl Handler for MainHandler {
    fn channel_up(&mut self, channel: &mut Channel) -> Result<()> {
        log::info!("{}: attaching channels", channel.name());
        channel.send_message(MSG_MAIN_ATTACH_CHANNELS, &[])
    }

    fn handle_msg(&mut self, channel: &mut Channel, msg: &InboundMessage) -> Result<()> {
        if msg.header().msg_type != MSG_MAIN_INIT {
            log::trace!("{}: ignoring main message type {}", channel.name(), msg.header().msg_type);
            return Ok(());
        }
        let init = msg
            .with_parsed::<MainInit, _>(|init| *init)
            .ok_or_else(|| {
                crate::error::Error::simple(crate::error::ErrorKind::Protocol)
            })?;
        log::debug!(
            "{}: server announced connection_id={} ack_window={}",
            channel.name(),
            init.connection_id,
            init.ack_window,
        );
        channel.set_ack_window(init.ack_window);
        channel.announce_connection_id(init.connection_id);
        Ok(())
    }
}
