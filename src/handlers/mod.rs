//! Channel-class dispatch (component H): five concrete variants, each
//! supplying `channel_up` (called once on entering READY) and `handle_msg`
//! (called per inbound message, including every sub-message before the
//! parent). The core only ever calls through this trait plus the variant
//! tag used to construct the right implementation — no dynamic type
//! tests, per §9's "object-type dispatch" note.

pub mod cursor;
pub mod display;
pub mod inputs;
pub mod main;
pub mod playback;

use crate::channel::Channel;
use crate::envelope::InboundMessage;
use crate::error::Result;

pub trait Handler {
    fn channel_up(&mut self, channel: &mut Channel) -> Result<()>;
    fn handle_msg(&mut self, channel: &mut Channel, msg: &InboundMessage) -> Result<()>;
}
