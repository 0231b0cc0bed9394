//! Reference-counted inbound/outbound message envelopes (component C).
//!
//! `InboundMessage` wraps either an owned byte buffer (a top-level frame)
//! or a borrowed range into a parent's buffer (a sub-message); both cases
//! share the same `Rc<Vec<u8>>`, so the bytes stay alive for as long as
//! any child (or the top-level message itself) is still referenced —
//! this is what makes "releasing a parent before its last sub-child" an
//! impossible state rather than a rule the caller has to remember.
//!
//! `OutboundMessage` couples a `Marshaller` with the reserved `DataHeader`
//! slot, finalized exactly once, right before the bytes hit the wire.

use std::any::Any;
use std::cell::RefCell;
use std::ops::Range;
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::error::*;
use crate::marshaller::{Marshaller, Reservation};
use crate::message::DataHeader;

struct InboundInner {
    header: DataHeader,
    bytes: Rc<Vec<u8>>,
    range: Range<usize>,
    parent: Option<InboundMessage>,
    parsed: RefCell<Option<Box<dyn Any>>>,
}

/// A parsed (or parseable) inbound frame: either a top-level message
/// owning its bytes, or a sub-message borrowing a range of its parent's.
#[derive(Clone)]
pub struct InboundMessage {
    inner: Rc<InboundInner>,
}

impl InboundMessage {
    /// Wraps a freshly-read top-level frame.
    pub fn top_level(header: DataHeader, bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        let bytes = Rc::new(bytes);
        InboundMessage {
            inner: Rc::new(InboundInner {
                header,
                bytes,
                range: 0..len,
                parent: None,
                parsed: RefCell::new(None),
            }),
        }
    }

    /// Wraps a sub-message, borrowing `range` of `parent`'s payload bytes
    /// and holding a strong reference to `parent` so it cannot be dropped
    /// out from under the child.
    pub fn sub_message(parent: &InboundMessage, msg_type: u16, range: Range<usize>) -> Self {
        let header = DataHeader {
            serial: parent.inner.header.serial,
            msg_type,
            size: (range.end - range.start) as u32,
            sub_list: 0,
        };
        InboundMessage {
            inner: Rc::new(InboundInner {
                header,
                bytes: Rc::clone(&parent.inner.bytes),
                range,
                parent: Some(parent.clone()),
                parsed: RefCell::new(None),
            }),
        }
    }

    pub fn header(&self) -> DataHeader {
        self.inner.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.bytes[self.inner.range.clone()]
    }

    /// The parent of a sub-message, or `None` for a top-level message.
    pub fn parent(&self) -> Option<&InboundMessage> {
        self.inner.parent.as_ref()
    }

    pub fn is_sub_message(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// Stores the parsed payload value produced by the parser registry.
    /// Dropping the value (on the next `set_parsed`, or when the envelope
    /// itself is dropped) is this crate's release-callback equivalent —
    /// there's no separate function pointer to invoke.
    pub fn set_parsed(&self, value: Box<dyn Any>) {
        *self.inner.parsed.borrow_mut() = Some(value);
    }

    /// Runs `f` with the parsed payload downcast to `T`, if present and of
    /// the right type.
    pub fn with_parsed<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.inner.parsed.borrow();
        guard.as_ref().and_then(|b| b.downcast_ref::<T>()).map(f)
    }

    /// Number of strong references to the underlying byte buffer —
    /// exposed for tests asserting the parent-stays-alive invariant.
    pub fn buffer_refcount(&self) -> usize {
        Rc::strong_count(&self.inner.bytes)
    }
}

struct OutboundInner {
    channel: Weak<RefCell<Channel>>,
    marshaller: RefCell<Marshaller>,
    header_reservation: Reservation,
    finalized: RefCell<bool>,
}

/// An outbound frame under construction: a marshaller plus the reserved
/// `DataHeader` slot, to be finalized once the payload is fully written.
#[derive(Clone)]
pub struct OutboundMessage {
    inner: Rc<OutboundInner>,
}

impl OutboundMessage {
    pub fn new(channel: Weak<RefCell<Channel>>, mut marshaller: Marshaller) -> Result<Self> {
        let header_reservation = marshaller.reserve(DataHeader::LENGTH)?;
        marshaller.set_base(DataHeader::LENGTH);
        Ok(OutboundMessage {
            inner: Rc::new(OutboundInner {
                channel,
                marshaller: RefCell::new(marshaller),
                header_reservation,
                finalized: RefCell::new(false),
            }),
        })
    }

    pub fn marshaller_mut(&self) -> std::cell::RefMut<'_, Marshaller> {
        self.inner.marshaller.borrow_mut()
    }

    pub fn channel(&self) -> Option<Rc<RefCell<Channel>>> {
        self.inner.channel.upgrade()
    }

    /// Finalizes `header.size` to the marshaller's body size and writes
    /// the header into its reserved slot. May only be called once; a
    /// second call is a programmer error (the invariant in §3 on
    /// `OutboundMessage`).
    pub fn finalize(&self, serial: u64, msg_type: u16, sub_list: u32) -> Result<()> {
        let mut finalized = self.inner.finalized.borrow_mut();
        assert!(!*finalized, "OutboundMessage::finalize called twice");
        let mut marshaller = self.inner.marshaller.borrow_mut();
        let header = DataHeader {
            serial,
            msg_type,
            size: marshaller.total_size() as u32,
            sub_list,
        };
        let mut buf = [0u8; DataHeader::LENGTH];
        header.serialize_into(&mut buf)?;
        marshaller.patch(self.inner.header_reservation, &buf);
        *finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        *self.inner.finalized.borrow()
    }

    /// The finished, contiguous wire bytes. Panics if called before
    /// `finalize`.
    pub fn linearize(&self) -> Vec<u8> {
        assert!(self.is_finalized(), "linearize called before finalize");
        self.inner.marshaller.borrow().linearize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{walk_sub_messages, DataHeader};

    #[test]
    fn sub_message_keeps_parent_alive() {
        let header = DataHeader { serial: 1, msg_type: 9, size: 3, sub_list: 0 };
        let parent = InboundMessage::top_level(header, vec![1, 2, 3]);
        assert_eq!(parent.buffer_refcount(), 1);
        let child = InboundMessage::sub_message(&parent, 5, 0..2);
        assert_eq!(parent.buffer_refcount(), 2);
        assert_eq!(child.payload(), &[1, 2]);
        drop(parent);
        // the child's strong ref to its parent keeps the buffer alive
        assert_eq!(child.payload(), &[1, 2]);
    }

    #[test]
    fn outbound_finalize_sets_size_once() {
        // `OutboundMessage::new` reserves and bases the header slot itself;
        // the marshaller handed in should be untouched.
        let m = Marshaller::new();
        let out = OutboundMessage::new(Weak::new(), m).unwrap();
        out.marshaller_mut().write(b"payload").unwrap();
        out.finalize(1, 7, 0).unwrap();
        assert!(out.is_finalized());
        let bytes = out.linearize();
        let parsed = DataHeader::deserialize_from(&bytes).unwrap();
        assert_eq!(parsed.size, 7);
        assert_eq!(parsed.serial, 1);
        assert_eq!(&bytes[DataHeader::LENGTH..], b"payload");
    }

    #[test]
    #[should_panic(expected = "finalize called twice")]
    fn outbound_finalize_twice_panics() {
        let m = Marshaller::new();
        let out = OutboundMessage::new(Weak::new(), m).unwrap();
        out.finalize(1, 0, 0).unwrap();
        out.finalize(1, 0, 0).unwrap();
    }

    #[test]
    fn walk_sub_messages_matches_envelope_construction() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&6u32.to_le_bytes());
        payload.extend_from_slice(&3u16.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(b"hi");
        let header = DataHeader { serial: 1, msg_type: 0, size: payload.len() as u32, sub_list: 0 };
        let parent = InboundMessage::top_level(header, payload);
        let subs = walk_sub_messages(parent.payload(), 0).unwrap();
        assert_eq!(subs.len(), 1);
        let body_start = parent.payload().len() - subs[0].body.len();
        let child = InboundMessage::sub_message(
            &parent,
            subs[0].msg_type,
            body_start..parent.payload().len(),
        );
        assert_eq!(child.payload(), b"hi");
    }
}
