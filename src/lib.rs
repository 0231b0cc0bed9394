//! `redq` is a client library for a remote-desktop protocol: it speaks the
//! versioned handshake, RSA/OAEP password authentication, and length-
//! prefixed message framing used to multiplex a main control channel plus
//! display, cursor, input and audio-playback channels over one server
//! connection identity.
//!
//! The crate is organized around the components of its channel state
//! machine: [`marshaller`] and [`envelope`] build and track messages,
//! [`transport`] moves their bytes over a plain or TLS socket, [`channel`]
//! drives the per-channel handshake and steady-state pump, [`session`]
//! owns the channel registry and connection identity, and [`reactor`]
//! is the non-blocking readiness notifier tying it all to one thread.
//!
//! Concurrency is deliberately *not* `async`: every channel is driven by
//! readability callbacks on a single reactor thread (see `channel::Channel`
//! and DESIGN.md for why).

pub mod channel;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handlers;
pub mod marshaller;
pub mod message;
pub mod parser;
pub mod reactor;
pub mod session;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks whether [`init`] has already run.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the one-time global init (currently empty: `rustls`
/// and `mio` need no process-wide setup).
#[derive(Default)]
pub struct InitConfig {}

/// Handle to the library's global state. Dropping it tears the state back
/// down, so an embedder typically holds it for the process lifetime.
pub struct InitGuard;

impl Drop for InitGuard {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::SeqCst);
    }
}

/// Initializes process-wide state. Safe to call more than once: later
/// calls are a no-op and return `None`.
pub fn init(_c: InitConfig) -> error::Result<Option<InitGuard>> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }
    Ok(Some(InitGuard))
}
