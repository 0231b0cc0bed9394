//! Abstract readiness notifier (component G): register an fd-like source
//! with an interest, get a callback when it becomes readable, cancel.
//!
//! Backed by `mio`, a non-blocking multiplexer, rather than an async
//! runtime — see DESIGN.md for why.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::error::*;

/// Anything that can be driven by readability events. `Channel` is the
/// only implementor in this crate, but keeping the reactor generic over
/// this trait (rather than hard-coding `Channel`) keeps this component
/// honestly abstract.
pub trait Readable {
    fn on_readable(&mut self);
}

/// A single registered watch: the readable callback target, kept alive
/// only as long as something else (typically a `Session`) still owns the
/// channel.
struct Watch {
    target: Weak<RefCell<dyn Readable>>,
}

/// The readiness reactor driving every channel in a session.
pub struct Reactor {
    poll: Poll,
    events: Events,
    watches: HashMap<Token, Watch>,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().wrapped(ErrorKind::Io)?;
        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            watches: HashMap::new(),
            next_token: 0,
        })
    }

    /// Registers `source` for readability events, invoking `target`'s
    /// `on_readable` whenever it fires. Returns the `Token` to use with
    /// `cancel`.
    pub fn register(
        &mut self,
        source: &mut impl mio::event::Source,
        target: Weak<RefCell<dyn Readable>>,
    ) -> Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)
            .wrapped(ErrorKind::Io)?;
        self.watches.insert(token, Watch { target });
        Ok(token)
    }

    /// Cancels a previously registered watch. Idempotent: canceling a
    /// token twice, or one that was never registered, is a no-op.
    pub fn cancel(&mut self, token: Token, source: &mut impl mio::event::Source) {
        let _ = self.poll.registry().deregister(source);
        self.watches.remove(&token);
    }

    /// Blocks (up to `timeout`, or forever if `None`) waiting for
    /// readiness, then returns the live targets that fired, pruning any
    /// watch whose target has since been dropped.
    ///
    /// Deliberately does not invoke the callbacks itself: a caller that
    /// reaches this through a `RefCell` (e.g. `Session::run_once`) needs to
    /// release that borrow before dispatch, since a callback may re-enter
    /// the same `RefCell`.
    pub fn poll_ready(&mut self, timeout: Option<Duration>) -> Result<Vec<Rc<RefCell<dyn Readable>>>> {
        self.poll.poll(&mut self.events, timeout).wrapped(ErrorKind::Io)?;
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        let mut ready = Vec::with_capacity(tokens.len());
        for token in tokens {
            let target = match self.watches.get(&token) {
                Some(w) => w.target.clone(),
                None => continue,
            };
            match target.upgrade() {
                Some(rc) => ready.push(rc),
                None => {
                    self.watches.remove(&token);
                }
            }
        }
        Ok(ready)
    }

    /// Polls and dispatches in one step. Only safe for a caller that does
    /// not itself sit behind a `RefCell` a callback could re-enter (see
    /// `poll_ready`) — this crate's own driver is `Session::run_once`.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        for target in self.poll_ready(timeout)? {
            target.borrow_mut().on_readable();
        }
        Ok(())
    }

    /// Runs `run_once` in a loop until every watch has been canceled, or
    /// `deadline_per_wait` elapses with nothing ready and no watches left.
    pub fn run_until_idle(&mut self, timeout: Option<Duration>) -> Result<()> {
        while !self.watches.is_empty() {
            self.run_once(timeout)?;
        }
        Ok(())
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        hits: usize,
    }

    impl Readable for Counter {
        fn on_readable(&mut self) {
            self.hits += 1;
        }
    }

    #[test]
    fn dropped_target_prunes_watch_on_next_fire() {
        use mio::net::{TcpListener, TcpStream};
        use std::net::SocketAddr;

        let mut reactor = Reactor::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(local).unwrap();

        let target: Rc<RefCell<dyn Readable>> = Rc::new(RefCell::new(Counter { hits: 0 }));
        let token = reactor.register(&mut stream, Rc::downgrade(&target)).unwrap();
        assert_eq!(reactor.watch_count(), 1);

        reactor.cancel(token, &mut stream);
        assert_eq!(reactor.watch_count(), 0);
        let _ = listener.accept();
    }
}
