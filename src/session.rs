//! Session (component F): owns connection identity, password and CA
//! material, the channel registry, and the reactor every channel shares.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::ServerCertVerifier;

use crate::channel::{Channel, ChannelKind};
use crate::config::SessionConfig;
use crate::crypto::HostnameVerifier;
use crate::error::*;
use crate::events::ChannelEvent;
use crate::reactor::Reactor;

pub struct Session {
    config: SessionConfig,
    reactor: Reactor,
    connection_id: u32,
    channels: HashMap<(u8, u8), Rc<RefCell<Channel>>>,
    verifier: Arc<dyn ServerCertVerifier>,
    on_event: Option<Box<dyn FnMut(ChannelKind, u8, ChannelEvent)>>,
    on_channel_created: Option<Box<dyn FnMut(Rc<RefCell<Channel>>)>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Rc<RefCell<Session>>> {
        let ca_pem = match &config.ca_file {
            Some(path) => Some(std::fs::read(path).wrapped(ErrorKind::Communication)?),
            None => None,
        };
        let verifier = HostnameVerifier::from_ca_pem_or_platform(ca_pem.as_deref())?;
        let reactor = Reactor::new().wrapped(ErrorKind::Communication)?;

        Ok(Rc::new(RefCell::new(Session {
            config,
            reactor,
            connection_id: 0,
            channels: HashMap::new(),
            verifier: Arc::new(verifier),
            on_event: None,
            on_channel_created: None,
        })))
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn password(&self) -> &str {
        &self.config.password
    }

    pub fn ack_window(&self) -> u32 {
        self.config.ack_window
    }

    pub fn connect_retries(&self) -> usize {
        self.config.connect_retries.max(1)
    }

    pub fn read_chunk(&self) -> usize {
        self.config.read_chunk.max(1)
    }

    pub fn cert_verifier(&self) -> Arc<dyn ServerCertVerifier> {
        Arc::clone(&self.verifier)
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub fn get_connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Stamps the connection id the first time it is announced; every
    /// channel in the session shares it from then on (§3's invariant).
    pub fn set_connection_id(&mut self, id: u32) {
        if self.connection_id == 0 {
            self.connection_id = id;
        }
    }

    /// Opens a TCP connection to the session's host, on the TLS port if
    /// `use_tls` and one is configured, otherwise the plain port.
    pub fn channel_connect(&mut self, use_tls: bool) -> Result<TcpStream> {
        let port = if use_tls {
            self.config.tls_port.unwrap_or(self.config.port)
        } else {
            self.config.port
        };
        TcpStream::connect((self.config.host.as_str(), port)).wrapped(ErrorKind::Connect)
    }

    pub fn set_event_handler(&mut self, f: impl FnMut(ChannelKind, u8, ChannelEvent) + 'static) {
        self.on_event = Some(Box::new(f));
    }

    pub fn set_channel_created_handler(&mut self, f: impl FnMut(Rc<RefCell<Channel>>) + 'static) {
        self.on_channel_created = Some(Box::new(f));
    }

    pub fn emit_event(&mut self, kind: ChannelKind, channel_id: u8, event: ChannelEvent) {
        if let Some(cb) = self.on_event.as_mut() {
            cb(kind, channel_id, event);
        }
    }

    /// Creates and registers a new channel of `kind`/`channel_id`, notifying
    /// the embedder so it can attach additional behavior (§4.4).
    pub fn channel_new(session: &Rc<RefCell<Session>>, kind: ChannelKind, channel_id: u8) -> Rc<RefCell<Channel>> {
        let ack_window = session.borrow().ack_window();
        let channel = Channel::new(Rc::downgrade(session), kind, channel_id, ack_window);
        {
            let mut s = session.borrow_mut();
            s.channels.insert((kind.wire_type(), channel_id), Rc::clone(&channel));
            if let Some(cb) = s.on_channel_created.as_mut() {
                cb(Rc::clone(&channel));
            }
        }
        channel
    }

    pub fn channel_destroy(&mut self, kind: ChannelKind, channel_id: u8) {
        if let Some(channel) = self.channels.remove(&(kind.wire_type(), channel_id)) {
            channel.borrow_mut().disconnect(true);
        }
    }

    pub fn get_channels(&self) -> Vec<Rc<RefCell<Channel>>> {
        self.channels.values().cloned().collect()
    }

    /// Runs the reactor for at most `timeout`, dispatching any readiness
    /// events to their channel's `on_readable`.
    ///
    /// Takes `session` as an `Rc` rather than `&mut self`: polling only
    /// needs a brief mutable borrow, but a channel's `on_readable` re-enters
    /// this same session (reading the password, emitting an event,
    /// announcing a connection id, ...), so the borrow from this call must
    /// be released before dispatch, or the reentrant borrow panics.
    pub fn run_once(session: &Rc<RefCell<Session>>, timeout: Option<Duration>) -> Result<()> {
        let ready = session.borrow_mut().reactor.poll_ready(timeout)?;
        for target in ready {
            target.borrow_mut().on_readable();
        }
        Ok(())
    }
}
