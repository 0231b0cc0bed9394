//! Channel state machine (component E) — the core of this crate. Drives
//! one logical protocol stream through TLS handshake, link negotiation,
//! RSA authentication, and the steady-state message pump, all from a
//! single readability callback (§4.5).

use std::cell::RefCell;
use std::convert::TryFrom;
use std::mem;
use std::rc::{Rc, Weak};

use byteorder::{ByteOrder, LittleEndian};
use mio::net::TcpStream as MioTcpStream;
use mio::Token;
use rustls::ServerName;

use crate::crypto;
use crate::envelope::{InboundMessage, OutboundMessage};
use crate::error::*;
use crate::events::ChannelEvent;
use crate::handlers::{cursor, display, inputs, main, playback, Handler};
use crate::marshaller::Marshaller;
use crate::message::{
    link_error, walk_sub_messages, DataHeader, LinkHeader, LinkMessage, PeerLinkMessage,
    LEGACY_MAJOR, MAGIC, MSGC_ACK,
};
use crate::parser;
use crate::reactor::Readable;
use crate::session::Session;
use crate::transport::{RecvOutcome, Transport};

/// Tagged channel-class variant (§4.6 / §9's "object-type dispatch" note).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ChannelKind {
    Main,
    Display,
    Cursor,
    Inputs,
    Playback,
}

impl ChannelKind {
    /// The channel-type byte placed in `LinkMessage`.
    pub fn wire_type(self) -> u8 {
        match self {
            ChannelKind::Main => 1,
            ChannelKind::Display => 2,
            ChannelKind::Inputs => 3,
            ChannelKind::Cursor => 4,
            ChannelKind::Playback => 5,
        }
    }

    fn make_handler(self) -> Box<dyn Handler> {
        match self {
            ChannelKind::Main => Box::new(main::MainHandler::default()),
            ChannelKind::Display => Box::new(display::DisplayHandler::default()),
            ChannelKind::Cursor => Box::new(cursor::CursorHandler::default()),
            ChannelKind::Inputs => Box::new(inputs::InputsHandler::default()),
            ChannelKind::Playback => Box::new(playback::PlaybackHandler::default()),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelKind::Main => "main",
            ChannelKind::Display => "display",
            ChannelKind::Cursor => "cursor",
            ChannelKind::Inputs => "inputs",
            ChannelKind::Playback => "playback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Unconnected,
    Tls,
    LinkHdr,
    LinkMsg,
    Auth,
    Ready,
}

/// Reads into `buf`, capping a single `recv` call at `read_chunk` bytes
/// (the session's configured read-buffer size) regardless of how much of
/// `buf` remains to be filled.
fn recv_chunked(transport: &mut Transport, read_chunk: usize, buf: &mut [u8]) -> Result<RecvOutcome> {
    let n = buf.len().min(read_chunk.max(1));
    transport.recv(&mut buf[..n])
}

/// In-progress inbound frame assembly: two cursors, per §4.5 steps 1-3.
struct InboundAssembly {
    header_buf: [u8; DataHeader::LENGTH],
    header_pos: usize,
    header: Option<DataHeader>,
    data_buf: Vec<u8>,
    data_pos: usize,
}

impl InboundAssembly {
    fn new() -> Self {
        InboundAssembly {
            header_buf: [0u8; DataHeader::LENGTH],
            header_pos: 0,
            header: None,
            data_buf: Vec::new(),
            data_pos: 0,
        }
    }

    fn reset(&mut self) {
        *self = InboundAssembly::new();
    }
}

pub struct Channel {
    session: Weak<RefCell<Session>>,
    self_weak: Weak<RefCell<Channel>>,
    kind: ChannelKind,
    channel_id: u8,
    name: String,
    state: State,
    transport: Option<Transport>,
    token: Option<Token>,
    use_tls: bool,
    major: u32,
    minor: u32,
    serial: u64,
    ack_window: u32,
    ack_remaining: u32,
    /// Upper bound on a single `recv` call's buffer slice, refreshed from
    /// the session's `SessionConfig::read_chunk` on every `connect`.
    read_chunk: usize,
    /// Set by `fail`, so `connect`'s retry loop can tell whether a deeper
    /// call (e.g. `send_link`) already emitted the terminal event for this
    /// attempt, instead of emitting it again.
    fail_emitted: bool,
    handler: Option<Box<dyn Handler>>,

    link_hdr_buf: [u8; LinkHeader::LENGTH],
    link_hdr_pos: usize,
    link_msg_buf: Vec<u8>,
    link_msg_pos: usize,
    auth_buf: [u8; 4],
    auth_pos: usize,
    assembly: InboundAssembly,
}

impl Channel {
    pub fn new(
        session: Weak<RefCell<Session>>,
        kind: ChannelKind,
        channel_id: u8,
        ack_window: u32,
    ) -> Rc<RefCell<Channel>> {
        let channel = Rc::new(RefCell::new(Channel {
            session,
            self_weak: Weak::new(),
            kind,
            channel_id,
            name: format!("{}:{}", kind, channel_id),
            state: State::Unconnected,
            transport: None,
            token: None,
            use_tls: false,
            major: crate::message::CURRENT_MAJOR,
            minor: crate::message::CURRENT_MINOR,
            serial: 1,
            ack_window,
            ack_remaining: ack_window,
            read_chunk: crate::config::DEFAULT_READ_CHUNK,
            fail_emitted: false,
            handler: Some(kind.make_handler()),
            link_hdr_buf: [0u8; LinkHeader::LENGTH],
            link_hdr_pos: 0,
            link_msg_buf: Vec::new(),
            link_msg_pos: 0,
            auth_buf: [0u8; 4],
            auth_pos: 0,
            assembly: InboundAssembly::new(),
        }));
        channel.borrow_mut().self_weak = Rc::downgrade(&channel);
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn session(&self) -> Result<Rc<RefCell<Session>>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::simple(ErrorKind::Communication))
    }

    /// Sets the ACK window announced by the server (§9's resolved open
    /// question on ACK cadence / connection id assignment), restarting the
    /// inbound countdown so the first ACK after announcement falls exactly
    /// `window` messages later rather than wherever the old window's
    /// countdown happened to be.
    pub fn set_ack_window(&mut self, window: u32) {
        self.ack_window = window.max(1);
        self.ack_remaining = self.ack_window;
    }

    pub fn announce_connection_id(&mut self, connection_id: u32) {
        if let Ok(session) = self.session() {
            session.borrow_mut().set_connection_id(connection_id);
        }
    }

    /// Emits `event` on the owning session, if it still exists.
    fn emit(&self, event: ChannelEvent) {
        if let Ok(session) = self.session() {
            session.borrow_mut().emit_event(self.kind, self.channel_id, event);
        }
    }

    /// Single choke point for a terminal failure: emits the mapped event,
    /// tears down the transport (without a redundant `Closed`), and
    /// returns the `Error` for the caller to propagate via `?`. Satisfies
    /// §7's "all errors surface as channel events and trigger a
    /// disconnect".
    fn fail(&mut self, kind: ErrorKind) -> Error {
        self.emit(ChannelEvent::from_error_kind(kind));
        self.teardown();
        self.fail_emitted = true;
        Error::simple(kind)
    }

    /// Cancels the registered watch and drops the transport, without
    /// touching `state` or emitting anything — shared by `fail` (caller
    /// sets state indirectly via the next `connect`) and `disconnect`.
    fn teardown(&mut self) {
        if let (Some(token), Ok(session)) = (self.token.take(), self.session()) {
            if let Some(transport) = self.transport.as_mut() {
                session.borrow_mut().reactor_mut().cancel(token, transport.source_mut());
            }
        }
        self.transport = None;
        self.state = State::Unconnected;
    }

    /// Public disconnect, callable from any handler or the embedder.
    /// Idempotent: tearing down an already-`Unconnected` channel is a
    /// no-op beyond the (suppressed) duplicate event.
    pub fn disconnect(&mut self, closed: bool) {
        let was_connected = self.state != State::Unconnected;
        self.teardown();
        if closed && was_connected {
            self.emit(ChannelEvent::Closed);
        }
    }

    // ---- connect procedure (§4.5) ------------------------------------

    /// Connects, retrying the same mode up to the session's configured
    /// `connect_retries` before, on a final plain-socket `ErrorConnect`,
    /// promoting to TLS and retrying there too (§4.5). A failure already
    /// reported by a deeper call (e.g. a short write during `send_link`)
    /// is propagated as-is rather than re-emitted.
    pub fn connect(&mut self, use_tls: bool) -> Result<()> {
        let retries = self.session().map(|s| s.borrow().connect_retries()).unwrap_or(1).max(1);

        let mut last_err = None;
        for _ in 0..retries {
            self.fail_emitted = false;
            match self.attempt_connect(use_tls) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        let e = last_err.expect("loop runs at least once since retries >= 1");

        if !use_tls && e.kind() == ErrorKind::Connect {
            return self.connect(true);
        }
        if self.fail_emitted {
            Err(e)
        } else {
            Err(self.fail(e.kind()))
        }
    }

    fn attempt_connect(&mut self, use_tls: bool) -> Result<()> {
        self.reset_handshake_state();
        let session_rc = self.session().map_err(|e| e.swap_kind(ErrorKind::Connect))?;
        self.read_chunk = session_rc.borrow().read_chunk();

        let std_stream = session_rc.borrow_mut().channel_connect(use_tls)?;
        std_stream.set_nonblocking(true).wrapped(ErrorKind::Connect)?;
        let mio_stream = MioTcpStream::from_std(std_stream);

        self.use_tls = use_tls;
        let mut transport = if use_tls {
            let host = session_rc.borrow().host().to_string();
            let server_name = ServerName::try_from(host.as_str()).wrapped(ErrorKind::Tls)?;
            let verifier = session_rc.borrow().cert_verifier();
            let config = crypto::client_config(verifier);
            Transport::tls(mio_stream, server_name, config)?
        } else {
            Transport::plain(mio_stream)
        };

        let weak_dyn: Weak<RefCell<dyn Readable>> = self.self_weak.clone();
        let token = session_rc
            .borrow_mut()
            .reactor_mut()
            .register(transport.source_mut(), weak_dyn)
            .map_err(|e| e.swap_kind(ErrorKind::Connect))?;
        self.token = Some(token);
        self.transport = Some(transport);

        if use_tls {
            self.state = State::Tls;
            self.drive_tls_handshake()
        } else {
            self.state = State::LinkHdr;
            self.send_link()
        }
    }

    fn reset_handshake_state(&mut self) {
        self.link_hdr_pos = 0;
        self.link_msg_buf.clear();
        self.link_msg_pos = 0;
        self.auth_pos = 0;
        self.assembly.reset();
    }

    fn drive_tls_handshake(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().expect("connect() sets transport");
        match transport.drive_handshake() {
            Ok(true) => {
                self.state = State::LinkHdr;
                self.send_link()
            }
            Ok(false) => Ok(()),
            Err(e) => Err(self.fail(e.kind())),
        }
    }

    // ---- send-link (§4.5) --------------------------------------------

    fn send_link(&mut self) -> Result<()> {
        let connection_id = self.session()?.borrow().get_connection_id();

        let link_msg = LinkMessage::new(connection_id, self.kind.wire_type(), self.channel_id);
        let header = LinkHeader::new(self.major, self.minor, link_msg.wire_len() as u32);

        let mut buf = vec![0u8; LinkHeader::LENGTH + link_msg.wire_len()];
        header.serialize_into(&mut buf[..LinkHeader::LENGTH])?;
        link_msg.serialize_into(&mut buf[LinkHeader::LENGTH..])?;

        self.state = State::LinkHdr;
        self.transport_send_all(&buf)
    }

    /// Sends `buf` in full. Per §4.3 a short write (or one that would
    /// block) is a fatal `ErrorIo`, since this design does not queue.
    fn transport_send_all(&mut self, buf: &[u8]) -> Result<()> {
        let n = {
            let transport = self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
            transport.send(buf)?
        };
        if n == buf.len() {
            Ok(())
        } else {
            Err(self.fail(ErrorKind::Io))
        }
    }

    // ---- readiness dispatch (§4.5) ------------------------------------

    fn step(&mut self) -> Result<()> {
        match self.state {
            State::Unconnected => Ok(()),
            State::Tls => self.drive_tls_handshake(),
            State::LinkHdr => self.recv_link_header(),
            State::LinkMsg => self.recv_link_message(),
            State::Auth => self.recv_auth(),
            State::Ready => self.pump_ready(),
        }
    }

    fn recv_link_header(&mut self) -> Result<()> {
        loop {
            if self.link_hdr_pos >= LinkHeader::LENGTH {
                break;
            }
            let pos = self.link_hdr_pos;
            let outcome = {
                let transport = self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
                recv_chunked(transport, self.read_chunk, &mut self.link_hdr_buf[pos..])?
            };
            match outcome {
                RecvOutcome::WouldBlock => return Ok(()),
                RecvOutcome::Eof => {
                    self.disconnect(true);
                    return Ok(());
                }
                RecvOutcome::Read(n) => self.link_hdr_pos += n,
            }
        }

        let header = LinkHeader::deserialize_from(&self.link_hdr_buf)?;
        if header.magic != MAGIC {
            return Err(self.fail(ErrorKind::Link));
        }
        if header.major_version != self.major {
            if header.major_version == LEGACY_MAJOR {
                // Silent downgrade-and-reconnect: no event, per §4.5/§8 S3.
                self.major = LEGACY_MAJOR;
                let use_tls = self.use_tls;
                self.disconnect(false);
                return self.connect(use_tls);
            }
            return Err(self.fail(ErrorKind::Link));
        }

        self.minor = header.minor_version;
        self.link_msg_buf = vec![0u8; header.size as usize];
        self.link_msg_pos = 0;
        self.state = State::LinkMsg;
        self.recv_link_message()
    }

    fn recv_link_message(&mut self) -> Result<()> {
        loop {
            if self.link_msg_pos >= self.link_msg_buf.len() {
                break;
            }
            let pos = self.link_msg_pos;
            let outcome = {
                let transport = self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
                recv_chunked(transport, self.read_chunk, &mut self.link_msg_buf[pos..])?
            };
            match outcome {
                RecvOutcome::WouldBlock => return Ok(()),
                RecvOutcome::Eof => {
                    self.disconnect(true);
                    return Ok(());
                }
                RecvOutcome::Read(n) => self.link_msg_pos += n,
            }
        }

        // The wire only carries the peer's total link-message size; since
        // capability arrays are always empty (§9), the DER key occupies
        // everything past the fixed `error` field and capability header.
        let pub_key_len = self.link_msg_buf.len().saturating_sub(18);
        let peer = PeerLinkMessage::deserialize_from(&self.link_msg_buf, pub_key_len)?;

        match peer.error {
            link_error::OK => {}
            link_error::NEED_SECURED => {
                if self.use_tls {
                    // a second NEED_SECURED under TLS is fatal, per §8.
                    return Err(self.fail(ErrorKind::Link));
                }
                self.disconnect(false);
                return self.connect(true);
            }
            _ => return Err(self.fail(ErrorKind::Link)),
        }

        let pub_key = crypto::parse_public_key(&peer.pub_key).map_err(|e| self.fail(e.kind()))?;
        self.state = State::Auth;
        self.send_auth(&pub_key)
    }

    fn send_auth(&mut self, pub_key: &rsa::RsaPublicKey) -> Result<()> {
        let password = self.session()?.borrow().password().to_string();
        let ciphertext = crypto::encrypt_password(pub_key, &password).map_err(|e| self.fail(e.kind()))?;
        self.auth_pos = 0;
        self.transport_send_all(&ciphertext)
    }

    fn recv_auth(&mut self) -> Result<()> {
        loop {
            if self.auth_pos >= self.auth_buf.len() {
                break;
            }
            let pos = self.auth_pos;
            let outcome = {
                let transport = self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
                recv_chunked(transport, self.read_chunk, &mut self.auth_buf[pos..])?
            };
            match outcome {
                RecvOutcome::WouldBlock => return Ok(()),
                RecvOutcome::Eof => {
                    self.disconnect(true);
                    return Ok(());
                }
                RecvOutcome::Read(n) => self.auth_pos += n,
            }
        }

        let result = LittleEndian::read_u32(&self.auth_buf);
        if result == 0 {
            self.state = State::Ready;
            self.emit(ChannelEvent::Opened);
            self.run_channel_up()
        } else {
            Err(self.fail(ErrorKind::Auth))
        }
    }

    fn run_channel_up(&mut self) -> Result<()> {
        let mut handler = self.handler.take().expect("handler always present");
        let result = handler.channel_up(self);
        self.handler = Some(handler);
        result
    }

    // ---- steady-state inbound pump (§4.5 step 1-7) --------------------

    fn pump_ready(&mut self) -> Result<()> {
        loop {
            if self.assembly.header.is_none() {
                if self.assembly.header_pos < DataHeader::LENGTH {
                    let pos = self.assembly.header_pos;
                    let outcome = {
                        let transport =
                            self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
                        recv_chunked(transport, self.read_chunk, &mut self.assembly.header_buf[pos..])?
                    };
                    match outcome {
                        RecvOutcome::WouldBlock => return Ok(()),
                        RecvOutcome::Eof => {
                            self.disconnect(true);
                            return Ok(());
                        }
                        RecvOutcome::Read(n) => {
                            self.assembly.header_pos += n;
                            if self.assembly.header_pos < DataHeader::LENGTH {
                                continue;
                            }
                        }
                    }
                }
                let header = DataHeader::deserialize_from(&self.assembly.header_buf)?;
                self.assembly.data_buf = vec![0u8; header.size as usize];
                self.assembly.data_pos = 0;
                self.assembly.header = Some(header);
            }

            if self.assembly.data_pos < self.assembly.data_buf.len() {
                let pos = self.assembly.data_pos;
                let outcome = {
                    let transport = self.transport.as_mut().ok_or_else(|| Error::simple(ErrorKind::Io))?;
                    recv_chunked(transport, self.read_chunk, &mut self.assembly.data_buf[pos..])?
                };
                match outcome {
                    RecvOutcome::WouldBlock => return Ok(()),
                    RecvOutcome::Eof => {
                        self.disconnect(true);
                        return Ok(());
                    }
                    RecvOutcome::Read(n) => {
                        self.assembly.data_pos += n;
                        if self.assembly.data_pos < self.assembly.data_buf.len() {
                            continue;
                        }
                    }
                }
            }

            let header = self.assembly.header.take().expect("set above");
            let bytes = mem::take(&mut self.assembly.data_buf);
            self.assembly.reset();
            self.dispatch_complete_message(header, bytes)?;
        }
    }

    fn dispatch_complete_message(&mut self, header: DataHeader, bytes: Vec<u8>) -> Result<()> {
        let top = InboundMessage::top_level(header, bytes);

        if header.sub_list != 0 {
            let payload_ptr = top.payload().as_ptr() as usize;
            let subs: Vec<(u16, std::ops::Range<usize>)> = walk_sub_messages(top.payload(), header.sub_list)?
                .into_iter()
                .map(|s| {
                    let start = s.body.as_ptr() as usize - payload_ptr;
                    (s.msg_type, start..start + s.body.len())
                })
                .collect();
            for (msg_type, range) in subs {
                let child = InboundMessage::sub_message(&top, msg_type, range);
                self.parse_and_dispatch(&child)?;
            }
        }

        // Step 5: ACK-window countdown, once per top-level message.
        self.ack_remaining = self.ack_remaining.saturating_sub(1);
        if self.ack_remaining == 0 {
            self.ack_remaining = self.ack_window;
            self.send_message(MSGC_ACK, &[])?;
        }

        self.parse_and_dispatch(&top)
    }

    fn parse_and_dispatch(&mut self, msg: &InboundMessage) -> Result<()> {
        let parsed = parser::for_major(self.major)
            .parse(self.kind, msg.header().msg_type, self.minor, msg.payload())?;
        msg.set_parsed(parsed);
        let mut handler = self.handler.take().expect("handler always present");
        let result = handler.handle_msg(self, msg);
        self.handler = Some(handler);
        result
    }

    /// Marshals and sends an outbound message of type `msg_type`, with
    /// the next monotonically increasing serial.
    pub fn send_message(&mut self, msg_type: u16, body: &[u8]) -> Result<()> {
        let marshaller = Marshaller::new();
        let outbound = OutboundMessage::new(self.self_weak.clone(), marshaller)?;
        outbound.marshaller_mut().write(body)?;
        let serial = self.next_serial();
        outbound.finalize(serial, msg_type, 0)?;
        let bytes = outbound.linearize();
        self.transport_send_all(&bytes)
    }

    fn next_serial(&mut self) -> u64 {
        let s = self.serial;
        self.serial += 1;
        s
    }
}

impl Readable for Channel {
    fn on_readable(&mut self) {
        if let Err(e) = self.step() {
            log::warn!("{}: {}", self.name, e);
        }
    }
}
