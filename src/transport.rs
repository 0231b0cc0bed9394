//! Non-blocking byte-stream transport over a plain or TLS-wrapped socket
//! (component D).
//!
//! The TLS side is driven synchronously against `rustls`'s sans-IO
//! `ClientConnection`: this crate feeds bytes to/from the socket itself
//! and interprets `WouldBlock` the same way the plain-socket path does,
//! rather than delegating to an async TLS wrapper. See DESIGN.md.

use std::io::{self, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::{ClientConnection, ServerName};

use crate::error::*;

/// Outcome of a single `recv` attempt, distinguishing "nothing ready yet"
/// from "peer closed the connection" — the abstract spec conflates both
/// as "0 bytes read", but Rust's type system lets us just say which.
pub enum RecvOutcome {
    Read(usize),
    WouldBlock,
    Eof,
}

pub(crate) struct TlsTransport {
    sock: TcpStream,
    conn: ClientConnection,
}

/// A transport is either a raw TCP socket, or one wrapped in a TLS
/// session. Both present the same `send`/`recv` surface.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsTransport>),
}

impl Transport {
    pub fn plain(sock: TcpStream) -> Self {
        Transport::Plain(sock)
    }

    pub fn tls(sock: TcpStream, server_name: ServerName, config: Arc<rustls::ClientConfig>) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name).wrapped(ErrorKind::Tls)?;
        Ok(Transport::Tls(Box::new(TlsTransport { sock, conn })))
    }

    /// The underlying `mio` source, for (de)registering with the reactor.
    pub fn source_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls(t) => &mut t.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Whether a TLS handshake is still in progress. Always `false` for a
    /// plain transport.
    pub fn is_handshaking(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(t) => t.conn.is_handshaking(),
        }
    }

    /// Pumps the TLS handshake as far as it will go without blocking.
    /// Returns `Ok(true)` once the handshake is complete, `Ok(false)` if
    /// it would block waiting on more peer data (the caller should return
    /// to the reactor and re-enter on the next readability event).
    pub fn drive_handshake(&mut self) -> Result<bool> {
        let t = match self {
            Transport::Plain(_) => return Ok(true),
            Transport::Tls(t) => t,
        };
        loop {
            if !t.conn.is_handshaking() {
                return Ok(true);
            }
            if t.conn.wants_write() {
                match t.conn.write_tls(&mut t.sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e).wrapped(ErrorKind::Tls),
                }
            }
            if t.conn.wants_read() {
                match t.conn.read_tls(&mut t.sock) {
                    Ok(0) => return Err("peer closed connection during TLS handshake")
                        .wrapped(ErrorKind::Tls),
                    Ok(_) => {
                        t.conn.process_new_packets().wrapped(ErrorKind::Tls)?;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e).wrapped(ErrorKind::Tls),
                }
            }
            return Ok(!t.conn.is_handshaking());
        }
    }

    /// Sends `buf`. Per §4.3, a short write is treated as a fatal I/O
    /// error rather than queued for retry.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Transport::Plain(sock) => match sock.write(buf) {
                Ok(n) if n == buf.len() => Ok(n),
                Ok(0) => Err(Error::simple(ErrorKind::Io)),
                Ok(_) => Err("short write on plain transport").wrapped(ErrorKind::Io),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            },
            Transport::Tls(t) => {
                let n = t.conn.writer().write(buf).wrapped(ErrorKind::Io)?;
                if n != buf.len() {
                    return Err("short write on tls transport").wrapped(ErrorKind::Io);
                }
                while t.conn.wants_write() {
                    match t.conn.write_tls(&mut t.sock) {
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e).wrapped(ErrorKind::Io),
                    }
                }
                Ok(n)
            }
        }
    }

    /// Reads into `buf`, filling at most `buf.len()` bytes.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        match self {
            Transport::Plain(sock) => match sock.read(buf) {
                Ok(0) => Ok(RecvOutcome::Eof),
                Ok(n) => Ok(RecvOutcome::Read(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
                Err(e) => Err(e.into()),
            },
            Transport::Tls(t) => {
                match t.conn.read_tls(&mut t.sock) {
                    Ok(0) => return Ok(RecvOutcome::Eof),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e).wrapped(ErrorKind::Tls),
                }
                t.conn.process_new_packets().wrapped(ErrorKind::Tls)?;
                match t.conn.reader().read(buf) {
                    Ok(0) => Ok(RecvOutcome::WouldBlock),
                    Ok(n) => Ok(RecvOutcome::Read(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
                    Err(e) => Err(e).wrapped(ErrorKind::Tls),
                }
            }
        }
    }
}
