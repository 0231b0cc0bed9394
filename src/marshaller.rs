//! Outbound byte-buffer builder with a reserved header prefix.
//!
//! Mirrors the append-then-freeze shape of a wire-format encoder: bytes
//! are appended via `write`/`reserve`, and `linearize` hands back the
//! finished buffer once every reservation has been patched.

use crate::error::*;

/// Default cap on a single marshalled message, chosen generously above any
/// legitimate steady-state frame; exceeding it is `ErrorKind::BufferFull`.
const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

/// A range inside the marshaller's buffer returned by `reserve`, kept
/// writable until `linearize` so a caller can patch it in place (this is
/// how `DataHeader::size` gets finalized after the payload is known).
#[derive(Debug, Copy, Clone)]
pub struct Reservation {
    start: usize,
    len: usize,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Append-only byte buffer with a reserved header region.
pub struct Marshaller {
    buf: Vec<u8>,
    base: usize,
    max_size: usize,
}

impl Marshaller {
    pub fn new() -> Self {
        Marshaller { buf: Vec::new(), base: 0, max_size: DEFAULT_MAX_SIZE }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Marshaller { buf: Vec::new(), base: 0, max_size }
    }

    /// Reserves `n` writable bytes, zero-initialized, and returns a handle
    /// that can be patched via `patch` any time before `linearize`.
    pub fn reserve(&mut self, n: usize) -> Result<Reservation> {
        let start = self.buf.len();
        let end = start
            .checked_add(n)
            .filter(|&e| e <= self.max_size)
            .ok_or_else(|| Error::simple(ErrorKind::BufferFull))?;
        self.buf.resize(end, 0);
        Ok(Reservation { start, len: n })
    }

    /// Appends `bytes` verbatim, equivalent to `reserve` followed by an
    /// immediate `patch`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let res = self.reserve(bytes.len())?;
        self.patch(res, bytes);
        Ok(())
    }

    /// Overwrites a previously reserved range. Panics if `bytes.len()`
    /// doesn't match the reservation's length, or if `res` was not
    /// produced by this marshaller (a programmer error, not a runtime
    /// one — reservations don't outlive the marshaller that made them in
    /// this crate's usage).
    pub fn patch(&mut self, res: Reservation, bytes: &[u8]) {
        assert_eq!(bytes.len(), res.len, "patch length must match reservation");
        self.buf[res.start..res.start + res.len].copy_from_slice(bytes);
    }

    /// Marks the first `n` bytes already written as a header prefix
    /// excluded from `total_size()`.
    pub fn set_base(&mut self, n: usize) {
        self.base = n;
    }

    /// Bytes written so far, excluding the base prefix.
    pub fn total_size(&self) -> usize {
        self.buf.len() - self.base
    }

    /// The full buffer, header prefix included.
    pub fn linearize(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new()
    }
}
