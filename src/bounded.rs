//! A sink wrapper that accepts at most a declared number of bytes.

use std::io::{self, Write};

/// Outcome of a single [`BoundedWriter::write_chunk`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// This many bytes were forwarded to the sink (possibly fewer than offered).
    Written(usize),
    /// The budget was already used up; nothing was written.
    Exhausted,
}

/// Forwards writes to a sink until a fixed byte budget is used up.
///
/// Each write is clamped to what is left of the budget. Once nothing is left,
/// the next write reports [`Progress::Exhausted`]; that is the normal end of
/// data, not an error. Across its lifetime the writer never forwards more
/// than the declared budget.
///
/// This is the handle passed to producers by
/// [`ArchiveWriter::write_with`](crate::ArchiveWriter::write_with).
#[derive(Debug)]
pub struct BoundedWriter<W> {
    sink: W,
    remaining: u64,
    written: u64,
    exhausted: bool,
}

impl<W: Write> BoundedWriter<W> {
    pub fn new(sink: W, budget: u64) -> Self {
        Self {
            sink,
            remaining: budget,
            written: 0,
            exhausted: false,
        }
    }

    /// Write as much of `buf` as the remaining budget allows.
    pub fn write_chunk(&mut self, buf: &[u8]) -> io::Result<Progress> {
        if self.remaining == 0 {
            self.exhausted = true;
            return Ok(Progress::Exhausted);
        }
        let len = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.sink.write_all(&buf[..len])?;
        self.remaining -= len as u64;
        self.written += len as u64;
        Ok(Progress::Written(len))
    }

    /// Whether any budget is left.
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.remaining > 0
    }

    /// Whether a write has already been refused for lack of budget.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// `write` returns `Ok(0)` once the budget is used up, so `write_all` of more
/// than the budget fails with [`io::ErrorKind::WriteZero`].
impl<W: Write> Write for BoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_chunk(buf)? {
            Progress::Written(n) => Ok(n),
            Progress::Exhausted => Ok(0),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}
