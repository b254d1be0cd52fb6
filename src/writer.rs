//! Streaming tar archive writer.
//!
//! [`ArchiveWriter`] appends entries to any [`Write`] sink. Each entry is a
//! header block followed by its content, zero-padded to a multiple of 512
//! bytes. Closing the archive appends the two zero blocks that mark its end;
//! dropping an unclosed writer does the same unless [`ArchiveWriter::abandon`]
//! was called.

use std::{
    fs::{self, File, Metadata},
    io::{self, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime},
};

use log::{debug, trace, warn};

use crate::{
    bounded::BoundedWriter,
    error::{Error, Result},
    header::{Dialect, EntryDescriptor, EntryKind, Owner, BLOCK_SIZE},
};

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];
const SINK_PRESENT: &str = "sink is only taken by finish()";

/// What to do when a content source returns zero bytes before the declared
/// size has been reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnEmptyRead {
    /// Sleep for [`WriterOptions::retry_delay`] and read again, indefinitely.
    #[default]
    Wait,
    /// Treat the empty read as end of data and zero-fill up to the declared size.
    StopAndZeroFill,
}

/// Configuration for an [`ArchiveWriter`].
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Header dialect used for every entry.
    pub dialect: Dialect,
    pub on_empty_read: OnEmptyRead,
    /// Pause between retries under [`OnEmptyRead::Wait`].
    pub retry_delay: Duration,
    /// Size of the per-writer scratch buffer content is copied through.
    pub chunk_size: usize,
    /// Mode for files whose permissions cannot be read from the filesystem.
    pub file_mode: u32,
    /// Mode for directory entries written by the directory walker.
    pub dir_mode: u32,
    /// Owner for directory entries, and for files on platforms without
    /// Unix ownership metadata.
    pub owner: Owner,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::Ustar,
            on_empty_read: OnEmptyRead::Wait,
            retry_delay: Duration::from_millis(100),
            chunk_size: 8192,
            file_mode: 0o644,
            dir_mode: 0o755,
            owner: Owner::default(),
        }
    }
}

/// Shared flag used to cancel an in-progress write from another thread.
///
/// The writer checks it between content chunks and between producer
/// invocations. A cancelled write leaves the archive truncated mid-entry.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters describing what a writer has produced so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Entries fully written (header, content and padding).
    pub entries: u64,
    /// Bytes of zeros written in place of content a source failed to deliver.
    pub zero_filled_bytes: u64,
}

/// Writes a tar archive to a caller-owned sink.
///
/// Only one entry is in flight at a time; every write method takes
/// `&mut self` and finishes the entry's header, content and padding before
/// returning. The sink is never closed by the writer: get it back with
/// [`finish`](Self::finish).
pub struct ArchiveWriter<W: Write> {
    sink: Option<W>,
    options: WriterOptions,
    buffer: Vec<u8>,
    position: u64,
    stats: WriterStats,
    cancel: Option<CancelFlag>,
    closed: bool,
    abandoned: bool,
}

impl<W: Write> ArchiveWriter<W> {
    /// Create a writer producing UStar headers with default options.
    pub fn new(sink: W) -> Self {
        Self::with_options(sink, WriterOptions::default())
    }

    /// Create a writer producing legacy (V7) headers.
    pub fn legacy(sink: W) -> Self {
        Self::with_options(
            sink,
            WriterOptions {
                dialect: Dialect::Legacy,
                ..Default::default()
            },
        )
    }

    pub fn with_options(sink: W, options: WriterOptions) -> Self {
        let buffer = vec![0u8; options.chunk_size.max(1)];
        Self {
            sink: Some(sink),
            options,
            buffer,
            position: 0,
            stats: WriterStats::default(),
            cancel: None,
            closed: false,
            abandoned: false,
        }
    }

    /// Check `flag` between chunks of every subsequent write.
    pub fn set_cancel_flag(&mut self, flag: CancelFlag) {
        self.cancel = Some(flag);
    }

    #[must_use]
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Number of bytes written to the sink so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &W {
        self.sink.as_ref().expect(SINK_PRESENT)
    }

    pub fn get_mut(&mut self) -> &mut W {
        self.sink.as_mut().expect(SINK_PRESENT)
    }

    /// Write one entry, pulling exactly `entry.size` bytes from `source`.
    ///
    /// The header is encoded before anything is written, so a metadata error
    /// leaves the archive untouched. If `source` under-delivers, the
    /// configured [`OnEmptyRead`] policy decides between waiting and
    /// zero-filling; bytes beyond the declared size are never read.
    pub fn write_entry<R: Read>(&mut self, entry: &EntryDescriptor, mut source: R) -> Result<()> {
        let policy = self.options.on_empty_read;
        self.write_entry_with_policy(entry, &mut source, policy)
    }

    /// Write one entry whose content is pushed by `producer`.
    ///
    /// The producer is called repeatedly with a [`BoundedWriter`] limited to
    /// `entry.size` bytes until a write on it reports
    /// [`Progress::Exhausted`](crate::Progress::Exhausted), so a producer
    /// that fills the budget exactly is called once more. A call that writes
    /// nothing while budget remains is handled like an empty read under the
    /// configured [`OnEmptyRead`] policy; a call that writes nothing once the
    /// budget is used up ends the entry as well.
    ///
    /// Errors returned by the producer abort the entry as
    /// [`Error::ContentRead`], except an error raised after the budget was
    /// refused (for example `write_all` failing with `WriteZero`), which ends
    /// the entry normally. On error [`position`](Self::position) still counts
    /// every byte the producer got into the sink.
    pub fn write_with<F>(&mut self, entry: &EntryDescriptor, mut producer: F) -> Result<()>
    where
        F: FnMut(&mut BoundedWriter<&mut W>) -> io::Result<()>,
    {
        self.ensure_open()?;
        let header = self.options.dialect.encode(entry)?;
        self.emit(header.as_bytes())?;

        let size = content_size(entry);
        let start = self.position;
        let mut bounded = BoundedWriter::new(self.sink.as_mut().expect(SINK_PRESENT), size);
        let outcome = loop {
            if bounded.is_exhausted() {
                break Ok(0);
            }
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                break Err(Error::Cancelled(start + bounded.written()));
            }
            let before = bounded.written();
            if let Err(e) = producer(&mut bounded) {
                if bounded.is_exhausted() {
                    trace!("{}: producer failed after exhaustion: {e}", entry.name);
                    break Ok(0);
                }
                break Err(Error::ContentRead(e));
            }
            if bounded.written() == before {
                if !bounded.can_write() {
                    break Ok(0);
                }
                match self.options.on_empty_read {
                    OnEmptyRead::Wait => {
                        trace!("{}: producer wrote nothing, retrying", entry.name);
                        thread::sleep(self.options.retry_delay);
                    }
                    OnEmptyRead::StopAndZeroFill => break Ok(bounded.remaining()),
                }
            }
        };
        self.position += bounded.written();
        let shortfall = outcome?;

        if shortfall > 0 {
            self.zero_fill(&entry.name, shortfall)?;
        }
        self.pad(size)?;
        self.entry_done(entry, size);
        Ok(())
    }

    /// Write a regular file entry from `source` with explicit metadata.
    pub fn write_stream<R: Read>(
        &mut self,
        source: R,
        size: u64,
        name: &str,
        owner: Owner,
        mode: u32,
        mtime: SystemTime,
    ) -> Result<()> {
        let entry = EntryDescriptor::file(name, size)
            .with_owner(owner)
            .with_mode(mode)
            .with_mtime(mtime);
        self.write_entry(&entry, source)
    }

    /// Write a directory entry for `path`.
    ///
    /// The modification time comes from the directory if it exists on disk,
    /// otherwise the current time is used. A trailing `/` is added to the
    /// stored name.
    pub fn write_directory_entry(
        &mut self,
        path: impl AsRef<Path>,
        owner: Owner,
        mode: u32,
    ) -> Result<()> {
        let path = path.as_ref();
        let mtime = fs::metadata(path)
            .ok()
            .filter(Metadata::is_dir)
            .and_then(|m| m.modified().ok())
            .unwrap_or_else(SystemTime::now);
        let entry = EntryDescriptor::directory(archive_name(path))
            .with_owner(owner)
            .with_mode(mode)
            .with_mtime(mtime);
        self.write_entry(&entry, io::empty())
    }

    /// Write the regular file at `path`, named as given.
    ///
    /// The size is taken from the file's metadata up front. A file that
    /// shrinks while being archived is zero-filled rather than waited on.
    pub fn write_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::PathNotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
        let metadata = file.metadata()?;
        let (owner, mode) = self.file_owner_and_mode(&metadata);
        let entry = EntryDescriptor::file(archive_name(path), metadata.len())
            .with_owner(owner)
            .with_mode(mode)
            .with_mtime(metadata.modified().unwrap_or_else(|_| SystemTime::now()));
        self.write_entry_with_policy(&entry, &mut file, OnEmptyRead::StopAndZeroFill)
    }

    /// Write the end-of-archive marker and flush the sink.
    ///
    /// Only the first call writes anything; later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let sink = self.sink.as_mut().expect(SINK_PRESENT);
        sink.write_all(&ZERO_BLOCK)?;
        sink.write_all(&ZERO_BLOCK)?;
        sink.flush()?;
        self.position += 2 * BLOCK_SIZE as u64;
        debug!(
            "closed archive: {} entries, {} bytes",
            self.stats.entries, self.position
        );
        Ok(())
    }

    /// Skip the end-of-archive marker when this writer is dropped.
    ///
    /// Use this after a failed write when a terminator would make a
    /// truncated archive look complete.
    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    /// Close the archive and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.sink.take().expect(SINK_PRESENT))
    }

    pub(crate) fn write_entry_with_policy<R: Read + ?Sized>(
        &mut self,
        entry: &EntryDescriptor,
        source: &mut R,
        policy: OnEmptyRead,
    ) -> Result<()> {
        self.ensure_open()?;
        let header = self.options.dialect.encode(entry)?;
        self.emit(header.as_bytes())?;

        let size = content_size(entry);
        self.copy_content(&entry.name, size, source, policy)?;
        self.pad(size)?;
        self.entry_done(entry, size);
        Ok(())
    }

    fn copy_content<R: Read + ?Sized>(
        &mut self,
        name: &str,
        size: u64,
        source: &mut R,
        policy: OnEmptyRead,
    ) -> Result<()> {
        let mut remaining = size;
        while remaining > 0 {
            self.check_cancelled()?;
            let want = self
                .buffer
                .len()
                .min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let read = match source.read(&mut self.buffer[..want]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ContentRead(e)),
            };
            if read == 0 {
                match policy {
                    OnEmptyRead::Wait => {
                        trace!("{name}: empty read with {remaining} bytes left, retrying");
                        thread::sleep(self.options.retry_delay);
                        continue;
                    }
                    OnEmptyRead::StopAndZeroFill => return self.zero_fill(name, remaining),
                }
            }
            let sink = self.sink.as_mut().expect(SINK_PRESENT);
            sink.write_all(&self.buffer[..read])?;
            self.position += read as u64;
            remaining -= read as u64;
        }
        Ok(())
    }

    fn zero_fill(&mut self, name: &str, count: u64) -> Result<()> {
        warn!("{name}: content ended {count} bytes short of its declared size, zero-filling");
        self.write_zeros(count)?;
        self.stats.zero_filled_bytes += count;
        Ok(())
    }

    fn pad(&mut self, size: u64) -> Result<()> {
        let tail = size % BLOCK_SIZE as u64;
        if tail != 0 {
            self.write_zeros(BLOCK_SIZE as u64 - tail)?;
        }
        Ok(())
    }

    fn write_zeros(&mut self, mut count: u64) -> Result<()> {
        while count > 0 {
            let len = count.min(BLOCK_SIZE as u64) as usize;
            self.emit(&ZERO_BLOCK[..len])?;
            count -= len as u64;
        }
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.as_mut().expect(SINK_PRESENT).write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedArchive);
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Err(Error::Cancelled(self.position));
        }
        Ok(())
    }

    fn entry_done(&mut self, entry: &EntryDescriptor, size: u64) {
        self.stats.entries += 1;
        debug!("wrote {:?} ({size} bytes), archive at {}", entry.name, self.position);
    }

    #[cfg(unix)]
    fn file_owner_and_mode(&self, metadata: &Metadata) -> (Owner, u32) {
        use std::os::unix::fs::MetadataExt;

        let owner = Owner::Ids {
            uid: metadata.uid().into(),
            gid: metadata.gid().into(),
        };
        (owner, metadata.mode() & 0o7777)
    }

    #[cfg(not(unix))]
    fn file_owner_and_mode(&self, _metadata: &Metadata) -> (Owner, u32) {
        (self.options.owner.clone(), self.options.file_mode)
    }
}

impl<W: Write> Drop for ArchiveWriter<W> {
    fn drop(&mut self) {
        if self.abandoned || self.sink.is_none() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("failed to terminate archive on drop: {e}");
        }
    }
}

fn content_size(entry: &EntryDescriptor) -> u64 {
    match entry.kind {
        EntryKind::Regular => entry.size,
        EntryKind::Directory => 0,
    }
}

/// The name a filesystem path is stored under: `/`-separated, relative.
pub(crate) fn archive_name(path: &Path) -> String {
    let name = path.to_string_lossy().replace('\\', "/");
    let mut name = name.trim_start_matches('/');
    while let Some(rest) = name.strip_prefix("./") {
        name = rest.trim_start_matches('/');
    }
    if name.is_empty() {
        return ".".to_string();
    }
    name.to_string()
}
