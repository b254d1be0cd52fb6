//! Streaming writer and reader for tar archives.
//!
//! This crate writes legacy (V7) and UStar tar archives to any
//! [`std::io::Write`] sink, one entry at a time, and reads them back.
//!
//! - [`header`] encodes entry metadata into 512-byte header blocks
//! - [`ArchiveWriter`] streams entries with block padding and writes the
//!   end-of-archive marker exactly once
//! - [`BoundedWriter`] lets a producer push content of a declared size
//! - [`ArchiveReader`] parses archives back into entries
//!
//! ```
//! use ustar_stream::{ArchiveReader, ArchiveWriter, EntryDescriptor};
//!
//! let mut writer = ArchiveWriter::new(Vec::new());
//! writer
//!     .write_entry(&EntryDescriptor::file("a.txt", 5), &b"hello"[..])
//!     .unwrap();
//! let archive = writer.finish().unwrap();
//! assert_eq!(archive.len(), 512 + 512 + 1024);
//!
//! let mut reader = ArchiveReader::new(&archive[..]);
//! let entry = reader.next_entry().unwrap().unwrap();
//! assert_eq!(entry.path, "a.txt");
//! assert_eq!(reader.read_content().unwrap(), b"hello");
//! ```

pub mod bounded;
pub mod error;
pub mod header;
pub mod reader;
mod walk;
pub mod writer;

pub use bounded::{BoundedWriter, Progress};
pub use error::{Error, Result};
pub use header::{Dialect, EntryDescriptor, EntryKind, HeaderBlock, Owner, BLOCK_SIZE};
pub use reader::{ArchiveReader, Entry};
pub use writer::{ArchiveWriter, CancelFlag, OnEmptyRead, WriterOptions, WriterStats};
