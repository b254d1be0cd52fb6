//! Error types for writing and reading tar archives.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while encoding, writing or reading an archive.
#[derive(Debug, Error)]
pub enum Error {
    /// The entry name cannot be represented in the header's name fields.
    #[error("invalid entry name {name:?}: {reason}")]
    InvalidEntryName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// A numeric or string field does not fit in its fixed width.
    #[error("field {field} cannot hold {value}")]
    InvalidField {
        /// Name of the header field.
        field: &'static str,
        /// The value that did not fit, rendered for display.
        value: String,
    },

    /// Reading from an entry's content source failed.
    #[error("failed to read entry content: {0}")]
    ContentRead(#[source] std::io::Error),

    /// An entry was written after the archive was closed.
    #[error("cannot write to a closed archive")]
    ClosedArchive,

    /// A directory passed for traversal is empty or does not exist.
    #[error("path not found: {0:?}")]
    PathNotFound(PathBuf),

    /// The write was cancelled between chunks.
    #[error("write cancelled at archive offset {0}")]
    Cancelled(u64),

    /// I/O error from the underlying sink or reader.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header checksum does not match the header contents.
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// The checksum value stored in the header.
        expected: u64,
        /// The checksum computed from the header bytes.
        computed: u64,
    },

    /// A numeric header field contains something other than octal digits.
    #[error("invalid octal field: {0:?}")]
    InvalidOctal(Vec<u8>),

    /// The archive ended in the middle of a header or entry.
    #[error("unexpected EOF at position {pos}")]
    UnexpectedEof {
        /// Position in the stream where EOF occurred.
        pos: u64,
    },

    /// An entry path would escape the extraction directory.
    #[error("refusing to extract unsafe path {0:?}")]
    UnsafePath(String),
}

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
