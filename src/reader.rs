//! Streaming reader for legacy and UStar archives.
//!
//! [`ArchiveReader`] walks an archive header by header. After
//! [`next_entry`](ArchiveReader::next_entry) returns an entry, its content can
//! be read with [`read_content`](ArchiveReader::read_content) or
//! [`copy_content`](ArchiveReader::copy_content); anything left unread is
//! skipped automatically by the next call to `next_entry`.
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use ustar_stream::ArchiveReader;
//!
//! let file = File::open("archive.tar").unwrap();
//! let mut reader = ArchiveReader::new(BufReader::new(file));
//! while let Some(entry) = reader.next_entry().unwrap() {
//!     println!("{} ({} bytes)", entry.path, entry.size);
//! }
//! ```

use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read, Write},
    path::{Component, Path},
    time::{Duration, UNIX_EPOCH},
};

use log::{debug, trace};

use crate::{
    error::{Error, Result},
    header::{Dialect, EntryKind, HeaderBlock, BLOCK_SIZE},
};

/// One entry as read back from an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Full path, with any UStar prefix joined on. Directories keep their
    /// trailing `/`.
    pub path: String,
    pub dialect: Dialect,
    /// Raw typeflag byte.
    pub typeflag: u8,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Modification time as seconds since the Unix epoch.
    pub mtime: u64,
    pub uname: Option<String>,
    pub gname: Option<String>,
}

impl Entry {
    fn from_header(header: &HeaderBlock) -> Result<Self> {
        let lossy = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
        Ok(Self {
            path: lossy(header.full_path().as_ref()),
            dialect: Dialect::detect(header),
            typeflag: header.typeflag(),
            size: header.entry_size()?,
            mode: header.mode()?,
            uid: header.uid()?,
            gid: header.gid()?,
            mtime: header.mtime()?,
            uname: header.username().map(lossy),
            gname: header.groupname().map(lossy),
        })
    }

    /// Regular file or directory; `None` for any other typeflag.
    #[must_use]
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_byte(self.typeflag)
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind() == Some(EntryKind::Regular)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind() == Some(EntryKind::Directory)
    }

    /// Size of the content rounded up to the next block boundary.
    #[must_use]
    pub fn padded_size(&self) -> u64 {
        self.size.next_multiple_of(BLOCK_SIZE as u64)
    }
}

/// Reads entries from a tar stream.
#[derive(Debug)]
pub struct ArchiveReader<R> {
    reader: R,
    /// Unread content bytes of the current entry
    content_left: u64,
    /// Padding after the current entry's content
    padding_left: u64,
    /// Current position in the stream (for error messages)
    pos: u64,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            content_left: 0,
            padding_left: 0,
            pos: 0,
            done: false,
        }
    }

    /// Current position in the stream.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the next entry header, skipping whatever is left of the previous entry.
    ///
    /// Returns `Ok(None)` at a zero block or at a clean EOF on a block boundary.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        self.skip_rest()?;

        let mut block = [0u8; BLOCK_SIZE];
        if !read_exactish(&mut self.reader, &mut block).map_err(|e| self.eof_error(e))? {
            self.done = true;
            return Ok(None);
        }
        self.pos += BLOCK_SIZE as u64;

        let header = HeaderBlock::from_bytes(block);
        if header.is_zero() {
            trace!("end-of-archive marker at {}", self.pos - BLOCK_SIZE as u64);
            self.done = true;
            return Ok(None);
        }
        header.verify_checksum()?;

        let entry = Entry::from_header(&header)?;
        // Directories carry no content whatever their size field says.
        self.content_left = if entry.is_dir() { 0 } else { entry.size };
        self.padding_left = self.content_left.next_multiple_of(BLOCK_SIZE as u64) - self.content_left;
        Ok(Some(entry))
    }

    /// Read the rest of the current entry's content into memory.
    pub fn read_content(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.copy_content(&mut data)?;
        Ok(data)
    }

    /// Copy the rest of the current entry's content into `dest`.
    pub fn copy_content(&mut self, dest: &mut impl Write) -> Result<u64> {
        let len = self.content_left;
        let copied = io::copy(&mut (&mut self.reader).take(len), dest)?;
        self.pos += copied;
        self.content_left -= copied;
        if copied < len {
            return Err(Error::UnexpectedEof { pos: self.pos });
        }
        Ok(copied)
    }

    /// Discard the rest of the current entry's content.
    pub fn skip_content(&mut self) -> Result<()> {
        self.copy_content(&mut io::sink())?;
        Ok(())
    }

    /// Extract every remaining entry below `dest`.
    ///
    /// Directories are created, regular files are written with their mode
    /// (on Unix) and modification time. Other entry types are skipped.
    /// Absolute paths and paths containing `..` are rejected.
    pub fn unpack(&mut self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        while let Some(entry) = self.next_entry()? {
            let target = dest.join(checked_relative_path(&entry.path)?);
            match entry.kind() {
                Some(EntryKind::Directory) => fs::create_dir_all(&target)?,
                Some(EntryKind::Regular) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut file = File::create(&target)?;
                    self.copy_content(&mut file)?;
                    file.set_modified(UNIX_EPOCH + Duration::from_secs(entry.mtime))?;
                    set_mode(&target, entry.mode)?;
                }
                None => {
                    debug!(
                        "skipping {:?} with unsupported typeflag {:?}",
                        entry.path, entry.typeflag as char
                    );
                    continue;
                }
            }
            trace!("extracted {}", target.display());
        }
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn skip_rest(&mut self) -> Result<()> {
        let len = self.content_left + self.padding_left;
        if len == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
        self.pos += skipped;
        self.content_left = 0;
        self.padding_left = 0;
        if skipped < len {
            return Err(Error::UnexpectedEof { pos: self.pos });
        }
        Ok(())
    }

    fn eof_error(&self, e: io::Error) -> Error {
        match e.kind() {
            ErrorKind::UnexpectedEof => Error::UnexpectedEof { pos: self.pos },
            _ => Error::Io(e),
        }
    }
}

/// This function reads the exact amount of bytes required to fill the buffer, possibly performing
/// multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// Returns `Ok(false)` on a clean EOF before any byte was read and an
/// `UnexpectedEof` error if the stream ends part-way through the buffer.
fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) => {
                return match todo.len() {
                    s if s == buflen => Ok(false), // clean EOF
                    _ => Err(io::Error::from(ErrorKind::UnexpectedEof)),
                };
            }
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

fn checked_relative_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe || path.is_empty() {
        return Err(Error::UnsafePath(path.to_string()));
    }
    Ok(relative)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::header::{EntryDescriptor, Owner};
    use crate::ArchiveWriter;

    use super::*;

    fn sample_archive() -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .write_entry(&EntryDescriptor::directory("docs"), io::empty())
            .unwrap();
        let readme = EntryDescriptor::file("docs/readme.md", 6)
            .with_mode(0o600)
            .with_mtime(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .with_owner(Owner::Names {
                user: "alice".into(),
                group: "staff".into(),
            });
        writer.write_entry(&readme, &b"# hi\n\n"[..]).unwrap();
        writer
            .write_entry(&EntryDescriptor::file("big.bin", 700), &[1u8; 700][..])
            .unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_read_entries() {
        let mut reader = ArchiveReader::new(Cursor::new(sample_archive()));

        let docs = reader.next_entry().unwrap().unwrap();
        assert_eq!(docs.path, "docs/");
        assert!(docs.is_dir());
        assert_eq!(docs.dialect, Dialect::Ustar);

        let readme = reader.next_entry().unwrap().unwrap();
        assert_eq!(readme.path, "docs/readme.md");
        assert_eq!(readme.mode, 0o600);
        assert_eq!(readme.mtime, 1_700_000_000);
        assert_eq!(readme.uname.as_deref(), Some("alice"));
        assert_eq!(readme.gname.as_deref(), Some("staff"));
        assert_eq!(reader.read_content().unwrap(), b"# hi\n\n");

        // Content is skipped when not read
        let big = reader.next_entry().unwrap().unwrap();
        assert_eq!(big.size, 700);
        assert_eq!(big.padded_size(), 1024);

        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_skip_content() {
        let mut reader = ArchiveReader::new(Cursor::new(sample_archive()));
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        reader.skip_content().unwrap();
        assert_eq!(reader.position(), 512 * 2 + 6);
        // Nothing left to copy once skipped.
        assert!(reader.read_content().unwrap().is_empty());

        let big = reader.next_entry().unwrap().unwrap();
        assert_eq!(big.path, "big.bin");
        assert_eq!(reader.position(), 512 * 4);
    }

    #[test]
    fn test_empty_stream() {
        let mut reader = ArchiveReader::new(Cursor::new(Vec::new()));
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let mut reader = ArchiveReader::new(Cursor::new(vec![b'a'; 100]));
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { pos: 0 }));
    }

    #[test]
    fn test_truncated_content() {
        let mut archive = sample_archive();
        archive.truncate(512 * 2 + 3);
        let mut reader = ArchiveReader::new(Cursor::new(archive));
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        let err = reader.read_content().unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { .. }));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut archive = sample_archive();
        archive[0] = b'x';
        let mut reader = ArchiveReader::new(Cursor::new(archive));
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_legacy_entries() {
        let mut writer = ArchiveWriter::legacy(Vec::new());
        writer
            .write_entry(&EntryDescriptor::file("old.txt", 3), &b"old"[..])
            .unwrap();
        let mut reader = ArchiveReader::new(Cursor::new(writer.finish().unwrap()));
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.dialect, Dialect::Legacy);
        assert_eq!(entry.uname, None);
        assert_eq!(reader.read_content().unwrap(), b"old");
    }

    #[test]
    fn test_unpack() {
        let dest = tempfile::tempdir().unwrap();
        let mut reader = ArchiveReader::new(Cursor::new(sample_archive()));
        reader.unpack(dest.path()).unwrap();

        assert!(dest.path().join("docs").is_dir());
        assert_eq!(fs::read(dest.path().join("docs/readme.md")).unwrap(), b"# hi\n\n");
        assert_eq!(fs::read(dest.path().join("big.bin")).unwrap(), vec![1u8; 700]);
    }

    #[test]
    fn test_unpack_rejects_escaping_paths() {
        for name in ["../evil", "a/../../evil", "/etc/evil"] {
            let mut writer = ArchiveWriter::new(Vec::new());
            writer
                .write_entry(&EntryDescriptor::file(name, 1), &b"x"[..])
                .unwrap();
            let dest = tempfile::tempdir().unwrap();
            let mut reader = ArchiveReader::new(Cursor::new(writer.finish().unwrap()));
            let err = reader.unpack(dest.path()).unwrap_err();
            assert!(matches!(err, Error::UnsafePath(_)), "{name}");
        }
    }
}
