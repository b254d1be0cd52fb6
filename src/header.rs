//! Zerocopy-based tar header encoding and decoding.
//!
//! Two header dialects are supported:
//!
//! - **Legacy (V7)**: name, mode, ids, size, mtime, checksum and typeflag only
//! - **UStar (POSIX.1-1988)**: adds `magic`/`version`, user/group names and a
//!   path prefix that allows names up to 255 bytes
//!
//! # Header Field Layout
//!
//! All tar headers are 512 bytes. The common fields (offsets 0-257) are shared:
//!
//! | Offset | Size | Field     | Description                              |
//! |--------|------|-----------|------------------------------------------|
//! | 0      | 100  | name      | File path (null-terminated if < 100)     |
//! | 100    | 8    | mode      | File mode in octal ASCII                 |
//! | 108    | 8    | uid       | Owner user ID in octal ASCII             |
//! | 116    | 8    | gid       | Owner group ID in octal ASCII            |
//! | 124    | 12   | size      | File size in octal ASCII                 |
//! | 136    | 12   | mtime     | Modification time (Unix epoch, octal)    |
//! | 148    | 8    | checksum  | Header checksum in octal ASCII           |
//! | 156    | 1    | typeflag  | Entry type ('0' file, '5' directory)     |
//! | 157    | 100  | linkname  | Link target (always empty here)          |
//!
//! **UStar extension** (offsets 257-500):
//!
//! | Offset | Size | Field     | Description                              |
//! |--------|------|-----------|------------------------------------------|
//! | 257    | 6    | magic     | "ustar\0"                                |
//! | 263    | 2    | version   | "00"                                     |
//! | 265    | 32   | uname     | Owner user name                          |
//! | 297    | 32   | gname     | Owner group name                         |
//! | 329    | 8    | devmajor  | Device major number                      |
//! | 337    | 8    | devminor  | Device minor number                      |
//! | 345    | 155  | prefix    | Path prefix for long names               |
//!
//! # Example
//!
//! ```
//! use ustar_stream::header::{Dialect, EntryDescriptor};
//!
//! let entry = EntryDescriptor::file("a.txt", 5).with_mode(0o644);
//! let block = Dialect::Ustar.encode(&entry).unwrap();
//! assert_eq!(block.as_bytes().len(), 512);
//! assert_eq!(block.path_bytes(), b"a.txt");
//! ```

use std::{
    borrow::Cow,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Size of a tar block (and of every header) in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Magic string for UStar format headers ("ustar\0").
pub const USTAR_MAGIC: &[u8; 6] = b"ustar\0";

/// Version field for UStar format headers ("00").
pub const USTAR_VERSION: &[u8; 2] = b"00";

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const OWNER_NAME_LEN: usize = 32;
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;

/// Legacy (V7) tar header layout.
///
/// Everything after `linkname` is padding and stays zeroed.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LegacyHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub checksum: [u8; 8],
    pub typeflag: u8,
    pub linkname: [u8; 100],
    pub pad: [u8; 255],
}

/// UStar tar header layout.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UstarHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub checksum: [u8; 8],
    pub typeflag: u8,
    pub linkname: [u8; 100],
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub devmajor: [u8; 8],
    pub devminor: [u8; 8],
    pub prefix: [u8; 155],
    pub pad: [u8; 12],
}

/// The kind of filesystem object an entry describes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Regular file (typeflag '0', or '\0' in old archives).
    #[default]
    Regular,
    /// Directory (typeflag '5').
    Directory,
}

impl EntryKind {
    /// Parse an entry kind from a typeflag byte, if it is one we write.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' | b'\0' => Some(EntryKind::Regular),
            b'5' => Some(EntryKind::Directory),
            _ => None,
        }
    }

    /// The typeflag byte written for this kind.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            EntryKind::Regular => b'0',
            EntryKind::Directory => b'5',
        }
    }
}

/// Ownership information for an entry.
///
/// Symbolic names are only stored by the UStar dialect; legacy headers keep
/// the numeric ids alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Numeric user and group ids.
    Ids { uid: u64, gid: u64 },
    /// Symbolic user and group names, with ids left at zero.
    Names { user: String, group: String },
}

impl Default for Owner {
    fn default() -> Self {
        Owner::Ids { uid: 0, gid: 0 }
    }
}

/// Metadata for one archive entry, consumed by [`Dialect::encode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// Path of the entry inside the archive, using `/` as separator.
    pub name: String,
    /// Regular file or directory.
    pub kind: EntryKind,
    /// Content length in bytes (always 0 for directories).
    pub size: u64,
    /// POSIX permission bits.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Symbolic owner name. UStar falls back to the octal uid when unset.
    pub uname: Option<String>,
    /// Symbolic group name. UStar falls back to the octal gid when unset.
    pub gname: Option<String>,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl EntryDescriptor {
    /// A regular file entry with mode 0644, root ownership and the current time.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular,
            size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mtime: SystemTime::now(),
        }
    }

    /// A directory entry with mode 0755, root ownership and the current time.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            mode: 0o755,
            ..Self::file(name, 0)
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = mtime;
        self
    }

    /// Apply an [`Owner`], replacing ids or names depending on the variant.
    #[must_use]
    pub fn with_owner(mut self, owner: Owner) -> Self {
        match owner {
            Owner::Ids { uid, gid } => {
                self.uid = uid;
                self.gid = gid;
            }
            Owner::Names { user, group } => {
                self.uname = Some(user);
                self.gname = Some(group);
            }
        }
        self
    }

    /// The name as it is stored: directories always carry a trailing `/`.
    #[must_use]
    pub fn stored_name(&self) -> Cow<'_, str> {
        if self.kind == EntryKind::Directory && !self.name.ends_with('/') {
            Cow::Owned(format!("{}/", self.name))
        } else {
            Cow::Borrowed(&self.name)
        }
    }
}

/// Header encoding strategy, chosen once per archive writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dialect {
    /// V7 headers without magic, owner names or prefix.
    Legacy,
    /// POSIX UStar headers.
    #[default]
    Ustar,
}

impl Dialect {
    /// Encode an entry's metadata into a 512-byte header block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEntryName`] when the name does not fit the
    /// dialect's name fields and [`Error::InvalidField`] when a numeric or
    /// owner field overflows its width.
    pub fn encode(self, entry: &EntryDescriptor) -> Result<HeaderBlock> {
        let name = entry.stored_name();
        validate_name(&name)?;

        let bytes: [u8; BLOCK_SIZE] = match self {
            Dialect::Legacy => {
                if name.len() > NAME_LEN {
                    return Err(invalid_name(&name, "longer than 100 bytes"));
                }
                let mut header = LegacyHeader::new_zeroed();
                copy_str(&mut header.name, name.as_bytes());
                header.typeflag = entry.kind.to_byte();
                write_numeric_fields(
                    entry,
                    &mut header.mode,
                    &mut header.uid,
                    &mut header.gid,
                    &mut header.size,
                    &mut header.mtime,
                )?;
                zerocopy::transmute!(header)
            }
            Dialect::Ustar => {
                let (prefix, short) = split_ustar_path(name.as_bytes())
                    .ok_or_else(|| invalid_name(&name, "cannot be split into prefix and name"))?;
                let mut header = UstarHeader::new_zeroed();
                copy_str(&mut header.prefix, prefix);
                copy_str(&mut header.name, short);
                header.typeflag = entry.kind.to_byte();
                header.magic = *USTAR_MAGIC;
                header.version = *USTAR_VERSION;
                write_numeric_fields(
                    entry,
                    &mut header.mode,
                    &mut header.uid,
                    &mut header.gid,
                    &mut header.size,
                    &mut header.mtime,
                )?;
                let uname = owner_name(entry.uname.as_deref(), entry.uid);
                let gname = owner_name(entry.gname.as_deref(), entry.gid);
                write_owner_name(&mut header.uname, "uname", &uname)?;
                write_owner_name(&mut header.gname, "gname", &gname)?;
                write_octal(&mut header.devmajor, "devmajor", 0)?;
                write_octal(&mut header.devminor, "devminor", 0)?;
                zerocopy::transmute!(header)
            }
        };

        let mut block = HeaderBlock { bytes };
        block.set_checksum();
        Ok(block)
    }

    /// Guess the dialect a header was written with from its magic field.
    #[must_use]
    pub fn detect(block: &HeaderBlock) -> Self {
        if block.is_ustar() {
            Dialect::Ustar
        } else {
            Dialect::Legacy
        }
    }
}

/// A complete 512-byte header block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HeaderBlock {
    bytes: [u8; BLOCK_SIZE],
}

impl HeaderBlock {
    /// Wrap raw header bytes read from an archive.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.bytes
    }

    /// View the block through the legacy layout.
    #[must_use]
    pub fn as_legacy(&self) -> &LegacyHeader {
        zerocopy::transmute_ref!(&self.bytes)
    }

    /// View the block through the UStar layout.
    #[must_use]
    pub fn as_ustar(&self) -> &UstarHeader {
        zerocopy::transmute_ref!(&self.bytes)
    }

    #[must_use]
    pub fn is_ustar(&self) -> bool {
        let ustar = self.as_ustar();
        ustar.magic == *USTAR_MAGIC && ustar.version == *USTAR_VERSION
    }

    /// Two consecutive all-zero blocks terminate an archive.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    #[must_use]
    pub fn typeflag(&self) -> u8 {
        self.as_legacy().typeflag
    }

    /// The entry kind, or `None` for typeflags this crate does not write.
    #[must_use]
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_byte(self.typeflag())
    }

    /// The raw `name` field without the UStar prefix.
    #[must_use]
    pub fn path_bytes(&self) -> &[u8] {
        truncate_null(&self.as_legacy().name)
    }

    /// The UStar `prefix` field, `None` for legacy headers.
    #[must_use]
    pub fn prefix(&self) -> Option<&[u8]> {
        self.is_ustar()
            .then(|| truncate_null(&self.as_ustar().prefix))
    }

    /// The full entry path, joining a non-empty UStar prefix with `/`.
    #[must_use]
    pub fn full_path(&self) -> Cow<'_, [u8]> {
        match self.prefix() {
            Some(prefix) if !prefix.is_empty() => {
                let mut path = prefix.to_vec();
                path.push(b'/');
                path.extend_from_slice(self.path_bytes());
                Cow::Owned(path)
            }
            _ => Cow::Borrowed(self.path_bytes()),
        }
    }

    pub fn mode(&self) -> Result<u32> {
        let mode = parse_octal(&self.as_legacy().mode)?;
        u32::try_from(mode).map_err(|_| Error::InvalidOctal(self.as_legacy().mode.to_vec()))
    }

    pub fn uid(&self) -> Result<u64> {
        parse_octal(&self.as_legacy().uid)
    }

    pub fn gid(&self) -> Result<u64> {
        parse_octal(&self.as_legacy().gid)
    }

    pub fn entry_size(&self) -> Result<u64> {
        parse_octal(&self.as_legacy().size)
    }

    /// Modification time as seconds since the Unix epoch.
    pub fn mtime(&self) -> Result<u64> {
        parse_octal(&self.as_legacy().mtime)
    }

    /// Owner user name, `None` for legacy headers.
    #[must_use]
    pub fn username(&self) -> Option<&[u8]> {
        self.is_ustar()
            .then(|| truncate_null(&self.as_ustar().uname))
    }

    /// Owner group name, `None` for legacy headers.
    #[must_use]
    pub fn groupname(&self) -> Option<&[u8]> {
        self.is_ustar()
            .then(|| truncate_null(&self.as_ustar().gname))
    }

    /// Compute the header checksum.
    ///
    /// This is the unsigned sum of all header bytes, treating the checksum
    /// field (bytes 148..156) as spaces.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        self.bytes
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                if CHECKSUM_RANGE.contains(&i) {
                    u64::from(b' ')
                } else {
                    u64::from(byte)
                }
            })
            .sum()
    }

    /// Verify the stored checksum against the header contents.
    pub fn verify_checksum(&self) -> Result<()> {
        let expected = parse_octal(&self.bytes[CHECKSUM_RANGE])?;
        let computed = self.compute_checksum();
        if expected == computed {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch { expected, computed })
        }
    }

    // Six octal digits, NUL, space: the layout every tar implementation accepts.
    fn set_checksum(&mut self) {
        let sum = self.compute_checksum();
        let field = format!("{sum:06o}\0 ");
        self.bytes[CHECKSUM_RANGE].copy_from_slice(field.as_bytes());
    }
}

impl fmt::Debug for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderBlock")
            .field("path", &String::from_utf8_lossy(&self.full_path()))
            .field("typeflag", &(self.typeflag() as char))
            .field("size", &self.entry_size().ok())
            .field("mode", &self.mode().ok().map(|m| format!("{m:04o}")))
            .field("is_ustar", &self.is_ustar())
            .finish()
    }
}

/// Split a path into UStar `(prefix, name)` fields.
///
/// Paths of up to 100 bytes go entirely into `name`. Longer paths are split
/// at the rightmost `/` that keeps the prefix within 155 bytes; the name part
/// must then be non-empty and fit in 100 bytes.
#[must_use]
pub fn split_ustar_path(path: &[u8]) -> Option<(&[u8], &[u8])> {
    if path.len() <= NAME_LEN {
        return Some((&[], path));
    }
    let search_end = path.len().min(PREFIX_LEN + 1);
    let split = path[..search_end]
        .iter()
        .rposition(|&b| b == b'/')
        .filter(|&i| i > 0 && i + 1 < path.len())?;
    let (prefix, name) = (&path[..split], &path[split + 1..]);
    (name.len() <= NAME_LEN).then_some((prefix, name))
}

/// Parse an octal ASCII field into a u64.
///
/// Octal fields in tar headers are ASCII strings with optional leading
/// spaces and trailing spaces or null bytes. For example:
/// - `"0000644\0"` -> 420 (file mode 0644)
/// - `"     123 "` -> 83
///
/// # Errors
///
/// Returns [`Error::InvalidOctal`] if the field contains invalid characters
/// (anything other than spaces, digits 0-7, or null bytes) or overflows.
pub fn parse_octal(bytes: &[u8]) -> Result<u64> {
    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
    let end = bytes[start..]
        .iter()
        .position(|&b| b == b' ' || b == b'\0')
        .map_or(bytes.len(), |i| start + i);

    let mut value: u64 = 0;
    for &byte in &bytes[start..end] {
        if !(b'0'..=b'7').contains(&byte) {
            return Err(Error::InvalidOctal(bytes.to_vec()));
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add(u64::from(byte - b'0')))
            .ok_or_else(|| Error::InvalidOctal(bytes.to_vec()))?;
    }
    Ok(value)
}

/// Truncate a byte slice at the first null byte.
///
/// ```
/// use ustar_stream::header::truncate_null;
///
/// assert_eq!(truncate_null(b"hello\0world"), b"hello");
/// assert_eq!(truncate_null(b"no null here"), b"no null here");
/// ```
#[must_use]
pub fn truncate_null(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

fn invalid_name(name: &str, reason: &'static str) -> Error {
    Error::InvalidEntryName {
        name: name.to_string(),
        reason,
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "/" {
        return Err(invalid_name(name, "empty"));
    }
    if name.as_bytes().contains(&0) {
        return Err(invalid_name(name, "contains a NUL byte"));
    }
    Ok(())
}

fn copy_str(field: &mut [u8], value: &[u8]) {
    field[..value.len()].copy_from_slice(value);
}

/// Write `value` as zero-padded octal using all but the last byte, which is NUL.
fn write_octal(field: &mut [u8], name: &'static str, value: u64) -> Result<()> {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    if text.len() > digits {
        return Err(Error::InvalidField {
            field: name,
            value: format!("{value:#o}"),
        });
    }
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = 0;
    Ok(())
}

fn write_numeric_fields(
    entry: &EntryDescriptor,
    mode: &mut [u8; 8],
    uid: &mut [u8; 8],
    gid: &mut [u8; 8],
    size: &mut [u8; 12],
    mtime: &mut [u8; 12],
) -> Result<()> {
    let size_value = match entry.kind {
        EntryKind::Regular => entry.size,
        EntryKind::Directory => 0,
    };
    let mtime_value = entry
        .mtime
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::InvalidField {
            field: "mtime",
            value: format!("{:?}", entry.mtime),
        })?
        .as_secs();

    write_octal(mode, "mode", u64::from(entry.mode))?;
    write_octal(uid, "uid", entry.uid)?;
    write_octal(gid, "gid", entry.gid)?;
    write_octal(size, "size", size_value)?;
    write_octal(mtime, "mtime", mtime_value)
}

fn owner_name(name: Option<&str>, id: u64) -> Cow<'_, str> {
    match name {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("{id:o}")),
    }
}

fn write_owner_name(field: &mut [u8; OWNER_NAME_LEN], name: &'static str, value: &str) -> Result<()> {
    if value.len() > OWNER_NAME_LEN || value.as_bytes().contains(&0) {
        return Err(Error::InvalidField {
            field: name,
            value: value.to_string(),
        });
    }
    copy_str(field, value.as_bytes());
    Ok(())
}
