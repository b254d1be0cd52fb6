//! Archiving whole directories.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    error::{Error, Result},
    writer::ArchiveWriter,
};

impl<W: Write> ArchiveWriter<W> {
    /// Archive the directory at `path`.
    ///
    /// Writes a directory entry for `path`, then every regular file directly
    /// inside it, then every subdirectory. With `recursive`, each
    /// subdirectory is archived the same way; otherwise only its directory
    /// entry is written. Entries appear in the order the filesystem lists
    /// them. Symbolic links and other special files are skipped.
    pub fn write_directory(&mut self, path: impl AsRef<Path>, recursive: bool) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || !path.is_dir() {
            return Err(Error::PathNotFound(path.to_path_buf()));
        }
        self.walk(path, recursive)
    }

    fn walk(&mut self, dir: &Path, recursive: bool) -> Result<()> {
        let owner = self.options().owner.clone();
        let mode = self.options().dir_mode;
        self.write_directory_entry(dir, owner.clone(), mode)?;

        let (files, subdirs) = list_directory(dir)?;
        debug!(
            "{}: {} files, {} subdirectories",
            dir.display(),
            files.len(),
            subdirs.len()
        );

        for file in &files {
            self.write_file(file)?;
        }
        for subdir in &subdirs {
            if recursive {
                // The recursive call writes the subdirectory's own entry.
                self.walk(subdir, true)?;
            } else {
                self.write_directory_entry(subdir, owner.clone(), mode)?;
            }
        }
        Ok(())
    }
}

/// Split the immediate children of `dir` into regular files and directories.
///
/// Symbolic links are not followed and are skipped like other special files,
/// so a link back to an ancestor cannot make the walk loop.
fn list_directory(dir: &Path) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_file() => files.push(path),
            Ok(ft) if ft.is_dir() => subdirs.push(path),
            Ok(_) => trace!("skipping special file {}", path.display()),
            Err(e) => trace!("skipping {}: {e}", path.display()),
        }
    }
    Ok((files, subdirs))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use crate::reader::ArchiveReader;

    use super::*;

    fn fixture() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("walk-fixture");
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("top.txt"), b"top").unwrap();
        fs::write(root.join("sub/inner.txt"), b"inner").unwrap();
        fs::write(root.join("sub/deeper/leaf.txt"), b"leaf").unwrap();
        dir
    }

    fn entry_names(archive: Vec<u8>) -> Vec<String> {
        let mut reader = ArchiveReader::new(Cursor::new(archive));
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            names.push(entry.path);
        }
        names
    }

    fn suffixes(names: &[String], base: &str) -> Vec<String> {
        names
            .iter()
            .map(|n| n.rsplit_once(base).map(|(_, rest)| rest.to_string()).unwrap())
            .collect()
    }

    #[test]
    fn test_recursive_walk() {
        let dir = fixture();
        let root = dir.path().join("walk-fixture");
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_directory(&root, true).unwrap();
        let names = entry_names(writer.finish().unwrap());

        let names = suffixes(&names, "/walk-fixture");
        assert_eq!(
            names,
            [
                "/",
                "/top.txt",
                "/sub/",
                "/sub/inner.txt",
                "/sub/deeper/",
                "/sub/deeper/leaf.txt"
            ]
        );
    }

    #[test]
    fn test_shallow_walk() {
        let dir = fixture();
        let root = dir.path().join("walk-fixture");
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_directory(&root, false).unwrap();
        let names = entry_names(writer.finish().unwrap());

        let names = suffixes(&names, "/walk-fixture");
        assert_eq!(names, ["/", "/top.txt", "/sub/"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        use std::os::unix::fs::symlink;

        let dir = fixture();
        let root = dir.path().join("walk-fixture");
        symlink(".", root.join("sub/loop")).unwrap();
        symlink("top.txt", root.join("link.txt")).unwrap();

        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_directory(&root, true).unwrap();
        let names = entry_names(writer.finish().unwrap());

        let mut names = suffixes(&names, "/walk-fixture");
        names.sort();
        assert_eq!(
            names,
            [
                "/",
                "/sub/",
                "/sub/deeper/",
                "/sub/deeper/leaf.txt",
                "/sub/inner.txt",
                "/top.txt"
            ]
        );
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new(Vec::new());

        let err = writer
            .write_directory(dir.path().join("nope"), true)
            .unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));

        let err = writer.write_directory("", true).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
        assert_eq!(writer.position(), 0);
    }
}
