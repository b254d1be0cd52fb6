//! Archives written here must be readable by an independent tar implementation.

use std::{
    fs,
    io::{Cursor, Read},
    path::Path,
    time::{Duration, UNIX_EPOCH},
};

use similar_asserts::assert_eq;

use ustar_stream::{
    ArchiveReader, ArchiveWriter, Dialect, EntryDescriptor, Owner, Progress, WriterOptions,
};

#[derive(Debug, PartialEq, Eq)]
struct Seen {
    path: String,
    kind: tar::EntryType,
    size: u64,
    mode: u32,
    content: Vec<u8>,
}

fn read_with_tar(archive: &[u8]) -> Vec<Seen> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let header = entry.header().clone();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            Seen {
                path: String::from_utf8(entry.path_bytes().into_owned()).unwrap(),
                kind: header.entry_type(),
                size: header.size().unwrap(),
                mode: header.mode().unwrap(),
                content,
            }
        })
        .collect()
}

fn sample(dialect: Dialect) -> Vec<u8> {
    let options = WriterOptions {
        dialect,
        ..Default::default()
    };
    let mtime = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let mut writer = ArchiveWriter::with_options(Vec::new(), options);
    writer
        .write_entry(
            &EntryDescriptor::directory("docs").with_mtime(mtime),
            std::io::empty(),
        )
        .unwrap();
    writer
        .write_stream(
            &b"hello"[..],
            5,
            "docs/a.txt",
            Owner::Ids { uid: 1000, gid: 1000 },
            0o644,
            mtime,
        )
        .unwrap();
    writer
        .write_with(
            &EntryDescriptor::file("docs/produced.bin", 1500).with_mode(0o600),
            |w| {
                w.write_chunk(&[0xab; 600])?;
                Ok(())
            },
        )
        .unwrap();
    writer.finish().unwrap()
}

#[test]
fn test_tar_crate_reads_ustar() {
    let seen = read_with_tar(&sample(Dialect::Ustar));
    assert_eq!(
        seen,
        vec![
            Seen {
                path: "docs/".into(),
                kind: tar::EntryType::Directory,
                size: 0,
                mode: 0o755,
                content: vec![],
            },
            Seen {
                path: "docs/a.txt".into(),
                kind: tar::EntryType::Regular,
                size: 5,
                mode: 0o644,
                content: b"hello".to_vec(),
            },
            Seen {
                path: "docs/produced.bin".into(),
                kind: tar::EntryType::Regular,
                size: 1500,
                mode: 0o600,
                content: vec![0xab; 1500],
            },
        ]
    );
}

#[test]
fn test_tar_crate_reads_legacy() {
    let archive = sample(Dialect::Legacy);
    let seen = read_with_tar(&archive);
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1].path.as_str(), "docs/a.txt");
    assert_eq!(seen[1].content, b"hello".to_vec());

    let mut reader = tar::Archive::new(Cursor::new(&archive[..]));
    for entry in reader.entries().unwrap() {
        let entry = entry.unwrap();
        assert!(entry.header().as_ustar().is_none());
    }
}

#[test]
fn test_footprints_are_block_aligned() {
    for dialect in [Dialect::Legacy, Dialect::Ustar] {
        let mut writer = ArchiveWriter::with_options(
            Vec::new(),
            WriterOptions {
                dialect,
                ..Default::default()
            },
        );
        for size in [0u64, 1, 511, 512, 513, 1023, 1024, 4097] {
            let before = writer.position();
            let data = vec![b'z'; size as usize];
            writer
                .write_entry(&EntryDescriptor::file(format!("f{size}"), size), &data[..])
                .unwrap();
            let footprint = writer.position() - before;
            let padding = footprint - 512 - size;
            assert_eq!(footprint % 512, 0);
            assert!(padding < 512);
        }
    }
}

#[test]
fn test_long_ustar_name_roundtrip() {
    let name = format!("{}/{}/{}", "a".repeat(80), "b".repeat(60), "c".repeat(58));
    assert_eq!(name.len(), 200);

    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .write_entry(&EntryDescriptor::file(name.clone(), 3), &b"abc"[..])
        .unwrap();
    let archive = writer.finish().unwrap();

    let seen = read_with_tar(&archive);
    assert_eq!(seen[0].path, name);

    let mut reader = ArchiveReader::new(&archive[..]);
    let entry = reader.next_entry().unwrap().unwrap();
    assert_eq!(entry.path, name);
    assert_eq!(reader.read_content().unwrap(), b"abc".to_vec());
}

#[test]
fn test_producer_protocol_end_to_end() {
    let parts: [&[u8]; 3] = [b"one-", b"two-three-", b"four"];
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut next = 0;
    let mut exhausted_seen = false;

    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .write_with(&EntryDescriptor::file("parts", total as u64), |w| {
            match parts.get(next) {
                Some(part) => {
                    assert_eq!(w.write_chunk(part)?, Progress::Written(part.len()));
                    next += 1;
                }
                None => exhausted_seen = w.write_chunk(b"extra")? == Progress::Exhausted,
            }
            Ok(())
        })
        .unwrap();
    // One more call after the budget is used up, which sees exhaustion.
    assert_eq!(next, 3);
    assert!(exhausted_seen);

    let seen = read_with_tar(&writer.finish().unwrap());
    assert_eq!(seen[0].content, b"one-two-three-four".to_vec());
}

#[test]
fn test_directory_tree_roundtrip() {
    let src = tempfile::tempdir().unwrap();
    let tree = src.path().join("tree");
    fs::create_dir_all(tree.join("nested/empty")).unwrap();
    fs::write(tree.join("root.txt"), b"root file").unwrap();
    fs::write(tree.join("nested/data.bin"), vec![9u8; 2000]).unwrap();

    let mut writer = ArchiveWriter::new(Vec::new());
    writer.write_directory(&tree, true).unwrap();
    let archive = writer.finish().unwrap();

    let dest = tempfile::tempdir().unwrap();
    ArchiveReader::new(&archive[..]).unpack(dest.path()).unwrap();

    let extracted = dest.path().join(tree.strip_prefix("/").unwrap_or(&tree));
    assert_eq!(fs::read(extracted.join("root.txt")).unwrap(), b"root file".to_vec());
    assert_eq!(
        fs::read(extracted.join("nested/data.bin")).unwrap(),
        vec![9u8; 2000]
    );
    assert!(extracted.join("nested/empty").is_dir());

    let mut unpacked_by_tar = tar::Archive::new(&archive[..]);
    let other = tempfile::tempdir().unwrap();
    unpacked_by_tar.unpack(other.path()).unwrap();
    let relative = tree.strip_prefix("/").unwrap_or(Path::new("tree"));
    assert_eq!(
        fs::read(other.path().join(relative).join("root.txt")).unwrap(),
        b"root file".to_vec()
    );
}

#[test]
fn test_close_twice_single_terminator() {
    let mut writer = ArchiveWriter::new(Vec::new());
    writer
        .write_entry(&EntryDescriptor::file("x", 1), &b"x"[..])
        .unwrap();
    writer.close().unwrap();
    writer.close().unwrap();
    let archive = writer.finish().unwrap();
    assert_eq!(archive.len(), 1024 + 1024);
}
