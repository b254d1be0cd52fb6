use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ustar_stream::{ArchiveReader, ArchiveWriter, Dialect, WriterOptions};

/// ustar
#[derive(Debug, Parser)]
#[clap(name = "ustar", version)]
pub struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an archive from files and directories
    Create {
        /// the archive to write
        archive: PathBuf,
        /// files and directories to add, in order
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        /// write legacy (V7) headers instead of UStar
        #[clap(long)]
        legacy: bool,
        /// only add the immediate contents of directories
        #[clap(long)]
        no_recursive: bool,
    },
    /// Lists the entries of an archive
    List {
        archive: PathBuf,
    },
    /// Extracts an archive into a directory
    Extract {
        archive: PathBuf,
        dest: PathBuf,
    },
}

fn create(archive: &Path, paths: &[PathBuf], legacy: bool, recursive: bool) -> Result<()> {
    let file = File::create(archive).with_context(|| format!("creating {}", archive.display()))?;
    let options = WriterOptions {
        dialect: if legacy { Dialect::Legacy } else { Dialect::Ustar },
        ..Default::default()
    };
    let mut writer = ArchiveWriter::with_options(BufWriter::new(file), options);

    for path in paths {
        let result = if path.is_dir() {
            writer.write_directory(path, recursive)
        } else {
            writer.write_file(path)
        };
        if let Err(e) = result {
            // a terminator would make the partial archive look complete
            writer.abandon();
            return Err(e).with_context(|| format!("adding {}", path.display()));
        }
    }

    let stats = writer.stats();
    writer.finish()?.flush()?;
    log::info!("wrote {} entries to {}", stats.entries, archive.display());
    Ok(())
}

fn list(archive: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut reader = ArchiveReader::new(BufReader::new(file));
    while let Some(entry) = reader.next_entry()? {
        let owner = match (&entry.uname, &entry.gname) {
            (Some(user), Some(group)) => format!("{user}/{group}"),
            _ => format!("{}/{}", entry.uid, entry.gid),
        };
        println!(
            "{} {:04o} {owner} {:>10} {}",
            entry.typeflag as char, entry.mode, entry.size, entry.path
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Create {
            ref archive,
            ref paths,
            legacy,
            no_recursive,
        } => create(archive, paths, legacy, !no_recursive)?,
        Command::List { ref archive } => list(archive)?,
        Command::Extract { archive, dest } => {
            let file =
                File::open(&archive).with_context(|| format!("opening {}", archive.display()))?;
            ArchiveReader::new(BufReader::new(file))
                .unpack(&dest)
                .with_context(|| format!("extracting into {}", dest.display()))?;
        }
    }
    Ok(())
}
