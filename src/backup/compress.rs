//! Streamed gzip recompression of dump artifacts.

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Fixed read/write unit; keeps memory flat regardless of dump size.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// `dump.sql` -> `dump.sql.gz`
pub fn gz_path_for(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".gz");
    PathBuf::from(name)
}

/// Compresses `source` next to itself and returns the `.gz` path and its size.
///
/// The source file is left untouched; on any error the partial `.gz` is removed.
pub fn gzip_file(source: &Path) -> Result<(PathBuf, u64)> {
    let gz_path = gz_path_for(source);
    match write_gzip(source, &gz_path) {
        Ok(size) => Ok((gz_path, size)),
        Err(e) => {
            let _ = fs::remove_file(&gz_path);
            Err(e)
        }
    }
}

fn write_gzip(source: &Path, gz_path: &Path) -> Result<u64> {
    let mut input = File::open(source)
        .with_context(|| format!("Failed to reopen {} for compression", source.display()))?;
    let output = File::create(gz_path)
        .with_context(|| format!("Failed to create gzip file {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::best());

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read {} during compression", source.display())
                });
            }
        };
        write_chunk(&mut encoder, &buf[..read])?;
    }

    let file = encoder
        .finish()
        .context("Failed to close gzip file (data may be corrupted)")?;
    file.sync_all()
        .context("Failed to flush gzip file to disk")?;
    drop(file);

    let size = fs::metadata(gz_path)
        .with_context(|| format!("Gzip file missing after compression: {}", gz_path.display()))?
        .len();
    if size == 0 {
        bail!("Gzip compression produced empty file: {}", gz_path.display());
    }
    Ok(size)
}

/// Writes one chunk, treating a zero-length write as a full disk.
pub(crate) fn write_chunk<W: Write>(writer: &mut W, chunk: &[u8]) -> Result<()> {
    let mut remaining = chunk;
    while !remaining.is_empty() {
        match writer.write(remaining) {
            Ok(0) => bail!("Failed to write gzip data (possible disk full)"),
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to write gzip data"),
        }
    }
    Ok(())
}
