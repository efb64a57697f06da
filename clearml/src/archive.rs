//! Dataset contents travel as gzip-compressed tarballs with paths relative to the dataset root.

use std::{
    fs,
    io::{Cursor, Write},
    path::{Component, Path},
};

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder};

/// Pack every file below `dir` into an in-memory `.tar.gz`.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(true);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("failed to archive {}", dir.display()))?;

    let mut encoder = builder.into_inner().context("failed to finish tar stream")?;
    encoder.flush()?;
    encoder.finish().context("failed to finish gzip stream")
}

/// Extract a `.tar.gz` produced by [pack_dir] into `target`, creating it if needed.
///
/// Ownership and permissions from the archive are not preserved, and entries that would land
/// outside of `target` are rejected.
pub fn unpack(bytes: &[u8], target: &Path) -> Result<usize> {
    fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;

    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive.set_preserve_permissions(false);
    archive.set_preserve_ownerships(false);

    let mut files = 0;
    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("corrupt archive entry")?;
        let path = entry.path()?.to_path_buf();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            anyhow::bail!("archive entry {} escapes the target folder", path.display());
        }

        let is_file = entry.header().entry_type().is_file();
        // unpack_in creates missing parent directories itself.
        entry
            .unpack_in(target)
            .with_context(|| format!("failed to extract {}", path.display()))?;
        if is_file {
            files += 1;
        }
    }

    Ok(files)
}
