//! Module archive container: a gzip-compressed tar holding exactly four
//! flat entries.
//!
//! Writes are deterministic (fixed entry order, mode, owner and mtime) and
//! published atomically through a uniquely named temp sibling.  Reads accept only regular
//! files with a single plain path component, so an archive can never place
//! anything outside the directory it is unpacked into.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::Compression;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const EMBEDDINGS_ENTRY: &str = "embeddings.pkl";
pub const SOURCES_ENTRY: &str = "sources.json";
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Canonical entry order inside every archive.
pub const ENTRY_ORDER: [&str; 4] = [METADATA_ENTRY, EMBEDDINGS_ENTRY, SOURCES_ENTRY, MANIFEST_ENTRY];

const ENTRY_MODE: u32 = 0o644;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("archive read interrupted")]
    Interrupted,
}

/// Write `entries` as a tar.gz at `dest`.
///
/// The archive is assembled in a uniquely named temp file beside `dest` and
/// persisted over it only once fully written and synced.  Concurrent writers
/// of the same `dest` never share a staging file; the last one to persist
/// wins.  On any error the temp file is removed and `dest` is untouched.
pub fn write_entries(entries: &[(&str, &[u8])], dest: &Path) -> Result<(), ArchiveError> {
    for (name, _) in entries {
        if plain_name(Path::new(name)).is_none() {
            return Err(ArchiveError::Malformed(format!(
                "entry name `{name}` must be a bare file name"
            )));
        }
    }

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{}.", staging_stem(dest)))
        .suffix(".tmp")
        .tempfile_in(parent_dir(dest))?;

    {
        let mut tar = tar::Builder::new(GzEncoder::new(
            BufWriter::new(staging.as_file()),
            Compression::default(),
        ));

        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(ENTRY_MODE);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            tar.append_data(&mut header, name, *data)?;
        }

        let encoder = tar.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
    }

    staging.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

/// Archive the named files from `dir`, in the order given, at `dest`.
pub fn pack_dir(dir: &Path, names: &[&str], dest: &Path) -> Result<(), ArchiveError> {
    let mut staged = Vec::with_capacity(names.len());
    for name in names {
        staged.push((*name, fs::read(dir.join(name))?));
    }
    let entries: Vec<(&str, &[u8])> = staged
        .iter()
        .map(|(name, bytes)| (*name, bytes.as_slice()))
        .collect();
    write_entries(&entries, dest)
}

/// Extract every entry of `archive` into `dir`, returning the entry names in
/// archive order.
pub fn unpack_into(archive: &Path, dir: &Path) -> Result<Vec<String>, ArchiveError> {
    unpack_into_until(archive, dir, &AtomicBool::new(false))
}

/// [`unpack_into`] that stops with [`ArchiveError::Interrupted`] once
/// `cancelled` is set.  The flag is polled between read chunks.
pub fn unpack_into_until(
    archive: &Path,
    dir: &Path,
    cancelled: &AtomicBool,
) -> Result<Vec<String>, ArchiveError> {
    let mut names = Vec::new();
    for_each_entry(archive, cancelled, |name, bytes| {
        fs::write(dir.join(&name), bytes)?;
        names.push(name);
        Ok(true)
    })?;
    Ok(names)
}

/// Read a single entry without extracting the rest.  `Ok(None)` when the
/// archive has no entry by that name.
pub fn read_entry(archive: &Path, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut found = None;
    for_each_entry(archive, &AtomicBool::new(false), |entry_name, bytes| {
        if entry_name == name {
            found = Some(bytes);
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(found)
}

/// Visit entries in order; the visitor returns `Ok(false)` to stop early.
fn for_each_entry<F>(archive: &Path, cancelled: &AtomicBool, mut visit: F) -> Result<(), ArchiveError>
where
    F: FnMut(String, Vec<u8>) -> Result<bool, ArchiveError>,
{
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    for entry in tar.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let entry_type = entry.header().entry_type();
        let raw_path = entry.path().map_err(malformed)?.into_owned();

        if entry_type != tar::EntryType::Regular {
            return Err(ArchiveError::Malformed(format!(
                "entry `{}` is not a regular file",
                raw_path.display()
            )));
        }
        let Some(name) = plain_name(&raw_path) else {
            return Err(ArchiveError::Malformed(format!(
                "entry `{}` is not a bare file name",
                raw_path.display()
            )));
        };

        let mut bytes = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if cancelled.load(Ordering::Relaxed) {
                return Err(ArchiveError::Interrupted);
            }
            let n = entry.read(&mut buf).map_err(malformed)?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
        }
        if !visit(name, bytes)? {
            break;
        }
    }

    Ok(())
}

/// `Some(name)` when `path` is exactly one normal component (a leading `./`
/// is tolerated).
pub(crate) fn plain_name(path: &Path) -> Option<String> {
    let mut components = path
        .components()
        .filter(|component| !matches!(component, Component::CurDir));
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name.to_str().map(str::to_string),
        _ => None,
    }
}

fn staging_stem(dest: &Path) -> String {
    dest.file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "module".to_string())
}

fn parent_dir(dest: &Path) -> &Path {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn malformed(err: io::Error) -> ArchiveError {
    ArchiveError::Malformed(err.to_string())
}
