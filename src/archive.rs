//! Directory archives for single-stream transfer
//!
//! A directory tree is packed into one tar file whose entry names are
//! rooted at the directory's basename (`data`, `data/a.txt`, ...), so
//! unpacking into any destination recreates the directory there.

use crate::error::{Result, TransferError};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// A temporary archive file that is removed when dropped.
///
/// Named `<basename>-<uuid>.tar` and placed in a caller-chosen directory
/// (alongside the source, or in the receiving working directory).
#[derive(Debug)]
pub struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    /// Reserve a unique archive name for `base` inside `dir`. Nothing is
    /// created on disk until the archive is written.
    pub fn new_in(dir: &Path, base: &str) -> Self {
        let name = format!("{}-{}.tar", base, uuid::Uuid::new_v4().simple());
        Self {
            path: dir.join(name),
        }
    }

    /// Reserve an archive name next to `source`.
    pub fn alongside(source: &Path) -> Self {
        let base = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let parent = match source.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::new_in(&parent, &base)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Name under which `source` itself appears in the archive.
fn root_name(source: &Path) -> Result<PathBuf> {
    let canonical = source.canonicalize()?;
    canonical
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| TransferError::Protocol(format!("cannot archive {:?}: no name", source)))
}

/// Forward-slash archive name for a path relative to the archive root.
fn entry_name(root: &Path, rel: &Path) -> String {
    let mut name = root.to_string_lossy().replace('\\', "/");
    for comp in rel.components() {
        if let Component::Normal(s) = comp {
            name.push('/');
            name.push_str(&s.to_string_lossy());
        }
    }
    name
}

/// Pack the tree at `source` into a tar file at `archive_path`.
///
/// Directories are emitted header-only, regular files as header plus
/// content; other node kinds are skipped. On failure the partially
/// written archive is left for the caller to remove.
/// Returns the number of entries written.
pub fn pack(source: &Path, archive_path: &Path) -> Result<u64> {
    let root = root_name(source)?;
    let file = File::create(archive_path)?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);
    let mut entries = 0u64;

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            TransferError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk failed")))
        })?;
        let path = entry.path();
        // The archive being written may live inside the packed tree.
        if path == archive_path {
            continue;
        }
        let rel = path.strip_prefix(source).unwrap_or(path);
        let name = entry_name(&root, rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            builder.append_dir(&name, path)?;
        } else if ft.is_file() {
            let mut f = File::open(path)?;
            builder.append_file(&name, &mut f)?;
        } else {
            continue;
        }
        entries += 1;
    }

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    Ok(entries)
}

/// Reject archive names that would land outside the destination.
pub(crate) fn safe_relative(name: &Path) -> Result<PathBuf> {
    let mut safe = PathBuf::new();
    for comp in name.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::Protocol(format!(
                    "archive entry {:?} escapes the destination",
                    name
                )));
            }
        }
    }
    Ok(safe)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

/// Make an existing directory writable by its owner so entries can be
/// replaced inside it. Its archived mode is applied afterwards.
fn open_up_dir(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => apply_mode(path, 0o700 | current_mode(&md)),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn current_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn current_mode(md: &fs::Metadata) -> u32 {
    if md.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

/// Remove a file left by an earlier unpack; a read-only file cannot be
/// truncated in place.
fn clear_file(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if !md.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

fn header_mode(header: &Header, fallback: u32) -> u32 {
    header.mode().unwrap_or(fallback)
}

/// Unpack the archive at `archive_path` under `dest_root`.
///
/// Missing parents are created on demand, so entries may arrive in any
/// order. Existing files are replaced, even read-only ones. File
/// permissions are applied as each file is written; directory
/// permissions once every entry is in place. Stops at the first error.
/// Returns the number of entries unpacked.
pub fn unpack(archive_path: &Path, dest_root: &Path) -> Result<u64> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(io::BufReader::new(file));
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    let mut count = 0u64;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = safe_relative(&entry.path()?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest_root.join(&rel);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                open_up_dir(&target)?;
                dir_modes.push((target, header_mode(entry.header(), 0o755)));
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mode = header_mode(entry.header(), 0o644);
                clear_file(&target)?;
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                drop(out);
                apply_mode(&target, mode)?;
            }
            _ => continue,
        }
        count += 1;
    }

    // Deepest first so a read-only parent does not block its children.
    dir_modes.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));
    for (dir, mode) in dir_modes {
        apply_mode(&dir, mode)?;
    }
    Ok(count)
}
