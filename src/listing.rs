//! Directory listing text returned by ListFiles and ChangeDir.
//!
//! ```text
//! /srv/share:
//! drwxr-xr-x  docs                4096
//! -rw-r--r--  notes.txt           12
//! count: 2
//! ```

use std::fs::{self, Metadata};
use std::io;
use std::path::Path;

#[cfg(unix)]
fn permission_bits(md: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(md: &Metadata) -> u32 {
    let base = if md.is_dir() { 0o755 } else { 0o644 };
    if md.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

/// `ls`-style mode string: type character plus nine permission flags.
pub fn mode_string(md: &Metadata) -> String {
    let kind = if md.is_dir() {
        'd'
    } else if md.file_type().is_symlink() {
        'L'
    } else {
        '-'
    };
    let bits = permission_bits(md);
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let triple = (bits >> shift) & 0o7;
        out.push(if triple & 0o4 != 0 { 'r' } else { '-' });
        out.push(if triple & 0o2 != 0 { 'w' } else { '-' });
        out.push(if triple & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Format the entries of `dir`, sorted by name, with a trailing count line.
pub fn format_listing(dir: &Path) -> io::Result<String> {
    let mut entries: Vec<(String, Metadata)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let md = fs::symlink_metadata(entry.path())?;
        entries.push((entry.file_name().to_string_lossy().into_owned(), md));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut info = format!("{}:\n", dir.display());
    for (name, md) in &entries {
        info.push_str(&format!("{:<12}{:<20}{:<10}\n", mode_string(md), name, md.len()));
    }
    info.push_str(&format!("count: {}", entries.len()));
    Ok(info)
}
