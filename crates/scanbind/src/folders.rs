//! Folder normalization and page image enumeration.

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Page image extensions, matched case-insensitively.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

/// Absolute, lexically normalized form of `path` (`.` and `..` resolved
/// without touching the filesystem).
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Normalized folder for a user-supplied path; a regular file is replaced by
/// its parent directory.
pub fn normalize_folder(path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    if normalized.is_file() {
        if let Some(parent) = normalized.parent() {
            return parent.to_path_buf();
        }
    }
    normalized
}

/// Every supported image under `folder` (recursively), natural-sorted.
pub fn list_images(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", folder.display()),
        ));
    }
    let mut images: Vec<PathBuf> = WalkDir::new(folder)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| normalize_path(e.path()))
        .filter(|p| is_supported_image(p))
        .collect();
    sort_natural(&mut images);
    Ok(images)
}

pub fn sort_natural(paths: &mut [PathBuf]) {
    paths.sort_by(|a, b| compare_paths(a, b));
}

/// Natural order on file names, ties broken by the full path.
pub fn compare_paths(a: &Path, b: &Path) -> Ordering {
    let name_a = a.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let name_b = b.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    natural_cmp(&name_a, &name_b).then_with(|| a.cmp(b))
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk<'a> {
    Text(&'a str),
    Digits(&'a str),
}

fn chunks(s: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_digits: Option<bool> = None;
    for (i, c) in s.char_indices() {
        let digit = c.is_ascii_digit();
        match in_digits {
            Some(prev) if prev != digit => {
                out.push(chunk(&s[start..i], prev));
                start = i;
            }
            _ => {}
        }
        in_digits = Some(digit);
    }
    if let Some(digit) = in_digits {
        out.push(chunk(&s[start..], digit));
    }
    out
}

fn chunk(s: &str, digits: bool) -> Chunk<'_> {
    if digits {
        Chunk::Digits(s)
    } else {
        Chunk::Text(s)
    }
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let ta = a.trim_start_matches('0');
    let tb = b.trim_start_matches('0');
    ta.len()
        .cmp(&tb.len())
        .then_with(|| ta.cmp(tb))
        // "007" after "7": fewer leading zeros first keeps the order total.
        .then_with(|| a.len().cmp(&b.len()))
}

/// Compares digit runs numerically (any length) and text runs
/// case-insensitively; equal keys fall back to a plain byte comparison so
/// only identical strings compare equal.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let ca = chunks(a);
    let cb = chunks(b);
    for (x, y) in ca.iter().zip(cb.iter()) {
        let ord = match (x, y) {
            (Chunk::Digits(x), Chunk::Digits(y)) => cmp_digits(x, y),
            (Chunk::Text(x), Chunk::Text(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ca.len().cmp(&cb.len()).then_with(|| a.cmp(b))
}
