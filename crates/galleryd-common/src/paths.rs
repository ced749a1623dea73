//! Path utilities: image detection and root-confined resolution.
//!
//! Registration keys are filenames relative to the watched root, always with
//! forward slashes, so the same file reported by the watcher (absolute path)
//! and by an event (relative path) maps to the same key.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Default image extensions accepted for ingestion.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Check if a path has one of the default image extensions.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use galleryd_common::paths::is_image_file;
///
/// assert!(is_image_file(Path::new("img_001.PNG")));
/// assert!(!is_image_file(Path::new("metadata.txt")));
/// ```
pub fn is_image_file(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

/// Check if a path has one of the given extensions (case-insensitive).
pub fn has_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            extensions
                .iter()
                .any(|allowed| allowed.as_ref().eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Collapse `.` and `..` components without touching the filesystem.
///
/// Returns `None` when `..` would climb above the start of the path.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Resolve `candidate` against `base` and require the result to stay inside `root`.
///
/// Relative candidates are joined onto `base`; absolute ones are taken as-is.
/// `root` itself should already be normalized (absolute, no `..`).
pub fn resolve_within(root: &Path, base: &Path, candidate: &Path) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let normalized = normalize_lexically(&joined)
        .ok_or_else(|| Error::invalid_payload(format!("path escapes root: {}", candidate.display())))?;
    if !normalized.starts_with(root) {
        return Err(Error::invalid_payload(format!(
            "path escapes root: {}",
            candidate.display()
        )));
    }
    Ok(normalized)
}

/// Registration key of `path` relative to `root`, with forward slashes.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use galleryd_common::paths::relative_filename;
///
/// let key = relative_filename(Path::new("/out"), Path::new("/out/conduit/J1/a.png"));
/// assert_eq!(key.as_deref(), Some("conduit/J1/a.png"));
/// assert_eq!(relative_filename(Path::new("/out"), Path::new("/elsewhere/a.png")), None);
/// ```
pub fn relative_filename(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Absolute path of a registration key under `root`.
pub fn absolute_path(root: &Path, filename: &str) -> PathBuf {
    filename
        .split('/')
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}
