//! File access confined to the sandbox root.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncReadExt;

use super::ExecutionError;

/// Resolve `relative` under `root`.
///
/// # Errors
/// `PathEscape` for absolute paths, any `..` component, or a path whose
/// existing ancestor resolves (through symlinks) outside the root.
pub(crate) fn confine(root: &Path, relative: &str) -> Result<PathBuf, ExecutionError> {
    let candidate = Path::new(relative);
    if relative.trim().is_empty() {
        return Err(ExecutionError::PathEscape(relative.to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExecutionError::PathEscape(relative.to_string()));
            }
        }
    }
    let joined = root.join(candidate);

    // Symlinks inside the root could still point out of it.
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ExecutionError::Failure(format!("sandbox root unavailable: {}", e)))?;
    let mut existing = joined.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    if let Ok(resolved) = existing.canonicalize() {
        if !resolved.starts_with(&canonical_root) {
            return Err(ExecutionError::PathEscape(relative.to_string()));
        }
    }
    Ok(joined)
}

/// Read a file, keeping at most `cap` bytes.
pub(crate) async fn read_file(
    root: &Path,
    relative: &str,
    cap: usize,
) -> Result<(String, bool), ExecutionError> {
    let path = confine(root, relative)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ExecutionError::Failure(format!("cannot read '{}': {}", relative, e)))?;
    // One byte past the cap tells us whether anything was cut.
    let mut bytes = Vec::new();
    file.take((cap as u64).saturating_add(1))
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| ExecutionError::Failure(format!("cannot read '{}': {}", relative, e)))?;
    let truncated = bytes.len() > cap;
    bytes.truncate(cap);
    Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
}

/// Write a file, creating parent directories inside the root.
pub(crate) async fn write_file(
    root: &Path,
    relative: &str,
    contents: &str,
) -> Result<usize, ExecutionError> {
    let path = confine(root, relative)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecutionError::Failure(format!("cannot create '{}': {}", parent.display(), e)))?;
    }
    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| ExecutionError::Failure(format!("cannot write '{}': {}", relative, e)))?;
    Ok(contents.len())
}
