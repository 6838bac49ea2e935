//! Utility functions for mcp-stdio-client

use std::path::{Path, PathBuf};

use crate::Result;

/// Validate and canonicalize a directory path.
///
/// The path must exist and be a directory; symlinks and `..` are resolved.
pub fn validate_and_canonicalize_path(path: &Path) -> Result<PathBuf> {
    let canonical_path = path.canonicalize().map_err(|_| {
        crate::Error::InvalidPath(format!("Invalid or non-existent path: {}", path.display()))
    })?;

    if !canonical_path.is_dir() {
        return Err(crate::Error::InvalidPath(format!(
            "Not a directory: {}",
            path.display()
        )));
    }

    Ok(canonical_path)
}
