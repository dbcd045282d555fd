//! Resume position persisted between runs.
//!
//! The file holds a single decimal message id.

use std::path::Path;

use anyhow::{Context, Result};

/// Read the stored position; a missing or empty file means zero.
pub fn read(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cursor file: {}", path.display()))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse()
        .with_context(|| format!("Cursor file does not hold a message id: {}", path.display()))
}

/// Store `position`, creating parent directories as needed.
pub fn write(path: &Path, position: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, format!("{position}\n"))
        .with_context(|| format!("Failed to write cursor file: {}", path.display()))
}
