//! Hash command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use lumen_core::hash_reader;
use tracing::info;

/// Print the content hash that keys cache entries for `file`.
pub async fn execute(file: PathBuf) -> Result<()> {
    let mut reader = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let hash = hash_reader(&mut reader)
        .await
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    info!(path = %file.display(), hash = %hash.short(), "Hashed file");
    println!("{hash}");
    Ok(())
}
