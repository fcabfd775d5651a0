//! Unlock command implementation.
//!
//! Operator escape hatch for a lock whose holder died without releasing it
//! and whose TTL is longer than anyone wants to wait.

use anyhow::{Context, Result};
use colored::Colorize;
use lumen_core::{paths, ContentHash, LumenConfig, LumenError};
use tracing::info;

pub async fn execute(hash: String) -> Result<()> {
    let hash: ContentHash = hash.parse().context("Invalid content hash")?;
    let config = LumenConfig::from_env();
    let lock = config.build_lock()?;

    if lock.backend_name() == "noop" {
        return Err(LumenError::Config(
            "No coordination backend configured (set LUMEN_REDIS_URL)".into(),
        )
        .into());
    }

    let key = paths::lock_key(&hash);
    let removed = lock
        .force_release(&key)
        .await
        .with_context(|| format!("Failed to release {key}"))?;

    info!(key, removed, "Force release finished");
    if removed {
        println!("{} {}", "Released".green().bold(), key);
    } else {
        println!("{} {}", "Not held:".dimmed(), key);
    }
    Ok(())
}
