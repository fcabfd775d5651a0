//! Lookup command implementation.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use lumen_core::{ContentHash, LumenConfig, ResilientTransport};
use serde_json::json;

use crate::utils::{build_cache, print_json, print_summary};

/// Execute the lookup command.
pub async fn execute(hash: String, json: bool) -> Result<()> {
    let hash: ContentHash = hash.parse().context("Invalid content hash")?;
    let config = LumenConfig::from_env();
    let transport = ResilientTransport::new()?;
    let cache = build_cache(&config, &transport);

    let Some(result) = cache.lookup(&hash).await else {
        bail!("No cached analysis for {hash}");
    };

    if json {
        print_json(&json!({ "hash": hash, "result": result }))?;
    } else {
        println!();
        println!("{} {}", "Cached analysis".green().bold(), hash);
        print_summary(&result);
        println!();
    }
    Ok(())
}
