//! Analyze command implementation.

use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use lumen_core::{
    AnalysisMode, AnalysisRequest, Analyzer, CancelSignal, GeminiConfig, GeminiVisionModel,
    LumenConfig, Origin, ResilientTransport,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::utils::{build_cache, print_json, print_summary};

/// Execute the analyze command.
pub async fn execute(url: String, mode: AnalysisMode, json: bool, keep_scratch: bool) -> Result<()> {
    // Model credentials first: no point fetching an image we cannot analyze
    let gemini = GeminiConfig::from_env()?;
    let config = LumenConfig::from_env();
    debug!(?config, "Loaded configuration");

    let transport = ResilientTransport::new()?;
    let cache = build_cache(&config, &transport);
    let lock = config.build_lock()?;
    let model = Arc::new(GeminiVisionModel::new(transport.clone(), gemini));
    let analyzer = Analyzer::new(transport, cache, lock, model, config.analyzer_config());

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel("interrupted");
        }
    });

    let request = AnalysisRequest::new(url.as_str())
        .with_mode(mode)
        .with_cancel(cancel);
    let outcome = analyzer.analyze_detailed(request).await;
    interrupt.abort();
    let analysis = outcome?;

    info!(hash = %analysis.hash, origin = %analysis.origin, "Analysis ready");

    if json {
        print_json(&json!({
            "hash": analysis.hash,
            "origin": analysis.origin,
            "bytes": analysis.bytes,
            "mode": mode,
            "result": analysis.result.as_ref(),
        }))?;
    } else {
        let origin = match analysis.origin {
            Origin::CacheHit => "cache hit".green(),
            Origin::Generated => "generated".yellow(),
            Origin::Coalesced => "coalesced".cyan(),
        };
        println!();
        println!("{} {}", "Analysis".bold(), url);
        println!("   {} {}", "Hash:".dimmed(), analysis.hash);
        println!("   {} {}", "Origin:".dimmed(), origin);
        println!("   {} {} bytes", "Size:".dimmed(), analysis.bytes);
        println!("   {} {}", "Mode:".dimmed(), mode);
        print_summary(&analysis.result);
        println!();
    }

    // Cache write and snapshot upload run in the background
    analyzer.flush().await;

    if keep_scratch {
        eprintln!("Scratch copy kept at {}", analysis.scratch_path.display());
    } else if let Err(e) = tokio::fs::remove_file(&analysis.scratch_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, path = %analysis.scratch_path.display(), "Failed to remove scratch copy");
        }
    }

    Ok(())
}

