//! Common utility functions shared across CLI commands.

use anyhow::Result;
use colored::Colorize;
use lumen_core::{AnalysisResult, CacheIndex, LumenConfig, ResilientTransport};

/// Cache index over the object store selected by the environment.
pub fn build_cache(config: &LumenConfig, transport: &ResilientTransport) -> CacheIndex {
    CacheIndex::new(config.build_store(transport), config.cache_config())
}

/// Human-readable summary of an analysis.
pub fn print_summary(result: &AnalysisResult) {
    let context = &result.global_context;
    println!("   {} {}", "Scene:".dimmed(), context.scene_description);
    if let Some(time) = &context.time_of_day {
        println!("   {} {}", "Time of day:".dimmed(), time);
    }
    println!(
        "   {} {} / {}",
        "Image:".dimmed(),
        result.meta.image_type,
        result.meta.image_quality
    );
    if !result.color_palette.dominant_hex_estimates.is_empty() {
        println!(
            "   {} {}",
            "Palette:".dimmed(),
            result.color_palette.dominant_hex_estimates.join(" ")
        );
    }

    println!("   {} {}", "Objects:".dimmed(), result.objects.len());
    for object in result.objects.iter().take(10) {
        let location = object.location.as_deref().unwrap_or("-");
        println!("     - {} {}", object.label.bold(), format!("({location})").dimmed());
    }
    if result.objects.len() > 10 {
        println!("     ... and {} more", result.objects.len() - 10);
    }

    if result.text_ocr.present {
        let lines = result.text_ocr.content.as_ref().map(Vec::len).unwrap_or(0);
        println!("   {} {} line(s)", "Text:".dimmed(), lines);
    }
}

/// Pretty JSON on stdout.
pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

