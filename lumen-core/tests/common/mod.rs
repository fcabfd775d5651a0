//! Shared fixtures for integration tests: fake HTTP origins and analyzer wiring.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use lumen_core::{
    AdvisoryLock, Analyzer, AnalyzerConfig, CacheIndex, CacheIndexConfig, ObjectStore, ResilientTransport,
    Timeouts, VisionModel,
};

pub const IMAGE_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot really a picture but good enough for hashing";

/// A model answer that passes validation.
pub const VALID_ANALYSIS: &str = r##"{
    "meta": {"image_quality": "high", "image_type": "photo", "resolution_estimation": null},
    "global_context": {
        "scene_description": "A lighthouse on a rocky shore at dusk",
        "time_of_day": "dusk",
        "weather_atmosphere": "clear",
        "lighting": {"source": "sunset", "direction": "back", "quality": "soft", "color_temp": "warm"}
    },
    "color_palette": {"dominant_hex_estimates": ["#1E3A5F", "#F4A261"], "accent_colors": [], "contrast_level": "medium"},
    "composition": {"camera_angle": "low", "framing": "wide", "depth_of_field": "deep", "focal_point": "lighthouse"},
    "objects": [{
        "id": "obj_1", "label": "lighthouse", "category": "building", "location": "center", "prominence": "primary",
        "visual_attributes": {"color": "white", "texture": null, "material": "stone", "state": "lit", "dimensions_relative": "tall"},
        "micro_details": [], "pose_or_orientation": null, "text_content": null
    }],
    "text_ocr": {"present": false, "content": null},
    "semantic_relationships": ["lighthouse stands on rocks"]
}"##;

/// Same shape, but the required scene description is missing.
pub const MISSING_SCENE: &str = r##"{
    "meta": {"image_quality": "low", "image_type": "photo", "resolution_estimation": null},
    "global_context": {"time_of_day": null, "weather_atmosphere": null,
        "lighting": {"source": null, "direction": null, "quality": null, "color_temp": null}},
    "color_palette": {"dominant_hex_estimates": [], "accent_colors": [], "contrast_level": null},
    "composition": {"camera_angle": null, "framing": null, "depth_of_field": null, "focal_point": null},
    "objects": [],
    "text_ocr": {"present": false, "content": null},
    "semantic_relationships": []
}"##;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Clone)]
pub struct Origin {
    pub body: &'static [u8],
    pub hits: Arc<AtomicUsize>,
    /// Answer 503 this many times before serving the body
    pub failures: usize,
    /// Status served once failures are exhausted
    pub status: StatusCode,
}

impl Origin {
    pub fn serving(body: &'static [u8]) -> Self {
        Self {
            body,
            hits: Arc::new(AtomicUsize::new(0)),
            failures: 0,
            status: StatusCode::OK,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn serve_origin(State(origin): State<Origin>) -> Response {
    let hit = origin.hits.fetch_add(1, Ordering::SeqCst);
    if hit < origin.failures {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }
    if !origin.status.is_success() {
        return (origin.status, "nope").into_response();
    }
    Response::builder()
        .header("content-type", "image/png")
        .body(Body::from(origin.body))
        .unwrap()
}

/// Image origin at `{base}/image.png`. Returns the full image URL.
pub async fn spawn_origin(origin: Origin) -> String {
    let router = Router::new()
        .route("/image.png", get(serve_origin))
        .with_state(origin);
    format!("{}/image.png", spawn_server(router).await)
}

pub fn fast_config(scratch_dir: &Path) -> AnalyzerConfig {
    AnalyzerConfig {
        scratch_dir: scratch_dir.to_path_buf(),
        timeouts: Timeouts {
            fetch: Duration::from_secs(5),
            generation: Duration::from_secs(5),
        },
        fetch_retries: 2,
        retry_delay: Duration::from_millis(10),
        lock_ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
    }
}

pub fn analyzer(
    store: Arc<dyn ObjectStore>,
    lock: Arc<dyn AdvisoryLock>,
    model: Arc<dyn VisionModel>,
    config: AnalyzerConfig,
) -> Analyzer {
    Analyzer::new(
        ResilientTransport::new().unwrap(),
        CacheIndex::new(store, CacheIndexConfig::default()),
        lock,
        model,
        config,
    )
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
