//! Scripted vision model for testing.
//!
//! WARNING: Do not use in production - returns a canned response!

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelError, VisionModel};
use crate::prompt::AnalysisMode;

pub struct MockVisionModel {
    outcome: Result<String, ModelError>,
    delay: Duration,
    calls: AtomicUsize,
    modes: Mutex<Vec<AnalysisMode>>,
}

impl MockVisionModel {
    /// Answer every call with `response`.
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            outcome: Ok(response.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call with `error`.
    pub fn failing(error: ModelError) -> Self {
        Self {
            outcome: Err(error),
            ..Self::new(String::new())
        }
    }

    /// Sleep this long before answering, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls started, including ones abandoned mid-way.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Modes requested so far, in call order.
    pub fn modes(&self) -> Vec<AnalysisMode> {
        self.modes.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VisionModel for MockVisionModel {
    async fn analyze(&self, _image: &[u8], _prompt: &str, mode: AnalysisMode) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut modes) = self.modes.lock() {
            modes.push(mode);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
