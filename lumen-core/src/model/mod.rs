//! Vision model abstraction.
//!
//! The model is an opaque, slow and non-deterministic function from image
//! bytes plus a prompt to a JSON string. The analyzer validates whatever comes
//! back; implementations only move bytes.

#[cfg(feature = "gemini")]
mod gemini;
mod mock;

#[cfg(feature = "gemini")]
pub use gemini::{GeminiConfig, GeminiVisionModel};
pub use mock::MockVisionModel;

use async_trait::async_trait;
use thiserror::Error;

use crate::prompt::AnalysisMode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Provider unreachable or answered with an error status
    #[error("Model request failed: {0}")]
    Request(String),

    /// Provider answered but returned no usable text
    #[error("Model returned no content: {0}")]
    EmptyResponse(String),

    /// The image itself was rejected (unsupported format, too large, ...)
    #[error("Model rejected input: {0}")]
    Rejected(String),
}

/// Generates a JSON analysis for an image.
///
/// Implementations must be thread-safe (`Send + Sync`) and should not retry
/// internally beyond transient transport failures; the analyzer bounds the
/// whole call with its generation timeout.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn analyze(&self, image: &[u8], prompt: &str, mode: AnalysisMode) -> Result<String, ModelError>;

    /// Model identifier for logs.
    fn model_name(&self) -> &str;
}

/// Best-effort MIME type from magic bytes.
pub fn sniff_mime_type(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [_, _, _, _, b'f', b't', b'y', b'p', b'h', b'e', b'i', b'c', ..] => "image/heic",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_mime_type() {
        assert_eq!(sniff_mime_type(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]), "image/png");
        assert_eq!(sniff_mime_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_mime_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime_type(b"GIF89a"), "image/gif");
        assert_eq!(sniff_mime_type(b"plain text"), "application/octet-stream");
        assert_eq!(sniff_mime_type(&[]), "application/octet-stream");
    }
}
