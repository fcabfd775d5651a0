//! Structured analysis record produced by the vision model and stored in the cache.
//!
//! Optional fields are `Option<T>` and serialize as explicit `null`, so every
//! stored document has the same shape whether or not the model filled a field.
//! Required fields missing from model output fail deserialization.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a document is not a valid [`AnalysisResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("not valid analysis JSON: {0}")]
    Malformed(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub meta: Meta,
    pub global_context: GlobalContext,
    pub color_palette: ColorPalette,
    pub composition: Composition,
    pub objects: Vec<DetectedObject>,
    pub text_ocr: TextOcr,
    pub semantic_relationships: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub image_quality: String,
    pub image_type: String,
    pub resolution_estimation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalContext {
    pub scene_description: String,
    pub time_of_day: Option<String>,
    pub weather_atmosphere: Option<String>,
    pub lighting: Lighting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lighting {
    pub source: Option<String>,
    pub direction: Option<String>,
    pub quality: Option<String>,
    pub color_temp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorPalette {
    pub dominant_hex_estimates: Vec<String>,
    pub accent_colors: Vec<String>,
    pub contrast_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub camera_angle: Option<String>,
    pub framing: Option<String>,
    pub depth_of_field: Option<String>,
    pub focal_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub id: String,
    pub label: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub prominence: Option<String>,
    pub visual_attributes: VisualAttributes,
    pub micro_details: Vec<String>,
    pub pose_or_orientation: Option<String>,
    pub text_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualAttributes {
    pub color: Option<String>,
    pub texture: Option<String>,
    pub material: Option<String>,
    pub state: Option<String>,
    pub dimensions_relative: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOcr {
    pub present: bool,
    pub content: Option<Vec<String>>,
}

impl AnalysisResult {
    /// Parse and validate model output or a stored cache entry.
    ///
    /// Tolerates a surrounding Markdown code fence, which some models emit
    /// even when asked for bare JSON.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let payload = strip_code_fence(text);
        let result: Self =
            serde_json::from_str(payload).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        result.validate()?;
        Ok(result)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaError> {
        let text = std::str::from_utf8(bytes).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        Self::from_json(text)
    }

    /// Canonical JSON written to the cache.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, SchemaError> {
        serde_json::to_vec_pretty(self).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.global_context.scene_description.trim().is_empty() {
            return Err(invalid(
                "global_context.scene_description",
                "must not be empty",
            ));
        }

        for (field, colors) in [
            (
                "color_palette.dominant_hex_estimates",
                &self.color_palette.dominant_hex_estimates,
            ),
            ("color_palette.accent_colors", &self.color_palette.accent_colors),
        ] {
            if let Some(bad) = colors.iter().find(|c| !is_hex_color(c)) {
                return Err(invalid(field, &format!("`{bad}` is not a hex color")));
            }
        }

        let mut seen = HashSet::new();
        for object in &self.objects {
            if !seen.insert(object.id.as_str()) {
                return Err(invalid(
                    "objects.id",
                    &format!("duplicate object id `{}`", object.id),
                ));
            }
        }

        if !self.text_ocr.present
            && self.text_ocr.content.as_ref().is_some_and(|c| !c.is_empty())
        {
            return Err(invalid(
                "text_ocr.content",
                "must be null or empty when no text is present",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> SchemaError {
    SchemaError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// `#RGB` or `#RRGGBB`.
fn is_hex_color(value: &str) -> bool {
    value
        .strip_prefix('#')
        .is_some_and(|hex| matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}


#[cfg(test)]
mod tests {
    use super::fixtures::VALID;
    use super::*;

    #[test]
    fn test_parses_valid_document() {
        let result = AnalysisResult::from_json(VALID).unwrap();
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].label, "bicycle");
        assert!(!result.text_ocr.present);
    }

    #[test]
    fn test_nulls_are_serialized_not_omitted() {
        let result = AnalysisResult::from_json(VALID).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&result.to_json_vec().unwrap()).unwrap();
        assert!(json["global_context"]
            .as_object()
            .unwrap()
            .contains_key("weather_atmosphere"));
        assert!(json["global_context"]["weather_atmosphere"].is_null());
        assert!(json["text_ocr"]["content"].is_null());
    }

    #[test]
    fn test_missing_scene_description_rejected() {
        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        doc["global_context"]
            .as_object_mut()
            .unwrap()
            .remove("scene_description");
        let err = AnalysisResult::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, SchemaError::Malformed(msg) if msg.contains("scene_description")));
    }

    #[test]
    fn test_blank_scene_description_rejected() {
        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        doc["global_context"]["scene_description"] = "   ".into();
        let err = AnalysisResult::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { field, .. } if field == "global_context.scene_description"));
    }

    #[test]
    fn test_bad_hex_color_rejected() {
        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        doc["color_palette"]["accent_colors"] = serde_json::json!(["teal"]);
        assert!(AnalysisResult::from_json(&doc.to_string()).is_err());
    }

    #[test]
    fn test_duplicate_object_ids_rejected() {
        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        let object = doc["objects"][0].clone();
        doc["objects"].as_array_mut().unwrap().push(object);
        assert!(AnalysisResult::from_json(&doc.to_string()).is_err());
    }

    #[test]
    fn test_code_fence_is_stripped() {
        let fenced = format!("```json\n{VALID}\n```");
        assert!(AnalysisResult::from_json(&fenced).is_ok());
    }

    #[test]
    fn test_hex_color_check() {
        assert!(is_hex_color("#abc"));
        assert!(is_hex_color("#A1B2C3"));
        assert!(!is_hex_color("A1B2C3"));
        assert!(!is_hex_color("#A1B2C"));
        assert!(!is_hex_color("#GGGGGG"));
    }
}
