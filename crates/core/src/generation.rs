//! Generation request model and pre-flight validation.
//!
//! A [`GenerationRequest`] is validated locally before it is ever handed to
//! the transport layer. Validation reports *every* violated constraint in a
//! [`ValidationReport`], not just the first one found.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Minimum prompt length, in Unicode scalar values.
pub const PROMPT_MIN_CHARS: usize = 3;
/// Maximum prompt length, in Unicode scalar values.
pub const PROMPT_MAX_CHARS: usize = 5000;
/// Shortest clip the service will render, in seconds.
pub const DURATION_MIN_SECS: u32 = 1;
/// Longest clip the service will render, in seconds.
pub const DURATION_MAX_SECS: u32 = 60;
/// Largest reference image accepted before encoding (10 MiB).
pub const MAX_REFERENCE_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// MIME types accepted for reference images.
pub const ACCEPTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];

// ---------------------------------------------------------------------------
// Aspect ratio
// ---------------------------------------------------------------------------

/// Output frame shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Square => "1:1",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "16:9" => Ok(Self::Landscape),
            "9:16" => Ok(Self::Portrait),
            "1:1" => Ok(Self::Square),
            other => Err(CoreError::UnknownVariant {
                kind: "aspect ratio",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Body of `POST /videos/generate`.
///
/// Treated as an immutable value once built; the orchestrator validates it
/// with [`GenerationRequest::validate_request`] before submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    #[validate(
        length(min = 3, max = 5000),
        custom(function = "validate_not_blank")
    )]
    pub prompt: String,

    /// Base64-encoded reference image, already in wire format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,

    /// Clip length in seconds.
    #[validate(range(min = 1, max = 60))]
    pub duration: u32,

    pub aspect_ratio: AspectRatio,

    /// Free-form caller metadata forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, duration: u32, aspect_ratio: AspectRatio) -> Self {
        Self {
            prompt: prompt.into(),
            reference_image: None,
            duration,
            aspect_ratio,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Return a copy carrying the given base64 reference image.
    pub fn with_reference_image(mut self, encoded: String) -> Self {
        self.reference_image = Some(encoded);
        self
    }

    /// Check every local constraint and collect all violations.
    pub fn validate_request(&self) -> Result<(), ValidationReport> {
        let mut report = ValidationReport::default();

        if let Err(errors) = self.validate() {
            let mut fields: Vec<_> = errors
                .field_errors()
                .into_iter()
                .map(|(field, errs)| (field.to_string(), errs.clone()))
                .collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));

            for (field, errs) in fields {
                for err in errs {
                    report.push(field.clone(), self.describe(&field, &err.code));
                }
            }
        }

        report.into_result()
    }

    fn describe(&self, field: &str, code: &str) -> String {
        match (field, code) {
            ("prompt", "length") => {
                let len = self.prompt.chars().count();
                if len < PROMPT_MIN_CHARS {
                    format!(
                        "prompt must be at least {PROMPT_MIN_CHARS} characters long (got {len})"
                    )
                } else {
                    format!(
                        "prompt must be at most {PROMPT_MAX_CHARS} characters long (got {len})"
                    )
                }
            }
            ("prompt", "blank") => "prompt must not be blank".to_string(),
            ("duration", "range") => format!(
                "duration must be between {DURATION_MIN_SECS} and {DURATION_MAX_SECS} seconds (got {})",
                self.duration
            ),
            (field, code) => format!("{field} is invalid ({code})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference image
// ---------------------------------------------------------------------------

/// A raw image the caller wants to condition the generation on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ReferenceImage {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Guess the MIME type from the file extension.
    pub fn mime_type_for(file_name: &str) -> Option<&'static str> {
        let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "webp" => Some("image/webp"),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationReport> {
        let mut report = ValidationReport::default();
        if !ACCEPTED_IMAGE_TYPES.contains(&self.mime_type.as_str()) {
            report.push(
                "reference_image",
                format!(
                    "reference image type '{}' is not supported. Must be one of: {}",
                    self.mime_type,
                    ACCEPTED_IMAGE_TYPES.join(", ")
                ),
            );
        }
        if self.bytes.is_empty() {
            report.push("reference_image", "reference image is empty");
        } else if self.bytes.len() > MAX_REFERENCE_IMAGE_BYTES {
            report.push(
                "reference_image",
                format!(
                    "reference image must be at most {MAX_REFERENCE_IMAGE_BYTES} bytes (got {})",
                    self.bytes.len()
                ),
            );
        }
        report.into_result()
    }

    /// Encode to the wire format (standard base64, no data-URL prefix).
    pub fn encode_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// One violated constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Every constraint a request violates, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.issues.extend(other.issues);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationReport> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.issues.iter().map(|i| i.message.as_str()).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationReport {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
