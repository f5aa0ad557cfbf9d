//! AI enrichment trait.
//!
//! Given text, an image or a PDF, returns a best-guess structured
//! extraction with a confidence score. The capability is optional: a
//! disabled extractor reports `is_enabled() == false` and the pipeline skips
//! enrichment as a normal outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::types::document::DocumentType;

/// Input handed to the extractor.
#[derive(Debug, Clone, Copy)]
pub enum AiInput<'a> {
    Text(&'a str),
    Image { bytes: &'a [u8], mime_type: &'a str },
    Pdf { bytes: &'a [u8], filename: &'a str },
}

impl AiInput<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            AiInput::Text(_) => "text",
            AiInput::Image { .. } => "image",
            AiInput::Pdf { .. } => "pdf",
        }
    }
}

/// Context from the regex pass that helps the model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionHints {
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiExtraction {
    pub vendor: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub doc_type: DocumentType,
    /// 0.0 to 1.0
    pub confidence: f32,
}

#[async_trait]
pub trait AiExtractor: Send + Sync {
    /// Whether calls will reach a model at all.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn extract(
        &self,
        input: AiInput<'_>,
        hints: Option<&ExtractionHints>,
    ) -> Result<AiExtraction>;
}

/// Permanent "disabled" mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExtractor;

#[async_trait]
impl AiExtractor for DisabledExtractor {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn extract(
        &self,
        _input: AiInput<'_>,
        _hints: Option<&ExtractionHints>,
    ) -> Result<AiExtraction> {
        Err(ScanError::AiDisabled)
    }
}
