//! OpenAI chat-completions extractor for invoices and receipts.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::extractor::parse_minor_units;
use crate::traits::ai::{AiExtraction, AiExtractor, AiInput, ExtractionHints};
use crate::types::document::DocumentType;

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = r#"You extract financial documents (invoices and receipts) from emails and their attachments.
Respond with a single JSON object:
{"vendor": string|null, "amount": number|null, "currency": ISO 4217 code|null, "category": string|null, "type": "invoice"|"receipt"|"unknown", "confidence": number between 0 and 1}
"amount" is the total charged in major units (e.g. 12.50). Use lowercase single-word categories such as software, travel, food, transport, utilities, shopping, subscriptions.
"confidence" reflects how sure you are that this is a real invoice or receipt and that the fields are correct."#;

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    vendor: Option<String>,
    #[serde(default)]
    amount: Value,
    currency: Option<String>,
    category: Option<String>,
    #[serde(rename = "type", default)]
    doc_type: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// OpenAI-backed [`AiExtractor`].
#[derive(Clone)]
pub struct OpenAiExtractor {
    http_client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiExtractor {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_OPENAI_BASE.to_string(),
        }
    }

    /// Set a custom base URL (for proxies or compatible gateways).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn user_content(input: &AiInput<'_>, hints: Option<&ExtractionHints>) -> Value {
        let mut text = String::from("Extract the financial document.");
        if let Some(hints) = hints {
            if let Some(subject) = &hints.subject {
                text.push_str(&format!("\nEmail subject: {}", subject));
            }
            if let Some(sender) = &hints.sender {
                text.push_str(&format!("\nSender: {}", sender));
            }
            if let Some(vendor) = &hints.vendor {
                text.push_str(&format!("\nLikely vendor: {}", vendor));
            }
        }

        match input {
            AiInput::Text(body) => json!([
                {"type": "text", "text": format!("{}\n\n{}", text, body)}
            ]),
            AiInput::Image { bytes, mime_type } => json!([
                {"type": "text", "text": text},
                {
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))}
                }
            ]),
            AiInput::Pdf { bytes, filename } => json!([
                {"type": "text", "text": text},
                {
                    "type": "file",
                    "file": {
                        "filename": filename,
                        "file_data": format!("data:application/pdf;base64,{}", STANDARD.encode(bytes))
                    }
                }
            ]),
        }
    }
}

#[async_trait]
impl AiExtractor for OpenAiExtractor {
    async fn extract(
        &self,
        input: AiInput<'_>,
        hints: Option<&ExtractionHints>,
    ) -> Result<AiExtraction> {
        let start = std::time::Instant::now();
        let body = json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::user_content(&input, hints)}
            ]
        });

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI request failed");
                ScanError::Ai(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenAI API error");
            return Err(ScanError::Ai(format!("OpenAI API error {}: {}", status, error_text)));
        }

        let chat: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| ScanError::Ai(format!("invalid OpenAI response: {}", e)))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ScanError::Ai("No response from OpenAI".into()))?;

        debug!(
            model = %self.model,
            input = input.kind(),
            duration_ms = start.elapsed().as_millis() as u64,
            "OpenAI extraction"
        );

        parse_extraction(&content)
    }
}

/// Decode the model's JSON object.
pub fn parse_extraction(content: &str) -> Result<AiExtraction> {
    let raw: RawExtraction = serde_json::from_str(content.trim())?;

    let amount_minor = match &raw.amount {
        Value::Number(n) => n.as_f64().map(|major| (major * 100.0).round() as i64),
        Value::String(s) => parse_minor_units(s),
        _ => None,
    };

    Ok(AiExtraction {
        vendor: non_empty(raw.vendor),
        amount_minor,
        currency: non_empty(raw.currency).map(|c| c.to_ascii_uppercase()),
        category: non_empty(raw.category),
        doc_type: raw
            .doc_type
            .as_deref()
            .map(DocumentType::parse)
            .unwrap_or_default(),
        confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
