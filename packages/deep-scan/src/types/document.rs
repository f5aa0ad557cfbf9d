//! FinancialDocument model.
//!
//! Documents belong to the surrounding product; the scan only creates them
//! (regex pass) and enriches them in place (AI pass). The idempotency key is
//! the remote message id scoped to the owning account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "document_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Ready to forward downstream
    #[default]
    Pending,
    /// Low confidence, needs a human look
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "document_type", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Invoice,
    Receipt,
    #[default]
    Unknown,
}

impl DocumentType {
    /// Lenient parse of model output.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "invoice" | "bill" | "factura" => DocumentType::Invoice,
            "receipt" | "recibo" | "ticket" => DocumentType::Receipt,
            _ => DocumentType::Unknown,
        }
    }
}

/// Which pass last wrote the document's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "document_source", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentSource {
    #[default]
    Regex,
    Ai,
    /// Copied from the vendor's prior high-confidence documents
    Pattern,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct FinancialDocument {
    pub id: Uuid,
    pub account_id: Uuid,
    pub mailbox_id: Uuid,
    pub source_message_id: String,
    pub vendor: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub doc_type: DocumentType,
    pub status: DocumentStatus,
    pub source: DocumentSource,
    pub confidence: f32,
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload produced by the regex pass.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewDocument {
    pub account_id: Uuid,
    pub mailbox_id: Uuid,
    pub source_message_id: String,
    #[builder(default)]
    pub vendor: Option<String>,
    #[builder(default)]
    pub amount_minor: Option<i64>,
    #[builder(default)]
    pub currency: Option<String>,
    #[builder(default)]
    pub category: Option<String>,
    #[builder(default)]
    pub doc_type: DocumentType,
    #[builder(default = 0.5)]
    pub confidence: f32,
    #[builder(default)]
    pub subject: Option<String>,
    #[builder(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

impl NewDocument {
    pub fn into_document(self) -> FinancialDocument {
        let now = Utc::now();
        FinancialDocument {
            id: Uuid::now_v7(),
            account_id: self.account_id,
            mailbox_id: self.mailbox_id,
            source_message_id: self.source_message_id,
            vendor: self.vendor,
            amount_minor: self.amount_minor,
            currency: self.currency,
            category: self.category,
            doc_type: self.doc_type,
            status: DocumentStatus::Pending,
            source: DocumentSource::Regex,
            confidence: self.confidence,
            subject: self.subject,
            issued_at: self.issued_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-place overwrite applied by the AI pass. `None` keeps the current value.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub vendor: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub doc_type: Option<DocumentType>,
    pub status: DocumentStatus,
    pub source: DocumentSource,
    pub confidence: f32,
}

/// Category agreed on by a vendor's prior high-confidence documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorConsensus {
    /// Normalized vendor spelling used by the prior documents
    pub vendor: String,
    pub category: String,
    pub supporting_documents: i64,
}
