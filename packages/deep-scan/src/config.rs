use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::types::message::AttachmentRef;

/// Default Gmail search for financial documents.
pub const DEFAULT_DISCOVERY_QUERY: &str = "{invoice receipt factura recibo \"order confirmation\" \"payment received\" \"your bill\" \"tax invoice\"} -in:chats";

/// Tunables for the scan pipeline.
///
/// Defaults are sized for a host that kills invocations after 60 seconds.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Wall-clock budget per invocation (host limit minus safety margin)
    pub time_budget: Duration,
    pub discovery_query: String,
    pub page_size: u32,
    pub regex_batch_size: i64,
    pub ai_batch_size: i64,
    /// Attachments below this are logos and tracking pixels
    pub min_attachment_bytes: u64,
    /// Attachments above this are unrelated assets
    pub max_attachment_bytes: u64,
    /// Provisional confidence of a regex-only document
    pub regex_confidence: f32,
    /// AI output below this is ignored
    pub ai_accept_threshold: f32,
    /// AI output at or above this goes straight to PENDING; otherwise REVIEW
    pub high_confidence: f32,
    /// Prior high-confidence documents needed for the vendor shortcut
    pub vendor_shortcut_min: i64,
    /// AI calls allowed per incremental sync run
    pub incremental_ai_cap: u32,
    /// Messages listed when the sync cursor has expired
    pub recent_fallback_limit: usize,
    pub recent_fallback_query: String,
    /// Claims older than this are considered abandoned
    pub claim_lease: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(50),
            discovery_query: DEFAULT_DISCOVERY_QUERY.to_string(),
            page_size: 500,
            regex_batch_size: 50,
            ai_batch_size: 5,
            min_attachment_bytes: 10_000,
            max_attachment_bytes: 10 * 1024 * 1024,
            regex_confidence: 0.5,
            ai_accept_threshold: 0.6,
            high_confidence: 0.85,
            vendor_shortcut_min: 3,
            incremental_ai_cap: 5,
            recent_fallback_limit: 50,
            recent_fallback_query: format!("{} newer_than:7d", DEFAULT_DISCOVERY_QUERY),
            claim_lease: Duration::from_secs(10 * 60),
        }
    }
}

impl ScanConfig {
    /// Load overrides from `SCAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("SCAN_TIME_BUDGET_SECS")? {
            config.time_budget = Duration::from_secs(secs);
        }
        if let Ok(query) = env::var("SCAN_DISCOVERY_QUERY") {
            config.discovery_query = query;
        }
        if let Some(size) = env_parse("SCAN_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Some(size) = env_parse("SCAN_REGEX_BATCH_SIZE")? {
            config.regex_batch_size = size;
        }
        if let Some(size) = env_parse("SCAN_AI_BATCH_SIZE")? {
            config.ai_batch_size = size;
        }
        if let Some(bytes) = env_parse("SCAN_MIN_ATTACHMENT_BYTES")? {
            config.min_attachment_bytes = bytes;
        }
        if let Some(bytes) = env_parse("SCAN_MAX_ATTACHMENT_BYTES")? {
            config.max_attachment_bytes = bytes;
        }
        if let Some(threshold) = env_parse("SCAN_AI_ACCEPT_THRESHOLD")? {
            config.ai_accept_threshold = threshold;
        }
        if let Some(cap) = env_parse("SCAN_INCREMENTAL_AI_CAP")? {
            config.incremental_ai_cap = cap;
        }

        Ok(config)
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_regex_batch_size(mut self, size: i64) -> Self {
        self.regex_batch_size = size;
        self
    }

    pub fn with_ai_batch_size(mut self, size: i64) -> Self {
        self.ai_batch_size = size;
        self
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Size within the sane band for AI extraction.
    pub fn size_in_band(&self, size: u64) -> bool {
        size >= self.min_attachment_bytes && size <= self.max_attachment_bytes
    }

    /// PDF or image attachment with a plausible size.
    pub fn is_plausible_attachment(&self, attachment: &AttachmentRef) -> bool {
        attachment.kind().is_some() && self.size_in_band(attachment.size)
    }
}

/// Worker process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub gmail_api_base: String,
    /// Six-field cron expression for `serve`
    pub tick_schedule: String,
    pub scan: ScanConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            gmail_api_base: env::var("GMAIL_API_BASE")
                .unwrap_or_else(|_| "https://gmail.googleapis.com/gmail/v1".to_string()),
            tick_schedule: env::var("SCAN_TICK_SCHEDULE")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
            scan: ScanConfig::from_env()?,
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(None),
    }
}
