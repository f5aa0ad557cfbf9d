//! Testing utilities including mock implementations.
//!
//! These are useful for driving the pipeline without a real mailbox or AI
//! service. Every mock records its calls for assertions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Result, ScanError};
use crate::traits::{
    ai::{AiExtraction, AiExtractor, AiInput, ExtractionHints},
    mailbox::{MailboxClient, MailboxConnector},
};
use crate::types::document::DocumentType;
use crate::types::mailbox::MailboxConnection;
use crate::types::message::{HistoryDelta, MailMessage, MessagePage};

// =============================================================================
// MockMailbox
// =============================================================================

/// Record of a call made to the mock mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockMailboxCall {
    List { page_token: Option<String> },
    Get { message_id: String },
    Attachment { message_id: String, attachment_id: String },
    History { cursor: String },
    LatestCursor,
}

/// A mock mailbox with predefined pages, messages and history.
#[derive(Default)]
pub struct MockMailbox {
    /// Listing pages keyed by the page token that requests them
    pages: Arc<RwLock<HashMap<Option<String>, MessagePage>>>,
    messages: Arc<RwLock<HashMap<String, MailMessage>>>,
    attachments: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
    history: Arc<RwLock<Option<HistoryDelta>>>,
    cursor: Arc<RwLock<Option<String>>>,
    unauthorized: Arc<RwLock<bool>>,
    calls: Arc<RwLock<Vec<MockMailboxCall>>>,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self {
            cursor: Arc::new(RwLock::new(Some("history-1".to_string()))),
            ..Default::default()
        }
    }

    /// Serve `pages` in order; page N is requested with token `page-N`.
    pub fn with_pages(self, pages: Vec<Vec<String>>) -> Self {
        {
            let mut stored = self.pages.write().unwrap();
            stored.clear();
            let count = pages.len();
            for (idx, ids) in pages.into_iter().enumerate() {
                let token = (idx > 0).then(|| format!("page-{}", idx));
                let next_page_token = (idx + 1 < count).then(|| format!("page-{}", idx + 1));
                stored.insert(token, MessagePage { ids, next_page_token });
            }
        }
        self
    }

    pub fn with_message(self, message: MailMessage) -> Self {
        self.messages
            .write()
            .unwrap()
            .insert(message.id.clone(), message);
        self
    }

    pub fn with_messages(self, messages: impl IntoIterator<Item = MailMessage>) -> Self {
        messages.into_iter().fold(self, Self::with_message)
    }

    pub fn with_attachment(
        self,
        message_id: impl Into<String>,
        attachment_id: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.attachments
            .write()
            .unwrap()
            .insert((message_id.into(), attachment_id.into()), bytes);
        self
    }

    pub fn with_history(self, delta: HistoryDelta) -> Self {
        *self.history.write().unwrap() = Some(delta);
        self
    }

    pub fn with_latest_cursor(self, cursor: impl Into<String>) -> Self {
        *self.cursor.write().unwrap() = Some(cursor.into());
        self
    }

    /// Make `latest_cursor` fail.
    pub fn without_latest_cursor(self) -> Self {
        *self.cursor.write().unwrap() = None;
        self
    }

    /// Make every call fail as if the token was revoked.
    pub fn unauthorized(self) -> Self {
        *self.unauthorized.write().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<MockMailboxCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.count(|c| matches!(c, MockMailboxCall::List { .. }))
    }

    pub fn get_calls(&self) -> usize {
        self.count(|c| matches!(c, MockMailboxCall::Get { .. }))
    }

    pub fn attachment_calls(&self) -> usize {
        self.count(|c| matches!(c, MockMailboxCall::Attachment { .. }))
    }

    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    fn count(&self, pred: impl Fn(&MockMailboxCall) -> bool) -> usize {
        self.calls.read().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: MockMailboxCall) -> Result<()> {
        self.calls.write().unwrap().push(call);
        if *self.unauthorized.read().unwrap() {
            return Err(ScanError::Unauthorized("401: token revoked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxClient for MockMailbox {
    async fn list_messages(
        &self,
        _query: &str,
        page_token: Option<&str>,
        _page_size: u32,
    ) -> Result<MessagePage> {
        let page_token = page_token.map(str::to_string);
        self.record(MockMailboxCall::List {
            page_token: page_token.clone(),
        })?;

        let pages = self.pages.read().unwrap();
        match pages.get(&page_token) {
            Some(page) => Ok(page.clone()),
            None if page_token.is_none() => Ok(MessagePage::default()),
            None => Err(ScanError::Mailbox(format!(
                "unknown page token {:?}",
                page_token
            ))),
        }
    }

    async fn get_message(&self, message_id: &str) -> Result<MailMessage> {
        self.record(MockMailboxCall::Get {
            message_id: message_id.to_string(),
        })?;
        self.messages
            .read()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| ScanError::Mailbox(format!("404: message {} not found", message_id)))
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        self.record(MockMailboxCall::Attachment {
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
        })?;
        Ok(self
            .attachments
            .read()
            .unwrap()
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .unwrap_or_else(|| b"%PDF-1.4 mock".to_vec()))
    }

    async fn history_delta(&self, cursor: &str) -> Result<HistoryDelta> {
        self.record(MockMailboxCall::History {
            cursor: cursor.to_string(),
        })?;
        Ok(self
            .history
            .read()
            .unwrap()
            .clone()
            .unwrap_or(HistoryDelta::Changes(Vec::new())))
    }

    async fn latest_cursor(&self) -> Result<String> {
        self.record(MockMailboxCall::LatestCursor)?;
        self.cursor
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ScanError::Mailbox("503: profile unavailable".into()))
    }
}

/// Connector that hands out one shared [`MockMailbox`].
///
/// Mirrors the real connector's credential check.
#[derive(Clone)]
pub struct MockConnector {
    mailbox: Arc<MockMailbox>,
}

impl MockConnector {
    pub fn new(mailbox: Arc<MockMailbox>) -> Self {
        Self { mailbox }
    }
}

impl MailboxConnector for MockConnector {
    fn connect(&self, mailbox: &MailboxConnection) -> Result<Arc<dyn MailboxClient>> {
        if !mailbox.has_credentials() {
            return Err(ScanError::MissingCredentials(mailbox.id));
        }
        Ok(self.mailbox.clone())
    }
}

// =============================================================================
// MockAi
// =============================================================================

/// Record of a call made to the mock AI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockAiCall {
    pub input_kind: &'static str,
    pub bytes: usize,
    pub vendor_hint: Option<String>,
}

/// A mock AI extractor returning a configurable response.
pub struct MockAi {
    enabled: bool,
    response: Arc<RwLock<std::result::Result<AiExtraction, String>>>,
    calls: Arc<RwLock<Vec<MockAiCall>>>,
}

impl Default for MockAi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAi {
    /// Enabled, answering with a confident invoice.
    pub fn new() -> Self {
        Self {
            enabled: true,
            response: Arc::new(RwLock::new(Ok(AiExtraction {
                vendor: Some("Mock Vendor".into()),
                amount_minor: Some(10_000),
                currency: Some("USD".into()),
                category: Some("software".into()),
                doc_type: DocumentType::Invoice,
                confidence: 0.95,
            }))),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Reports itself disabled, like a missing API key.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn with_response(self, extraction: AiExtraction) -> Self {
        *self.response.write().unwrap() = Ok(extraction);
        self
    }

    pub fn failing(self, error: impl Into<String>) -> Self {
        *self.response.write().unwrap() = Err(error.into());
        self
    }

    pub fn calls(&self) -> Vec<MockAiCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl AiExtractor for MockAi {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn extract(
        &self,
        input: AiInput<'_>,
        hints: Option<&ExtractionHints>,
    ) -> Result<AiExtraction> {
        let bytes = match input {
            AiInput::Text(text) => text.len(),
            AiInput::Image { bytes, .. } | AiInput::Pdf { bytes, .. } => bytes.len(),
        };
        self.calls.write().unwrap().push(MockAiCall {
            input_kind: input.kind(),
            bytes,
            vendor_hint: hints.and_then(|h| h.vendor.clone()),
        });

        if !self.enabled {
            return Err(ScanError::AiDisabled);
        }
        self.response
            .read()
            .unwrap()
            .clone()
            .map_err(ScanError::Ai)
    }
}
