//! Mailbox client trait - stateless I/O over a remote account.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::mailbox::MailboxConnection;
use crate::types::message::{HistoryDelta, MailMessage, MessagePage};

#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// List message ids matching `query`, one page at a time.
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage>;

    /// Fetch one full message (headers, text body, attachment metadata).
    async fn get_message(&self, message_id: &str) -> Result<MailMessage>;

    /// Download attachment bytes.
    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;

    /// Ids of messages added since `cursor`.
    async fn history_delta(&self, cursor: &str) -> Result<HistoryDelta>;

    /// Cursor representing "now" for later `history_delta` calls.
    async fn latest_cursor(&self) -> Result<String>;
}

/// Builds a client for a stored mailbox connection.
///
/// Fails with `MissingCredentials` when the connection cannot be used, which
/// the orchestrator treats as terminal for the scan job.
pub trait MailboxConnector: Send + Sync {
    fn connect(&self, mailbox: &MailboxConnection) -> Result<Arc<dyn MailboxClient>>;
}
