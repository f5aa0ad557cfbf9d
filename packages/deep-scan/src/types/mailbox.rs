//! Mailbox connection row - the remote account a scan reads from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Clone, Serialize, Deserialize)]
pub struct MailboxConnection {
    pub id: Uuid,
    pub account_id: Uuid,
    pub email_address: String,
    /// OAuth access token; refreshing it is owned by the auth layer
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// Incremental sync cursor (history id). Advanced only after a full drain.
    pub sync_cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailboxConnection {
    pub fn new(account_id: Uuid, email_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            account_id,
            email_address: email_address.into(),
            access_token: None,
            sync_cursor: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_sync_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.sync_cursor = Some(cursor.into());
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.access_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

impl std::fmt::Debug for MailboxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConnection")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("email_address", &self.email_address)
            .field("has_credentials", &self.has_credentials())
            .field("sync_cursor", &self.sync_cursor)
            .field("last_synced_at", &self.last_synced_at)
            .finish()
    }
}
