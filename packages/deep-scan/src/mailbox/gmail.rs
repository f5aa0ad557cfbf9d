//! Gmail REST adapter.
//!
//! Token refresh belongs to the auth layer; this client only uses the access
//! token stored on the mailbox connection. 401/403 responses are terminal.

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, Engine, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::traits::mailbox::{MailboxClient, MailboxConnector};
use crate::types::mailbox::MailboxConnection;
use crate::types::message::{AttachmentRef, HistoryDelta, MailMessage, MessagePage};

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail emits URL-safe base64 with or without padding.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

lazy_static! {
    static ref HTML_TAG_REGEX: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"[ \t]+").unwrap();
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<RawHeader>,
    body: Option<RawBody>,
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBody {
    attachment_id: Option<String>,
    #[serde(default)]
    size: u64,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    history_id: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: String,
}

// =============================================================================
// Client
// =============================================================================

/// Gmail client bound to one mailbox's access token.
#[derive(Clone)]
pub struct GmailClient {
    http_client: Client,
    access_token: String,
    base_url: String,
}

impl GmailClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), access_token, DEFAULT_GMAIL_API_BASE)
    }

    pub fn with_client(
        http_client: Client,
        access_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            access_token: access_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http_client
            .get(format!("{}/users/me/{}", self.base_url, path))
            .bearer_auth(&self.access_token)
    }

    /// Send and decode, mapping auth failures to `Unauthorized`.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        match self.send_raw(request).await? {
            Ok(value) => Ok(value),
            Err(status) => Err(ScanError::Mailbox(format!("Gmail API error: {}", status))),
        }
    }

    /// Like `send`, but hands non-auth error statuses back to the caller.
    async fn send_raw<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<std::result::Result<T, StatusCode>> {
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "Gmail request failed");
            ScanError::Mailbox(e.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ScanError::Unauthorized(format!("{}: {}", status, error_text)));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Gmail API error");
            return Ok(Err(status));
        }

        let value = response
            .json::<T>()
            .await
            .map_err(|e| ScanError::Mailbox(format!("invalid Gmail response: {}", e)))?;
        Ok(Ok(value))
    }
}

#[async_trait]
impl MailboxClient for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", page_size.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response: ListResponse = self.send(self.get("messages").query(&params)).await?;
        debug!(
            count = response.messages.len(),
            has_more = response.next_page_token.is_some(),
            "listed Gmail messages"
        );

        Ok(MessagePage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn get_message(&self, message_id: &str) -> Result<MailMessage> {
        let raw: RawMessage = self
            .send(
                self.get(&format!("messages/{}", message_id))
                    .query(&[("format", "full")]),
            )
            .await?;
        Ok(parse_message(raw))
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let response: AttachmentResponse = self
            .send(self.get(&format!(
                "messages/{}/attachments/{}",
                message_id, attachment_id
            )))
            .await?;
        BASE64_URL
            .decode(response.data.as_bytes())
            .map_err(|e| ScanError::Mailbox(format!("invalid attachment encoding: {}", e)))
    }

    async fn history_delta(&self, cursor: &str) -> Result<HistoryDelta> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("startHistoryId", cursor.to_string()),
                ("historyTypes", "messageAdded".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let response: HistoryResponse =
                match self.send_raw(self.get("history").query(&params)).await? {
                    Ok(response) => response,
                    Err(StatusCode::NOT_FOUND) => {
                        debug!(cursor, "Gmail history cursor expired");
                        return Ok(HistoryDelta::CursorExpired);
                    }
                    Err(status) => {
                        return Err(ScanError::Mailbox(format!("Gmail history error: {}", status)))
                    }
                };

            ids.extend(
                response
                    .history
                    .into_iter()
                    .flat_map(|record| record.messages_added)
                    .map(|added| added.message.id),
            );

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        Ok(HistoryDelta::Changes(ids))
    }

    async fn latest_cursor(&self) -> Result<String> {
        let profile: ProfileResponse = self.send(self.get("profile")).await?;
        Ok(profile.history_id)
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Builds a [`GmailClient`] per mailbox, sharing one HTTP connection pool.
#[derive(Clone)]
pub struct GmailConnector {
    http_client: Client,
    base_url: String,
}

impl GmailConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for GmailConnector {
    fn default() -> Self {
        Self::new(DEFAULT_GMAIL_API_BASE)
    }
}

impl MailboxConnector for GmailConnector {
    fn connect(&self, mailbox: &MailboxConnection) -> Result<Arc<dyn MailboxClient>> {
        let token = mailbox
            .access_token
            .as_deref()
            .filter(|_| mailbox.has_credentials())
            .ok_or(ScanError::MissingCredentials(mailbox.id))?;

        Ok(Arc::new(GmailClient::with_client(
            self.http_client.clone(),
            token,
            self.base_url.clone(),
        )))
    }
}

// =============================================================================
// Parsing
// =============================================================================

pub(crate) fn parse_message(raw: RawMessage) -> MailMessage {
    let payload = raw.payload.unwrap_or_default();

    let header = |name: &str| {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let received_at = raw
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or_else(|| {
            DateTime::parse_from_rfc2822(&header("Date"))
                .ok()
                .map(|d| d.with_timezone(&Utc))
        });

    let mut plain = Vec::new();
    let mut html = Vec::new();
    let mut attachments = Vec::new();
    walk_parts(&payload, &mut plain, &mut html, &mut attachments);

    let body_text = if !plain.is_empty() {
        plain.join("\n")
    } else {
        html.iter()
            .map(|h| strip_html(h))
            .collect::<Vec<_>>()
            .join("\n")
    };

    MailMessage {
        id: raw.id,
        thread_id: raw.thread_id,
        from: header("From"),
        subject: header("Subject"),
        snippet: raw.snippet,
        body_text,
        received_at,
        attachments,
    }
}

fn walk_parts(
    part: &RawPart,
    plain: &mut Vec<String>,
    html: &mut Vec<String>,
    attachments: &mut Vec<AttachmentRef>,
) {
    let body = part.body.as_ref();

    if let Some(attachment_id) = body.and_then(|b| b.attachment_id.as_ref()) {
        if !part.filename.is_empty() {
            attachments.push(AttachmentRef {
                attachment_id: attachment_id.clone(),
                filename: part.filename.clone(),
                mime_type: part.mime_type.clone(),
                size: body.map(|b| b.size).unwrap_or_default(),
            });
        }
    } else if let Some(data) = body.and_then(|b| b.data.as_deref()) {
        let decoded = BASE64_URL
            .decode(data.as_bytes())
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        match (part.mime_type.as_str(), decoded) {
            ("text/plain", Some(text)) => plain.push(text),
            ("text/html", Some(text)) => html.push(text),
            _ => {}
        }
    }

    for child in &part.parts {
        walk_parts(child, plain, html, attachments);
    }
}

fn strip_html(html: &str) -> String {
    let text = HTML_TAG_REGEX.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&euro;", "€")
        .replace("&pound;", "£");
    WHITESPACE_REGEX.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    #[test]
    fn test_parse_multipart_message() {
        let json = serde_json::json!({
            "id": "18c1",
            "threadId": "18c0",
            "snippet": "Thanks for your order",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "\"Acme Billing\" <billing@acme.com>"},
                    {"name": "Subject", "value": "Your invoice INV-42"}
                ],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"mimeType": "text/plain", "body": {"size": 20, "data": encode("Total due: $120.00")}},
                            {"mimeType": "text/html", "body": {"size": 40, "data": encode("<p>Total due</p>")}}
                        ]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "INV-42.pdf",
                        "body": {"attachmentId": "att-9", "size": 48211}
                    }
                ]
            }
        });

        let raw: RawMessage = serde_json::from_value(json).unwrap();
        let message = parse_message(raw);

        assert_eq!(message.id, "18c1");
        assert_eq!(message.thread_id.as_deref(), Some("18c0"));
        assert_eq!(message.subject, "Your invoice INV-42");
        assert_eq!(message.sender_name().as_deref(), Some("Acme Billing"));
        assert_eq!(message.body_text, "Total due: $120.00");
        assert_eq!(
            message.received_at.map(|d| d.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].attachment_id, "att-9");
        assert_eq!(message.attachments[0].size, 48_211);
    }

    #[test]
    fn test_html_only_body_is_stripped() {
        let json = serde_json::json!({
            "id": "m",
            "payload": {
                "mimeType": "text/html",
                "headers": [{"name": "subject", "value": "Receipt"}],
                "body": {"size": 60, "data": encode("<div>Total&nbsp;<b>€12,50</b></div>")}
            }
        });

        let message = parse_message(serde_json::from_value(json).unwrap());
        assert_eq!(message.subject, "Receipt");
        assert_eq!(message.body_text, "Total €12,50");
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_padded_base64_decodes() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode("ab");
        assert!(padded.ends_with('='));
        assert_eq!(BASE64_URL.decode(padded).unwrap(), b"ab");
    }

    #[test]
    fn test_connector_requires_token() {
        let connector = GmailConnector::default();
        let mailbox = MailboxConnection::new(uuid::Uuid::new_v4(), "me@example.com");
        assert!(matches!(
            connector.connect(&mailbox),
            Err(ScanError::MissingCredentials(id)) if id == mailbox.id
        ));

        let mailbox = mailbox.with_access_token("ya29.token");
        assert!(connector.connect(&mailbox).is_ok());
    }
}
