//! Remote mailbox payloads as seen by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a remote query listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Result of asking for changes since a saved cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryDelta {
    /// Ids of messages added since the cursor
    Changes(Vec<String>),
    /// The cursor is too old or invalid; caller must fall back to a listing
    CursorExpired,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    /// Raw `From` header, e.g. `"Acme Billing" <billing@acme.com>`
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentRef>,
}

impl MailMessage {
    /// Display name from the `From` header, if present.
    pub fn sender_name(&self) -> Option<String> {
        let from = self.from.trim();
        let name = match from.find('<') {
            Some(idx) => from[..idx].trim(),
            None => return None,
        };
        let name = name.trim_matches('"').trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Address from the `From` header.
    pub fn sender_address(&self) -> Option<String> {
        let from = self.from.trim();
        let address = match (from.find('<'), from.rfind('>')) {
            (Some(start), Some(end)) if end > start => &from[start + 1..end],
            _ => from,
        };
        address
            .contains('@')
            .then(|| address.trim().to_ascii_lowercase())
    }

    /// Sender's registrable-ish domain without common mail subdomains.
    pub fn sender_domain(&self) -> Option<String> {
        let address = self.sender_address()?;
        let domain = address.rsplit('@').next()?;
        let domain = ["mail.", "email.", "billing.", "notifications.", "info."]
            .iter()
            .fold(domain, |d, prefix| d.strip_prefix(prefix).unwrap_or(d));
        Some(domain.to_string())
    }

    /// Text the regex pass scans: subject, snippet and body.
    pub fn searchable_text(&self) -> String {
        format!("{}\n{}\n{}", self.subject, self.snippet, self.body_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Size reported by the mailbox, in bytes
    pub size: u64,
}

/// Attachment kinds the AI pass knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Pdf,
    Image,
}

impl AttachmentRef {
    pub fn kind(&self) -> Option<AttachmentKind> {
        let mime = self.mime_type.to_ascii_lowercase();
        let filename = self.filename.to_ascii_lowercase();

        if mime == "application/pdf" || filename.ends_with(".pdf") {
            return Some(AttachmentKind::Pdf);
        }
        if mime.starts_with("image/")
            || [".jpg", ".jpeg", ".png", ".webp", ".heic"]
                .iter()
                .any(|ext| filename.ends_with(ext))
        {
            return Some(AttachmentKind::Image);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_from(from: &str) -> MailMessage {
        MailMessage {
            id: "m".into(),
            from: from.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sender_parsing() {
        let msg = message_from("\"Acme Billing\" <Billing@mail.acme.com>");
        assert_eq!(msg.sender_name().as_deref(), Some("Acme Billing"));
        assert_eq!(msg.sender_address().as_deref(), Some("billing@mail.acme.com"));
        assert_eq!(msg.sender_domain().as_deref(), Some("acme.com"));

        let bare = message_from("receipts@stripe.com");
        assert_eq!(bare.sender_name(), None);
        assert_eq!(bare.sender_domain().as_deref(), Some("stripe.com"));
    }

    #[test]
    fn test_attachment_kind() {
        let pdf = AttachmentRef {
            attachment_id: "a".into(),
            filename: "INV-001.PDF".into(),
            mime_type: "application/octet-stream".into(),
            size: 40_000,
        };
        assert_eq!(pdf.kind(), Some(AttachmentKind::Pdf));

        let image = AttachmentRef {
            mime_type: "image/png".into(),
            filename: "receipt.png".into(),
            ..pdf.clone()
        };
        assert_eq!(image.kind(), Some(AttachmentKind::Image));

        let calendar = AttachmentRef {
            mime_type: "text/calendar".into(),
            filename: "invite.ics".into(),
            ..pdf
        };
        assert_eq!(calendar.kind(), None);
    }
}
