//! Deterministic regex pass: raw message → candidate financial document.
//!
//! A message carries a financial signal when it mentions an invoice/receipt
//! keyword and either shows a parseable amount or carries a readable
//! attachment. Everything else is skipped.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::types::document::{DocumentType, NewDocument};
use crate::types::message::{AttachmentRef, MailMessage};

lazy_static! {
    static ref KEYWORD_REGEX: Regex = Regex::new(
        r"(?i)\b(invoice|receipt|factura|recibo|order confirmation|payment (?:received|confirmation)|your bill|tax invoice|amount due|billing statement|comprobante)\b"
    ).unwrap();

    static ref INVOICE_REGEX: Regex = Regex::new(
        r"(?i)\b(invoice|factura|your bill|amount due|billing statement)\b"
    ).unwrap();

    static ref RECEIPT_REGEX: Regex = Regex::new(
        r"(?i)\b(receipt|recibo|order confirmation|payment (?:received|confirmation)|comprobante)\b"
    ).unwrap();

    // Symbol or ISO code before the number: "$1,234.56", "EUR 12,50"
    static ref PREFIX_AMOUNT_REGEX: Regex = Regex::new(
        r"(?i)(?P<cur>[$€£¥]|\b(?:usd|eur|gbp|mxn|cad|aud|jpy)\b)\s?(?P<num>\d{1,3}(?:[.,\s]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)"
    ).unwrap();

    // Number before the symbol or code: "12,50 €", "99.00 USD"
    static ref SUFFIX_AMOUNT_REGEX: Regex = Regex::new(
        r"(?i)(?P<num>\d{1,3}(?:[.,\s]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)\s?(?P<cur>[€£]|\b(?:usd|eur|gbp|mxn|cad|aud|jpy)\b)"
    ).unwrap();

    // Label that marks the amount we want
    static ref TOTAL_LABEL_REGEX: Regex = Regex::new(
        r"(?i)\b(grand total|total|amount (?:due|paid|charged)|importe|monto)\b"
    ).unwrap();
}

/// Sender names that say nothing about the vendor.
const GENERIC_SENDERS: &[&str] = &[
    "noreply",
    "no-reply",
    "no reply",
    "billing",
    "receipts",
    "invoices",
    "notifications",
    "support",
    "team",
];

/// Vendor/domain keyword → category.
const CATEGORY_HINTS: &[(&str, &str)] = &[
    ("uber eats", "food"),
    ("doordash", "food"),
    ("rappi", "food"),
    ("uber", "transport"),
    ("lyft", "transport"),
    ("aws", "software"),
    ("amazon web services", "software"),
    ("google cloud", "software"),
    ("github", "software"),
    ("digitalocean", "software"),
    ("vercel", "software"),
    ("heroku", "software"),
    ("openai", "software"),
    ("netflix", "subscriptions"),
    ("spotify", "subscriptions"),
    ("airbnb", "travel"),
    ("booking", "travel"),
    ("airlines", "travel"),
    ("expedia", "travel"),
    ("amazon", "shopping"),
    ("comcast", "utilities"),
    ("verizon", "utilities"),
    ("telmex", "utilities"),
    ("electric", "utilities"),
];

/// Candidate record produced by the regex pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub vendor: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub doc_type: DocumentType,
    pub confidence: f32,
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn into_new_document(
        self,
        account_id: Uuid,
        mailbox_id: Uuid,
        message_id: &str,
    ) -> NewDocument {
        NewDocument::builder()
            .account_id(account_id)
            .mailbox_id(mailbox_id)
            .source_message_id(message_id)
            .vendor(self.vendor)
            .amount_minor(self.amount_minor)
            .currency(self.currency)
            .category(self.category)
            .doc_type(self.doc_type)
            .confidence(self.confidence)
            .subject(self.subject)
            .issued_at(self.issued_at)
            .build()
    }
}

/// Run the regex pass. `None` means no financial signal.
pub fn extract_candidate(message: &MailMessage, config: &ScanConfig) -> Option<Candidate> {
    let text = message.searchable_text();
    if !KEYWORD_REGEX.is_match(&text) {
        return None;
    }

    let amount = find_amount(&text);
    let has_attachment = message
        .attachments
        .iter()
        .any(|a| config.is_plausible_attachment(a));
    if amount.is_none() && !has_attachment {
        return None;
    }

    let vendor = vendor_for(message);
    let category = vendor
        .as_deref()
        .and_then(category_for)
        .or_else(|| message.sender_domain().as_deref().and_then(category_for));
    let (amount_minor, currency) = match amount {
        Some((minor, currency)) => (Some(minor), Some(currency)),
        None => (None, None),
    };

    Some(Candidate {
        vendor,
        amount_minor,
        currency,
        category,
        doc_type: doc_type_for(&text),
        confidence: config.regex_confidence,
        subject: (!message.subject.trim().is_empty()).then(|| message.subject.trim().to_string()),
        issued_at: message.received_at,
    })
}

/// Whether the message should go through the AI pass.
pub fn needs_ai(message: &MailMessage, config: &ScanConfig) -> bool {
    message
        .attachments
        .iter()
        .any(|a| config.is_plausible_attachment(a))
}

/// First PDF or image attachment, regardless of size.
pub fn first_readable_attachment(message: &MailMessage) -> Option<&AttachmentRef> {
    message.attachments.iter().find(|a| a.kind().is_some())
}

/// First PDF or image attachment inside the size band. This is the one
/// [`needs_ai`] saw.
pub fn first_plausible_attachment<'a>(
    message: &'a MailMessage,
    config: &ScanConfig,
) -> Option<&'a AttachmentRef> {
    message
        .attachments
        .iter()
        .find(|a| config.is_plausible_attachment(a))
}

/// Canonical vendor spelling: trimmed, without legal suffixes or mail-role words.
pub fn normalize_vendor(raw: &str) -> String {
    let mut vendor = raw.trim().trim_matches('"').trim().to_string();
    for suffix in [
        ", inc.", " inc.", " inc", ", llc", " llc", " ltd", " ltd.", " gmbh", " s.a. de c.v.",
        " billing", " receipts", " invoices", " payments", " team",
    ] {
        if vendor.to_ascii_lowercase().ends_with(suffix) {
            vendor.truncate(vendor.len() - suffix.len());
            vendor = vendor.trim_end_matches([',', ' ']).to_string();
        }
    }
    vendor
}

fn vendor_for(message: &MailMessage) -> Option<String> {
    if let Some(name) = message.sender_name() {
        let lowered = name.to_lowercase();
        if !GENERIC_SENDERS.contains(&lowered.as_str()) {
            let vendor = normalize_vendor(&name);
            if !vendor.is_empty() {
                return Some(vendor);
            }
        }
    }

    let domain = message.sender_domain()?;
    let label = domain.split('.').next().filter(|l| !l.is_empty())?;
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

fn category_for(value: &str) -> Option<String> {
    let lowered = value.to_lowercase();
    CATEGORY_HINTS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, category)| category.to_string())
}

fn doc_type_for(text: &str) -> DocumentType {
    if INVOICE_REGEX.is_match(text) {
        DocumentType::Invoice
    } else if RECEIPT_REGEX.is_match(text) {
        DocumentType::Receipt
    } else {
        DocumentType::Unknown
    }
}

/// Amount in minor units plus ISO currency.
///
/// Prefers the first amount following a total label, then falls back to the
/// largest amount in the text.
fn find_amount(text: &str) -> Option<(i64, String)> {
    if let Some(label) = TOTAL_LABEL_REGEX.find(text) {
        let window_end = text[label.end()..]
            .char_indices()
            .nth(60)
            .map(|(idx, _)| label.end() + idx)
            .unwrap_or(text.len());
        if let Some(amount) = amounts_in(&text[label.end()..window_end]).into_iter().next() {
            return Some(amount);
        }
    }

    amounts_in(text).into_iter().max_by_key(|(minor, _)| *minor)
}

fn amounts_in(text: &str) -> Vec<(i64, String)> {
    let mut found: Vec<(usize, i64, String)> = Vec::new();
    for regex in [&*PREFIX_AMOUNT_REGEX, &*SUFFIX_AMOUNT_REGEX] {
        for caps in regex.captures_iter(text) {
            let (Some(num), Some(cur)) = (caps.name("num"), caps.name("cur")) else {
                continue;
            };
            if let Some(minor) = parse_minor_units(num.as_str()) {
                found.push((num.start(), minor, currency_code(cur.as_str())));
            }
        }
    }
    found.sort_by_key(|(start, _, _)| *start);
    found.dedup_by_key(|(start, _, _)| *start);
    found
        .into_iter()
        .map(|(_, minor, currency)| (minor, currency))
        .collect()
}

/// Parse "1,234.56" / "1.234,56" / "1 234" into minor units.
///
/// The last separator is decimal when one or two digits follow it; every
/// other separator groups thousands.
pub fn parse_minor_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let last_sep = raw.rfind(['.', ',']);
    let (whole, fraction) = match last_sep {
        Some(idx) if (1..=2).contains(&(raw.len() - idx - 1)) => (&raw[..idx], &raw[idx + 1..]),
        _ => (raw, ""),
    };

    let whole_digits: String = whole.chars().filter(char::is_ascii_digit).collect();
    if whole_digits.is_empty() {
        return None;
    }
    let units: i64 = whole_digits.parse().ok()?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };
    units.checked_mul(100)?.checked_add(cents)
}

fn currency_code(symbol: &str) -> String {
    match symbol {
        "$" => "USD".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        "¥" => "JPY".to_string(),
        code => code.to_ascii_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            id: "m-1".into(),
            from: from.into(),
            subject: subject.into(),
            body_text: body.into(),
            ..Default::default()
        }
    }

    fn pdf(size: u64) -> AttachmentRef {
        AttachmentRef {
            attachment_id: "att-1".into(),
            filename: "invoice.pdf".into(),
            mime_type: "application/pdf".into(),
            size,
        }
    }

    #[test]
    fn test_parse_minor_units() {
        assert_eq!(parse_minor_units("1,234.56"), Some(123_456));
        assert_eq!(parse_minor_units("1.234,56"), Some(123_456));
        assert_eq!(parse_minor_units("1,234"), Some(123_400));
        assert_eq!(parse_minor_units("12.5"), Some(1_250));
        assert_eq!(parse_minor_units("42"), Some(4_200));
        assert_eq!(parse_minor_units(","), None);
    }

    #[test]
    fn test_receipt_with_total() {
        let config = ScanConfig::default();
        let msg = message(
            "\"Uber Receipts\" <noreply@uber.com>",
            "Your Tuesday trip receipt",
            "Trip fare $12.00\nBooking fee $2.50\nTotal: $14.50",
        );

        let candidate = extract_candidate(&msg, &config).unwrap();
        assert_eq!(candidate.vendor.as_deref(), Some("Uber"));
        assert_eq!(candidate.amount_minor, Some(1_450));
        assert_eq!(candidate.currency.as_deref(), Some("USD"));
        assert_eq!(candidate.category.as_deref(), Some("transport"));
        assert_eq!(candidate.doc_type, DocumentType::Receipt);
        assert_eq!(candidate.confidence, config.regex_confidence);
    }

    #[test]
    fn test_european_amount_suffix_currency() {
        let msg = message(
            "facturas@mail.iberdrola.es",
            "Factura disponible",
            "Importe 1.234,56 EUR",
        );

        let candidate = extract_candidate(&msg, &ScanConfig::default()).unwrap();
        assert_eq!(candidate.amount_minor, Some(123_456));
        assert_eq!(candidate.currency.as_deref(), Some("EUR"));
        assert_eq!(candidate.vendor.as_deref(), Some("Iberdrola"));
        assert_eq!(candidate.doc_type, DocumentType::Invoice);
    }

    #[test]
    fn test_no_keyword_is_skipped() {
        let msg = message("friend@example.com", "Dinner?", "It was $40 last time");
        assert!(extract_candidate(&msg, &ScanConfig::default()).is_none());
    }

    #[test]
    fn test_keyword_without_amount_needs_attachment() {
        let config = ScanConfig::default();
        let mut msg = message("billing@acme.com", "Your invoice", "See attached.");
        assert!(extract_candidate(&msg, &config).is_none());

        msg.attachments.push(pdf(3_000));
        assert!(extract_candidate(&msg, &config).is_none());

        msg.attachments.push(pdf(48_000));
        let candidate = extract_candidate(&msg, &config).unwrap();
        assert_eq!(candidate.amount_minor, None);
        assert!(needs_ai(&msg, &config));
    }

    #[test]
    fn test_first_readable_attachment_ignores_size() {
        let mut msg = message("a@b.com", "receipt", "");
        msg.attachments.push(AttachmentRef {
            mime_type: "text/calendar".into(),
            filename: "invite.ics".into(),
            ..pdf(50_000)
        });
        msg.attachments.push(pdf(3_000));

        let picked = first_readable_attachment(&msg).unwrap();
        assert_eq!(picked.size, 3_000);
        assert!(first_plausible_attachment(&msg, &ScanConfig::default()).is_none());
        assert!(!needs_ai(&msg, &ScanConfig::default()));
    }

    #[test]
    fn test_plausible_attachment_skips_small_inline_images() {
        let config = ScanConfig::default();
        let mut msg = message("billing@acme.com", "Invoice", "");
        msg.attachments.push(AttachmentRef {
            attachment_id: "logo".into(),
            filename: "logo.png".into(),
            mime_type: "image/png".into(),
            size: 3_000,
        });
        msg.attachments.push(pdf(48_000));

        assert!(needs_ai(&msg, &config));
        assert_eq!(first_readable_attachment(&msg).unwrap().filename, "logo.png");
        assert_eq!(first_plausible_attachment(&msg, &config).unwrap().size, 48_000);
    }

    #[test]
    fn test_normalize_vendor() {
        assert_eq!(normalize_vendor("  Acme, Inc."), "Acme");
        assert_eq!(normalize_vendor("Stripe Billing"), "Stripe");
        assert_eq!(normalize_vendor("GitHub"), "GitHub");
    }
}
