//! Twilio webhook payloads and request signatures.
//!
//! Twilio posts a flat form for every SMS and voice event. [`WebhookPayload::parse`]
//! turns that form into a typed record, and [`validate_request`] checks the
//! `X-Twilio-Signature` header that proves the request came from Twilio.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::RelayError;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the request signature
pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

/// Characters that Telegram MarkdownV2 requires to be escaped
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

const UNKNOWN: &str = "Unknown";

/// An inbound SMS/MMS
#[derive(Debug, Clone, PartialEq)]
pub struct SmsMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    /// One entry per declared `NumMedia`; `None` where Twilio sent no URL.
    pub media: Vec<Option<String>>,
}

/// An inbound voice call
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceCall {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    Message(SmsMessage),
    Call(VoiceCall),
}

impl WebhookPayload {
    /// Classify a webhook form by its SID field and extract the typed record.
    pub fn parse(fields: &HashMap<String, String>) -> Result<Self, RelayError> {
        let field = |key: &str, default: &str| {
            fields
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        if fields.contains_key("SmsMessageSid") {
            let num_media = fields
                .get("NumMedia")
                .and_then(|n| n.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let media = (0..num_media)
                .map(|i| fields.get(&format!("MediaUrl{}", i)).cloned())
                .collect();

            return Ok(WebhookPayload::Message(SmsMessage {
                from: field("From", UNKNOWN),
                to: field("To", UNKNOWN),
                body: field("Body", ""),
                media,
            }));
        }

        if fields.contains_key("CallSid") {
            return Ok(WebhookPayload::Call(VoiceCall {
                from: field("From", UNKNOWN),
                to: field("To", UNKNOWN),
            }));
        }

        Err(RelayError::ParseFailed(
            "neither SmsMessageSid nor CallSid present".to_string(),
        ))
    }

    pub fn from_number(&self) -> &str {
        match self {
            WebhookPayload::Message(m) => &m.from,
            WebhookPayload::Call(c) => &c.from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WebhookPayload::Message(_) => "message",
            WebhookPayload::Call(_) => "call",
        }
    }

    /// Plain-text rendering
    pub fn to_text(&self) -> String {
        self.render(|s| s.to_string(), |url| format!("<{}>", url))
    }

    /// Rendering for Telegram's MarkdownV2 parse mode
    pub fn to_markdown_v2(&self) -> String {
        self.render(escape_markdown_v2, escape_markdown_v2)
    }

    fn render(&self, field: impl Fn(&str) -> String, media_line: impl Fn(&str) -> String) -> String {
        match self {
            WebhookPayload::Message(m) => {
                let media = m
                    .media
                    .iter()
                    .flatten()
                    .map(|url| media_line(url.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "**From**: {}\n**To**: {}\n\n{}\n\n{}",
                    field(m.from.as_str()),
                    field(m.to.as_str()),
                    field(m.body.as_str()),
                    media
                )
            }
            WebhookPayload::Call(c) => {
                format!(
                    "**Call From**: {}\n**To**: {}",
                    field(c.from.as_str()),
                    field(c.to.as_str())
                )
            }
        }
    }
}

impl fmt::Display for WebhookPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Backslash-escape every MarkdownV2 special character in `text`.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compute the signature Twilio would send for this URL and form body.
///
/// The signed string is the full URL followed by every form field, sorted by
/// name, with each name and value appended directly.
pub fn compute_signature(auth_token: &str, url: &str, fields: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = fields.iter().collect();
    sorted.sort();

    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Check a request signature. An empty `auth_token` disables validation.
pub fn validate_request(
    url: &str,
    fields: &[(String, String)],
    signature: &str,
    auth_token: &str,
) -> bool {
    if auth_token.is_empty() {
        warn!("Twilio request validation skipped due to Twilio auth token missing");
        return true;
    }

    let expected = compute_signature(auth_token, url, fields);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
