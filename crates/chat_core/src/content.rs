//! Inline content contract for message bodies.
//!
//! Bodies may embed two reference forms that the UI renders specially without
//! the stored text ever being rewritten: `[[content:<id>]]` tokens pointing
//! at external content items, and bare URLs. Attachments ride inside the body
//! as self-describing data URIs, size-capped before any store call.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::domain::ContentKind;

use crate::error::StoreError;

pub const EVERYONE_TOKEN: &str = "@everyone";
pub const MAX_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;

const MENTION_OPEN: &str = "[[content:";
const MENTION_CLOSE: &str = "]]";
const DATA_URI_PREFIX: &str = "data:";
const DATA_URI_SEPARATOR: &str = ";base64,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    ContentRef { id: String },
    Link(String),
}

/// Splits a body into display segments. The segmentation is lossless over the
/// original text: concatenating the segments (with tokens re-rendered via
/// [`mention_token`]) reproduces the stored content byte for byte.
pub fn parse_segments(content: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(MENTION_OPEN) {
        let after_open = &rest[start + MENTION_OPEN.len()..];
        // An unterminated token is plain text, not a reference.
        let Some(close) = after_open.find(MENTION_CLOSE) else {
            break;
        };
        push_text_and_links(&rest[..start], &mut segments);
        segments.push(Segment::ContentRef {
            id: after_open[..close].to_string(),
        });
        rest = &after_open[close + MENTION_CLOSE.len()..];
    }
    push_text_and_links(rest, &mut segments);
    segments
}

pub fn mention_token(id: &str) -> String {
    format!("{MENTION_OPEN}{id}{MENTION_CLOSE}")
}

fn push_text_and_links(chunk: &str, out: &mut Vec<Segment>) {
    let mut rest = chunk;
    loop {
        let Some(pos) = find_url_start(rest) else {
            if !rest.is_empty() {
                out.push(Segment::Text(rest.to_string()));
            }
            return;
        };
        let (before, tail) = rest.split_at(pos);
        if !before.is_empty() {
            out.push(Segment::Text(before.to_string()));
        }
        let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
        let (url, after) = tail.split_at(end);
        out.push(Segment::Link(url.to_string()));
        rest = after;
    }
}

fn find_url_start(text: &str) -> Option<usize> {
    let http = text.find("http://");
    let https = text.find("https://");
    match (http, https) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// True when a group-message body addresses the local user, either by display
/// name or via the broadcast token.
pub fn mentions_user(content: &str, display_name: &str) -> bool {
    if content.contains(EVERYONE_TOKEN) {
        return true;
    }
    !display_name.is_empty() && content.contains(display_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlob {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Encodes an upload as a `data:<mime>;base64,<payload>` body. Oversize
/// payloads are refused before any store traffic happens.
pub fn encode_attachment(mime: &str, bytes: &[u8]) -> Result<String, StoreError> {
    if bytes.len() > MAX_ATTACHMENT_BYTES {
        return Err(StoreError::rejected(format!(
            "attachment of {} bytes exceeds the {MAX_ATTACHMENT_BYTES} byte limit",
            bytes.len()
        )));
    }
    Ok(format!(
        "{DATA_URI_PREFIX}{mime}{DATA_URI_SEPARATOR}{}",
        STANDARD.encode(bytes)
    ))
}

pub fn decode_attachment(content: &str) -> Option<AttachmentBlob> {
    let rest = content.strip_prefix(DATA_URI_PREFIX)?;
    let (mime, payload) = rest.split_once(DATA_URI_SEPARATOR)?;
    let bytes = STANDARD.decode(payload).ok()?;
    Some(AttachmentBlob {
        mime: mime.to_string(),
        bytes,
    })
}

pub fn kind_for_mime(mime: &str) -> ContentKind {
    if mime.starts_with("image/") {
        ContentKind::Image
    } else {
        ContentKind::File
    }
}
