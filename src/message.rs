//! Outbound message model.
//!
//! Full MIME encoding is out of scope for this crate; messages carry an
//! ordered header list and a plain-text body, rendered as RFC 5322-style
//! `Name: value` lines, a blank line, and the body. Digest containers
//! bundle already-built entry messages as attachment sub-parts under one
//! multipart body. Delivery backends consume the rendered bytes as-is.

use uuid::Uuid;

/// Domain used for generated Message-ID values. Deliberately
/// non-resolvable so generated ids can never collide with real mail.
const MESSAGE_ID_DOMAIN: &str = "feedmail.invalid";

/// A single outbound email message.
///
/// Headers keep insertion order so rendered output is stable and
/// predictable in tests.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Vec<(String, String)>,
    body: String,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, or replace the value if the name already exists.
    /// Header names compare case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (existing, v) in &mut self.headers {
            if existing.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    /// First value for a header name, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render to wire bytes: headers in insertion order, CRLF line
    /// endings, blank line, body.
    pub fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            // Fold embedded newlines out of header values; a stray \n
            // in a feed title must not inject headers.
            out.push_str(&value.replace(['\r', '\n'], " "));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        if !self.body.ends_with('\n') {
            out.push_str("\r\n");
        }
        out.into_bytes()
    }
}

/// Fresh unique Message-ID, stamped on every message before send.
pub fn new_message_id() -> String {
    format!("<{}@{}>", Uuid::new_v4(), MESSAGE_ID_DOMAIN)
}

/// Bundle entry messages into a single digest container.
///
/// The container keeps whatever headers the caller already set (To,
/// From, Subject, Message-ID, ...) and gains a multipart body with one
/// attachment sub-part per entry message. Its `Date` is copied from the
/// last sub-part: entries are processed oldest to newest, so the last
/// one is the most recent.
pub fn build_digest(mut container: Message, parts: &[Message]) -> Message {
    debug_assert!(!parts.is_empty(), "digest built from an empty batch");
    if let Some(date) = parts.last().and_then(|m| m.header("Date")) {
        let date = date.to_string();
        container.set_header("Date", date);
    }
    let boundary = format!("=_feedmail-{}", Uuid::new_v4().simple());
    container.set_header(
        "Content-Type",
        format!("multipart/digest; boundary=\"{boundary}\""),
    );

    let mut body = String::new();
    for part in parts {
        body.push_str(&format!("--{boundary}\r\n"));
        body.push_str("Content-Type: message/rfc822\r\n");
        body.push_str("Content-Disposition: attachment\r\n");
        body.push_str("\r\n");
        body.push_str(&String::from_utf8_lossy(&part.render()));
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    container.set_body(body);
    container
}
