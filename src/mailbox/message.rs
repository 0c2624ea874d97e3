//! Message envelope types and header/body helpers shared by both backends.

use chrono::{DateTime, Utc};

/// A raw inbound message as fetched from a mailbox backend.
///
/// `body` is the best-effort plain text (text part preferred, stripped HTML
/// as fallback); `html_body` keeps the original HTML part when present.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Provider-assigned message identifier (Message-ID or API message id).
    pub external_id: String,
    /// Subject line, `(no subject)` when absent.
    pub subject: String,
    /// Sender address, lowercased.
    pub sender_email: String,
    /// Display name from the `From` header, when one was given.
    pub sender_name: Option<String>,
    /// Plain-text body.
    pub body: String,
    /// Original HTML part, when the message carried one.
    pub html_body: Option<String>,
    /// When the message was received (header date, or fetch time).
    pub received_at: DateTime<Utc>,
    /// Provider threading hint, when available.
    pub thread_id: Option<String>,
}

impl RawMessage {
    /// Name to attribute this sender by: display name if present, else address.
    pub fn display_name(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender_email)
    }
}

/// An outbound message handed to a mailbox backend for sending.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message id this is a reply to, for threading.
    pub in_reply_to: Option<String>,
}

/// Split a `From` header value into (address, optional display name).
///
/// Handles `Jane Doe <jane@example.com>`, `"Doe, Jane" <jane@example.com>`,
/// `<jane@example.com>` and bare `jane@example.com` forms. The address is
/// lowercased; the display name keeps its casing.
pub fn parse_address(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>'))
        && open < close
    {
        let email = raw[open + 1..close].trim().to_lowercase();
        let name = raw[..open].trim().trim_matches('"').trim();
        let name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        return (email, name);
    }
    (raw.trim_matches('"').trim().to_lowercase(), None)
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip quoted text from a reply body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - Everything from an "On ... wrote:" attribution line onward
/// - Everything from a "--- Original Message ---" separator onward
///
/// Pure string parsing; run before content hashing and comment storage so a
/// reply that merely quotes an earlier message hashes equal to it.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();
    let mut skip_rest = false;

    for line in body.lines() {
        if skip_rest {
            break;
        }

        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            skip_rest = true;
            continue;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            skip_rest = true;
            continue;
        }

        result.push(line);
    }

    // Trim trailing blank lines
    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_address tests ─────────────────────────────────────────

    #[test]
    fn address_with_display_name() {
        let (email, name) = parse_address("Jane Doe <Jane@Example.com>");
        assert_eq!(email, "jane@example.com");
        assert_eq!(name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn address_with_quoted_name() {
        let (email, name) = parse_address(r#""Doe, Jane" <jane@example.com>"#);
        assert_eq!(email, "jane@example.com");
        assert_eq!(name.as_deref(), Some("Doe, Jane"));
    }

    #[test]
    fn address_bare() {
        let (email, name) = parse_address("jane@example.com");
        assert_eq!(email, "jane@example.com");
        assert!(name.is_none());
    }

    #[test]
    fn address_angle_only() {
        let (email, name) = parse_address("<jane@example.com>");
        assert_eq!(email, "jane@example.com");
        assert!(name.is_none());
    }

    #[test]
    fn display_name_falls_back_to_address() {
        let msg = RawMessage {
            external_id: "m1".into(),
            subject: "Hi".into(),
            sender_email: "jane@example.com".into(),
            sender_name: None,
            body: "hello".into(),
            html_body: None,
            received_at: Utc::now(),
            thread_id: None,
        };
        assert_eq!(msg.display_name(), "jane@example.com");

        let named = RawMessage {
            sender_name: Some("Jane Doe".into()),
            ..msg
        };
        assert_eq!(named.display_name(), "Jane Doe");
    }

    // ── strip_html tests ────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_with_attributes() {
        assert_eq!(
            strip_html(r#"<a href="https://example.com">Link</a>"#),
            "Link"
        );
    }

    #[test]
    fn strip_html_whitespace_normalized() {
        assert_eq!(strip_html("<p>  Hello   World  </p>"), "Hello World");
    }

    #[test]
    fn strip_html_plain_text_passthrough() {
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }

    // ── strip_quoted_text tests ─────────────────────────────────────

    #[test]
    fn strip_basic_quoted_lines() {
        let body = "Hello!\n\n> This is quoted\n> Another quoted line\nThanks";
        assert_eq!(strip_quoted_text(body), "Hello!\n\nThanks");
    }

    #[test]
    fn strip_on_wrote_attribution() {
        let body =
            "Sounds good!\n\nOn Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:\n> Original";
        assert_eq!(strip_quoted_text(body), "Sounds good!");
    }

    #[test]
    fn strip_original_message_separator() {
        let body = "My reply\n\n--- Original Message ---\nOld stuff here";
        assert_eq!(strip_quoted_text(body), "My reply");
    }

    #[test]
    fn strip_no_quotes_passthrough() {
        let body = "Just a normal message\nWith multiple lines";
        assert_eq!(strip_quoted_text(body), body);
    }

    #[test]
    fn strip_trailing_blank_lines() {
        let body = "Hello\n\n> quoted\n\n\n";
        assert_eq!(strip_quoted_text(body), "Hello");
    }
}
