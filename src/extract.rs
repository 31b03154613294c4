//! Verification code extraction from raw RFC 2822 messages

use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

/// Number of characters in a verification code.
pub const CODE_LEN: usize = 5;

static CODE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?-u:\b)([A-Za-z0-9]{5})(?-u:\b)").ok());

static HTML_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]+>").ok());

/// A 5-character verification code, uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractedCode(String);

impl ExtractedCode {
    /// Normalize `raw` into a code. Returns `None` unless it is exactly
    /// five ASCII letters or digits.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        (raw.len() == CODE_LEN && raw.chars().all(|c| c.is_ascii_alphanumeric()))
            .then(|| Self(raw.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ExtractedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First code-shaped token in `text`.
#[must_use]
pub fn find_code(text: &str) -> Option<ExtractedCode> {
    let pattern = CODE_PATTERN.as_ref()?;
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| ExtractedCode::parse(m.as_str()))
}

/// Replace every HTML tag with a space.
#[must_use]
pub fn strip_tags(html: &str) -> String {
    HTML_TAG
        .as_ref()
        .map_or_else(|| html.to_string(), |re| re.replace_all(html, " ").into_owned())
}

/// Extract a code from a parsed message.
///
/// Looks at the subject first, then the plain-text body, then the HTML
/// body with its tags removed.
#[must_use]
pub fn extract_code(mail: &ParsedMail<'_>) -> Option<ExtractedCode> {
    if let Some(code) = mail
        .headers
        .get_first_value("Subject")
        .and_then(|subject| find_code(&subject))
    {
        debug!("Code found in subject");
        return Some(code);
    }

    if let Some(code) = body_of(mail, "text/plain").and_then(|text| find_code(&text)) {
        debug!("Code found in text body");
        return Some(code);
    }

    body_of(mail, "text/html").and_then(|html| find_code(&strip_tags(&html)))
}

/// Parse raw message bytes and extract a code.
#[must_use]
pub fn extract_code_from_raw(raw: &[u8]) -> Option<ExtractedCode> {
    match mailparse::parse_mail(raw) {
        Ok(mail) => extract_code(&mail),
        Err(e) => {
            debug!("Skipping unparseable message: {}", e);
            None
        }
    }
}

/// Decoded body of the first part with the given MIME type, skipping
/// attachments.
fn body_of(mail: &ParsedMail<'_>, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        let is_attachment = mail
            .get_content_disposition()
            .disposition
            .eq(&mailparse::DispositionType::Attachment);
        if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) && !is_attachment {
            return mail.get_body().ok().filter(|body| !body.trim().is_empty());
        }
        return None;
    }

    mail.subparts.iter().find_map(|part| body_of(part, mimetype))
}
