//! Mailbox credential records
//!
//! Two representations of the same mailbox exist on purpose:
//!
//! - [`MailAccount`] is the at-rest record kept in the credential
//!   store. Its secret may be sealed and it is serializable.
//! - [`MailboxCredentials`] is the live copy used to open an IMAP
//!   session. Its secret is held in clear inside a [`SecretString`] and
//!   the type has no serialization support, so it cannot end up in the
//!   store file by accident.

use crate::cipher::{SecretCipher, open_optional};
use crate::error::Result;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Default IMAP server used when a descriptor or record omits the host.
pub const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";

/// Default implicit-TLS IMAP port.
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// A mailbox record as persisted in the credential store.
///
/// Field names on disk follow the existing `emails.json` layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailAccount {
    /// Mailbox address, the case-insensitive identity of the record.
    #[serde(rename = "Email")]
    pub address: String,
    /// Secret as stored: plain text, or sealed by [`SecretCipher`].
    #[serde(rename = "Password")]
    pub secret: String,
    #[serde(rename = "ImapServer")]
    pub host: String,
    #[serde(rename = "ImapPort")]
    pub port: u16,
    #[serde(rename = "UseSsl")]
    pub use_tls: bool,
    #[serde(rename = "DisplayName")]
    pub display_label: Option<String>,
}

impl Default for MailAccount {
    fn default() -> Self {
        Self {
            address: String::new(),
            secret: String::new(),
            host: DEFAULT_IMAP_HOST.to_string(),
            port: DEFAULT_IMAP_PORT,
            use_tls: true,
            display_label: None,
        }
    }
}

impl MailAccount {
    #[must_use]
    pub fn new(address: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Whether this record is identified by `address` (ASCII
    /// case-insensitive).
    #[must_use]
    pub fn is_identified_by(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }

    /// The display label when set and non-blank, else the address.
    #[must_use]
    pub fn display_name_or_address(&self) -> &str {
        self.display_label
            .as_deref()
            .filter(|label| !label.trim().is_empty())
            .unwrap_or(&self.address)
    }

    /// Build live credentials from this record, opening a sealed secret
    /// with `cipher`.
    pub fn credentials(&self, cipher: Option<&SecretCipher>) -> Result<MailboxCredentials> {
        let secret = open_optional(cipher, &self.secret)?;
        Ok(MailboxCredentials {
            address: self.address.clone(),
            secret: SecretString::from(secret),
            host: self.host.clone(),
            port: self.port,
            use_tls: self.use_tls,
        })
    }
}

/// Live mailbox credentials with the secret in clear.
#[derive(Debug, Clone)]
pub struct MailboxCredentials {
    pub address: String,
    pub secret: SecretString,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MailboxCredentials {
    #[must_use]
    pub fn new(address: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secret: SecretString::from(secret.into()),
            host: DEFAULT_IMAP_HOST.to_string(),
            port: DEFAULT_IMAP_PORT,
            use_tls: true,
        }
    }

    #[must_use]
    pub fn with_server(mut self, host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        self.host = host.into();
        self.port = port;
        self.use_tls = use_tls;
        self
    }

    /// Both the address and the secret are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.address.trim().is_empty() && !self.secret.expose_secret().trim().is_empty()
    }
}
