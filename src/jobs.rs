//! Batch descriptor parsing
//!
//! Three line-oriented formats feed a batch run:
//!
//! - accounts: `login:password`
//! - mailboxes: `address:secret[:host[:port]]`
//! - mapping: `login:address`
//!
//! Blank lines and lines starting with `#` are skipped. Lines that do
//! not have the expected shape are dropped without an error.

use crate::account::{DEFAULT_IMAP_PORT, MailAccount, MailboxCredentials};
use crate::cipher::{SecretCipher, seal_optional};
use crate::error::Result;
use crate::store::CredentialRepository;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const COMMENT_MARKER: char = '#';

/// One account to process in a batch run.
#[derive(Debug, Clone)]
pub struct Job {
    pub login: String,
    pub password: SecretString,
}

/// One parsed mailbox descriptor line, secret still in clear.
#[derive(Debug, Clone)]
pub struct MailboxLine {
    pub address: String,
    pub secret: SecretString,
    pub host: String,
    pub port: u16,
}

impl MailboxLine {
    /// The record to persist, with the secret sealed when a cipher is
    /// configured.
    pub fn to_stored(&self, cipher: Option<&SecretCipher>) -> Result<MailAccount> {
        Ok(MailAccount {
            address: self.address.clone(),
            secret: seal_optional(cipher, self.secret.expose_secret())?,
            host: self.host.clone(),
            port: self.port,
            use_tls: true,
            display_label: None,
        })
    }

    /// The in-memory copy used to talk to the mailbox during this run.
    #[must_use]
    pub fn to_live(&self) -> MailboxCredentials {
        MailboxCredentials {
            address: self.address.clone(),
            secret: self.secret.clone(),
            host: self.host.clone(),
            port: self.port,
            use_tls: true,
        }
    }
}

/// Login → mailbox address, last occurrence wins.
pub type LoginMailboxMapping = HashMap<String, String>;

/// Plaintext credentials for the mailboxes imported in this run, keyed
/// by lowercased address.
#[derive(Debug, Clone, Default)]
pub struct LiveMailboxes {
    by_address: HashMap<String, MailboxCredentials>,
}

impl LiveMailboxes {
    pub fn insert(&mut self, credentials: MailboxCredentials) {
        self.by_address
            .insert(credentials.address.to_ascii_lowercase(), credentials);
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<&MailboxCredentials> {
        self.by_address.get(&address.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
}

/// Parse `login:password` lines, splitting on the first colon only.
#[must_use]
pub fn parse_accounts(text: &str) -> Vec<Job> {
    content_lines(text)
        .filter_map(|line| {
            let (login, password) = line.split_once(':')?;
            let login = login.trim();
            if login.is_empty() {
                return None;
            }
            Some(Job {
                login: login.to_string(),
                password: SecretString::from(password.trim().to_string()),
            })
        })
        .collect()
}

/// Parse `address:secret[:host[:port]]` lines.
///
/// A missing or blank host becomes `default_host`; a missing or
/// non-numeric port becomes 993.
#[must_use]
pub fn parse_mailboxes(text: &str, default_host: &str) -> Vec<MailboxLine> {
    content_lines(text)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').map(str::trim).collect();
            if parts.len() < 2 {
                return None;
            }

            let host = parts
                .get(2)
                .filter(|h| !h.is_empty())
                .map_or_else(|| default_host.to_string(), ToString::to_string);
            let port = parts
                .get(3)
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_IMAP_PORT);

            Some(MailboxLine {
                address: parts[0].to_string(),
                secret: SecretString::from(parts[1].to_string()),
                host,
                port,
            })
        })
        .collect()
}

/// Parse `login:address` lines using the first two colon fields.
#[must_use]
pub fn parse_mapping(text: &str) -> LoginMailboxMapping {
    let mut mapping = LoginMailboxMapping::new();
    for line in content_lines(text) {
        let mut fields = line.split(':').map(str::trim);
        if let (Some(login), Some(address)) = (fields.next(), fields.next())
            && !login.is_empty()
            && !address.is_empty()
        {
            mapping.insert(login.to_string(), address.to_string());
        }
    }
    mapping
}

/// Merge parsed mailbox lines into `store` and return the plaintext
/// copies for this run.
///
/// New addresses are added; known ones are updated in place.
pub fn import_mailboxes(
    lines: &[MailboxLine],
    store: &mut dyn CredentialRepository,
    cipher: Option<&SecretCipher>,
) -> Result<LiveMailboxes> {
    let mut live = LiveMailboxes::default();

    for line in lines {
        let stored = line.to_stored(cipher)?;
        if store.get(&stored.address).is_some() {
            store.update(stored)?;
        } else {
            store.add(stored)?;
        }
        live.insert(line.to_live());
    }

    info!("Imported {} mailboxes", live.len());
    Ok(live)
}

/// Read and parse an accounts file.
pub fn load_accounts(path: &Path) -> Result<Vec<Job>> {
    let jobs = parse_accounts(&fs::read_to_string(path)?);
    debug!("Read {} accounts from {}", jobs.len(), path.display());
    Ok(jobs)
}

/// Read and parse a mailboxes file.
pub fn load_mailboxes(path: &Path, default_host: &str) -> Result<Vec<MailboxLine>> {
    let lines = parse_mailboxes(&fs::read_to_string(path)?, default_host);
    debug!("Read {} mailboxes from {}", lines.len(), path.display());
    Ok(lines)
}

/// Read and parse a mapping file.
pub fn load_mapping(path: &Path) -> Result<LoginMailboxMapping> {
    let mapping = parse_mapping(&fs::read_to_string(path)?);
    debug!("Read {} login mappings from {}", mapping.len(), path.display());
    Ok(mapping)
}
