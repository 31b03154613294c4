//! Durable mailbox credential store
//!
//! [`CredentialRepository`] is the plain repository contract. The
//! bundled implementation, [`JsonCredentialStore`], keeps the records
//! in memory and rewrites the whole JSON file on every mutation.
//! Change notification for any UI sits on top of this and is not the
//! store's concern.

use crate::account::MailAccount;
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Repository of mailbox records keyed by case-insensitive address.
pub trait CredentialRepository: Send {
    /// All records in insertion order.
    fn accounts(&self) -> &[MailAccount];

    /// Rewrite the persisted store from memory.
    fn save(&self) -> Result<()>;

    /// Append a record. Fails with [`Error::DuplicateIdentity`] when the
    /// address is already present.
    fn add(&mut self, account: MailAccount) -> Result<()>;

    /// Replace the record with the same address. Returns `false` and
    /// changes nothing when no such record exists.
    fn update(&mut self, account: MailAccount) -> Result<bool>;

    /// Delete the record with `address`, returning it if present.
    fn remove(&mut self, address: &str) -> Result<Option<MailAccount>>;

    /// Case-insensitive lookup.
    fn get(&self, address: &str) -> Option<&MailAccount>;
}

/// JSON-file backed credential store.
#[derive(Debug)]
pub struct JsonCredentialStore {
    path: PathBuf,
    accounts: Vec<MailAccount>,
}

impl JsonCredentialStore {
    /// Load the store at `path`.
    ///
    /// A missing file is created empty. An unreadable or malformed file
    /// is logged and replaced in memory by an empty store; the file on
    /// disk is left alone until the next mutation.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        if !path.exists() {
            let store = Self {
                path,
                accounts: Vec::new(),
            };
            if let Err(e) = store.save() {
                error!("Failed to create credential store {}: {}", store.path.display(), e);
            }
            return store;
        }

        let accounts = match read_accounts(&path) {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to load credential store {}: {}", path.display(), e);
                Vec::new()
            }
        };

        debug!("Loaded {} mailbox records from {}", accounts.len(), path.display());
        Self { path, accounts }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(&self, address: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.is_identified_by(address))
    }
}

impl CredentialRepository for JsonCredentialStore {
    fn accounts(&self) -> &[MailAccount] {
        &self.accounts
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.accounts)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        debug!("Saved {} mailbox records to {}", self.accounts.len(), self.path.display());
        Ok(())
    }

    fn add(&mut self, account: MailAccount) -> Result<()> {
        if self.position(&account.address).is_some() {
            return Err(Error::DuplicateIdentity(account.address));
        }

        info!("Adding mailbox {}", account.address);
        self.accounts.push(account);
        self.save()
    }

    fn update(&mut self, account: MailAccount) -> Result<bool> {
        let Some(index) = self.position(&account.address) else {
            debug!("Update ignored, mailbox {} is not in the store", account.address);
            return Ok(false);
        };

        self.accounts[index] = account;
        self.save()?;
        Ok(true)
    }

    fn remove(&mut self, address: &str) -> Result<Option<MailAccount>> {
        let removed = self.position(address).map(|index| self.accounts.remove(index));
        if removed.is_some() {
            info!("Removed mailbox {}", address);
        }
        self.save()?;
        Ok(removed)
    }

    fn get(&self, address: &str) -> Option<&MailAccount> {
        self.accounts.iter().find(|a| a.is_identified_by(address))
    }
}

fn read_accounts(path: &Path) -> Result<Vec<MailAccount>> {
    let json = fs::read_to_string(path)?;
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&json)?)
}
