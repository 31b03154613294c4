//! Runtime configuration

use crate::account::DEFAULT_IMAP_HOST;
use crate::cipher::SecretCipher;
use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Sender address of the verification mails.
pub const DEFAULT_CODE_SENDER: &str = "noreply@steampowered.com";

/// How long a code request waits for its mail by default.
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Polling knobs for [`MailCodeFetcher`](crate::MailCodeFetcher).
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Only mails from this sender qualify.
    pub sender: String,
    /// Only mails delivered this recently qualify, measured from the
    /// moment of each poll.
    pub freshness: Duration,
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Upper bound for TCP connect + login.
    pub connect_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            sender: DEFAULT_CODE_SENDER.to_string(),
            freshness: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_path: PathBuf,
    pub master_key: Option<String>,
    pub default_host: String,
    pub code_timeout: Duration,
    pub fetch: FetchOptions,
}

impl Settings {
    /// Load settings from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `MAILCODE_STORE` (default: `emails.json`)
    /// - `MAILCODE_MASTER_KEY` (64 hex chars; enables sealing secrets)
    /// - `MAILCODE_SENDER` (default: `noreply@steampowered.com`)
    /// - `MAILCODE_DEFAULT_HOST` (default: `imap.gmail.com`)
    /// - `MAILCODE_CODE_TIMEOUT_SECS` (default: `60`)
    /// - `MAILCODE_POLL_INTERVAL_MS` (default: `2000`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = FetchOptions::default();
        let timeout_secs: u64 = parse_var("MAILCODE_CODE_TIMEOUT_SECS", DEFAULT_CODE_TIMEOUT.as_secs())?;
        let poll_ms: u64 = parse_var("MAILCODE_POLL_INTERVAL_MS", 2000)?;

        Ok(Self {
            store_path: env::var("MAILCODE_STORE")
                .map_or_else(|_| PathBuf::from("emails.json"), PathBuf::from),
            master_key: env::var("MAILCODE_MASTER_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            default_host: env::var("MAILCODE_DEFAULT_HOST")
                .unwrap_or_else(|_| DEFAULT_IMAP_HOST.to_string()),
            code_timeout: Duration::from_secs(timeout_secs),
            fetch: FetchOptions {
                sender: env::var("MAILCODE_SENDER").unwrap_or(defaults.sender),
                poll_interval: Duration::from_millis(poll_ms),
                ..defaults
            },
        })
    }

    /// The secret cipher, if a master key is configured.
    pub fn cipher(&self) -> Result<Option<SecretCipher>> {
        self.master_key
            .as_deref()
            .map(SecretCipher::from_hex_key)
            .transpose()
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
