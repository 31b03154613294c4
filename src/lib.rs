//! Mailbox verification codes for batch account linking
//!
//! Polls an IMAP mailbox for a short-lived 5-character verification
//! code and feeds it to a sequential batch run that logs accounts in,
//! links them and persists the result through caller-supplied
//! collaborators.
//!
//! Mailbox credentials live in a JSON store ([`JsonCredentialStore`]),
//! optionally with their secrets sealed by a [`SecretCipher`].

mod account;
pub mod batch;
mod cipher;
mod config;
mod connection;
mod error;
mod extract;
mod fetcher;
pub mod guard;
pub mod jobs;
mod store;

pub use account::{DEFAULT_IMAP_HOST, DEFAULT_IMAP_PORT, MailAccount, MailboxCredentials};
pub use batch::{BatchOrchestrator, BatchRunState, LinkedArtifact, RunHandle, RunSources};
pub use cipher::{SecretCipher, seal_optional};
pub use config::{DEFAULT_CODE_SENDER, DEFAULT_CODE_TIMEOUT, FetchOptions, Settings};
pub use error::{Error, Result};
pub use extract::{ExtractedCode, extract_code_from_raw};
pub use fetcher::{CodeSource, MailCodeFetcher};
pub use guard::{GuardProviders, GuardType};
pub use store::{CredentialRepository, JsonCredentialStore};
