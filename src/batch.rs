//! Sequential batch login/link runs
//!
//! A run loads its jobs, optionally merges a mailbox list into the
//! credential store, and then drives every job through the external
//! collaborators one at a time:
//!
//! 1. [`Authenticator::login`], which may ask the job's
//!    [`GuardProviders`] for an emailed code
//! 2. [`AccountLinker::link`]
//! 3. [`ArtifactStore::persist`]
//!
//! A failing job is logged and counted; the run moves on to the next
//! one. Cancellation is checked between jobs and also reaches any code
//! fetch that is waiting on a mailbox.

use crate::account::{DEFAULT_IMAP_HOST, MailboxCredentials};
use crate::cipher::SecretCipher;
use crate::config::DEFAULT_CODE_TIMEOUT;
use crate::error::{Error, Result};
use crate::fetcher::CodeSource;
use crate::guard::GuardProviders;
use crate::jobs::{self, Job, LiveMailboxes, LoginMailboxMapping};
use crate::store::CredentialRepository;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Opaque proxy reference chosen by a [`ProxySelector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRef {
    pub id: u32,
    pub address: String,
}

/// Result of linking one account, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedArtifact {
    pub account_name: String,
    /// Whatever the linker produced; passed through untouched.
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl LinkedArtifact {
    #[must_use]
    pub fn new(account_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            account_name: account_name.into(),
            payload,
            proxy: None,
            encrypted_password: None,
            email: None,
        }
    }
}

/// Logs a job's account in.
#[async_trait]
pub trait Authenticator: Send + Sync {
    type Session: Send;

    /// Returns `Ok(None)` when the service answered but produced no
    /// usable session.
    async fn login(
        &self,
        job: &Job,
        proxy: Option<&ProxyRef>,
        guards: &GuardProviders,
    ) -> Result<Option<Self::Session>>;
}

/// Links an authenticated session.
#[async_trait]
pub trait AccountLinker<S: Send>: Send + Sync {
    async fn link(&self, session: S, guards: &GuardProviders) -> Result<LinkedArtifact>;
}

/// Stores linked artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn persist(&self, artifact: &LinkedArtifact) -> Result<()>;
}

/// Chooses a proxy for the next job.
pub trait ProxySelector: Send + Sync {
    fn select(&self) -> Option<ProxyRef>;
}

/// Descriptor files for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSources {
    pub accounts: PathBuf,
    pub mailboxes: Option<PathBuf>,
    pub mapping: Option<PathBuf>,
}

impl RunSources {
    #[must_use]
    pub fn new(accounts: impl Into<PathBuf>) -> Self {
        Self {
            accounts: accounts.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mailboxes(mut self, path: impl Into<PathBuf>) -> Self {
        self.mailboxes = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_mapping(mut self, path: impl Into<PathBuf>) -> Self {
        self.mapping = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Progress of the current or last run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRunState {
    pub phase: RunPhase,
    pub outcome: Option<RunOutcome>,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status: String,
    pub current_login: Option<String>,
}

impl Default for BatchRunState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            outcome: None,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            status: "Ready".to_string(),
            current_login: None,
        }
    }
}

impl BatchRunState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == RunPhase::Running
    }

    fn record_job(&mut self, linked: bool) {
        self.processed += 1;
        if linked {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.status = format!("Processed {}/{}", self.processed, self.total);
    }
}

/// Shared view of a run: progress snapshot and cancellation.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    state: Arc<Mutex<BatchRunState>>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl RunHandle {
    /// Snapshot of the current or last run.
    #[must_use]
    pub fn state(&self) -> BatchRunState {
        lock(&self.state).clone()
    }

    /// Request cancellation of the active run. Returns `false` when no
    /// run is active.
    pub fn cancel(&self) -> bool {
        let Some(token) = lock(&self.cancel).clone() else {
            return false;
        };

        token.cancel();
        self.update(|state| state.status = "Cancelling...".to_string());
        info!("Batch run cancellation requested");
        true
    }

    fn update(&self, f: impl FnOnce(&mut BatchRunState)) {
        f(&mut lock(&self.state));
    }

    /// Move to Running, or fail if a run is already active.
    fn begin(&self) -> Result<CancellationToken> {
        let mut state = lock(&self.state);
        if state.is_running() {
            return Err(Error::RunInProgress);
        }

        *state = BatchRunState {
            phase: RunPhase::Running,
            status: "Starting...".to_string(),
            ..BatchRunState::default()
        };

        let token = CancellationToken::new();
        *lock(&self.cancel) = Some(token.clone());
        Ok(token)
    }

    fn finish(&self, outcome: RunOutcome) -> BatchRunState {
        *lock(&self.cancel) = None;
        let mut state = lock(&self.state);
        state.phase = RunPhase::Idle;
        state.outcome = Some(outcome);
        state.current_login = None;
        state.clone()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives batch runs against the external collaborators.
pub struct BatchOrchestrator<A, L, P>
where
    A: Authenticator,
    L: AccountLinker<A::Session>,
    P: ArtifactStore,
{
    authenticator: A,
    linker: L,
    artifacts: P,
    codes: Arc<dyn CodeSource>,
    store: Arc<Mutex<dyn CredentialRepository>>,
    proxies: Option<Box<dyn ProxySelector>>,
    cipher: Option<SecretCipher>,
    default_host: String,
    code_timeout: Duration,
    handle: RunHandle,
}

impl<A, L, P> BatchOrchestrator<A, L, P>
where
    A: Authenticator,
    L: AccountLinker<A::Session>,
    P: ArtifactStore,
{
    #[must_use]
    pub fn new(
        authenticator: A,
        linker: L,
        artifacts: P,
        codes: Arc<dyn CodeSource>,
        store: Arc<Mutex<dyn CredentialRepository>>,
    ) -> Self {
        Self {
            authenticator,
            linker,
            artifacts,
            codes,
            store,
            proxies: None,
            cipher: None,
            default_host: DEFAULT_IMAP_HOST.to_string(),
            code_timeout: DEFAULT_CODE_TIMEOUT,
            handle: RunHandle::default(),
        }
    }

    /// Seal stored mailbox secrets and artifact passwords with `cipher`.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Option<SecretCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    #[must_use]
    pub fn with_proxy_selector(mut self, proxies: impl ProxySelector + 'static) -> Self {
        self.proxies = Some(Box::new(proxies));
        self
    }

    #[must_use]
    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    #[must_use]
    pub const fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    /// A handle for observing or cancelling runs from another task.
    #[must_use]
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn state(&self) -> BatchRunState {
        self.handle.state()
    }

    pub fn cancel_run(&self) -> bool {
        self.handle.cancel()
    }

    /// Process every job in `sources` and return the final state.
    ///
    /// # Errors
    ///
    /// [`Error::RunInProgress`] when another run is active; any error
    /// loading the descriptor files, which also marks the run Failed.
    /// Per-job failures are counted, not returned.
    pub async fn start_run(&self, sources: &RunSources) -> Result<BatchRunState> {
        let cancel = self.handle.begin()?;

        match self.run(sources, &cancel).await {
            Ok(outcome) => Ok(self.handle.finish(outcome)),
            Err(e) => {
                error!("Batch run failed: {}", e);
                self.handle.update(|state| state.status = format!("Error: {e}"));
                self.handle.finish(RunOutcome::Failed);
                Err(e)
            }
        }
    }

    async fn run(&self, sources: &RunSources, cancel: &CancellationToken) -> Result<RunOutcome> {
        let jobs = jobs::load_accounts(&sources.accounts)?;
        self.handle.update(|state| state.total = jobs.len());

        let live = match &sources.mailboxes {
            Some(path) => self.import_mailboxes(path)?,
            None => LiveMailboxes::default(),
        };
        let mapping = sources
            .mapping
            .as_deref()
            .map(jobs::load_mapping)
            .transpose()?
            .unwrap_or_default();

        info!("Processing {} accounts", jobs.len());
        self.handle
            .update(|state| state.status = format!("Processing {} accounts...", jobs.len()));

        for job in &jobs {
            if cancel.is_cancelled() {
                info!("Batch run cancelled");
                self.handle.update(|state| state.status = "Cancelled".to_string());
                return Ok(RunOutcome::Cancelled);
            }

            let linked = self.process_job(job, &live, &mapping, cancel).await;
            self.handle.update(|state| state.record_job(linked));
        }

        self.handle.update(|state| {
            state.status = format!(
                "Finished. Succeeded: {}, failed: {}",
                state.succeeded, state.failed
            );
        });
        let state = self.handle.state();
        info!(
            "Batch run finished: {} succeeded, {} failed",
            state.succeeded, state.failed
        );
        Ok(RunOutcome::Completed)
    }

    fn import_mailboxes(&self, path: &Path) -> Result<LiveMailboxes> {
        let lines = jobs::load_mailboxes(path, &self.default_host)?;
        let mut store = lock(&self.store);
        jobs::import_mailboxes(&lines, &mut *store, self.cipher.as_ref())
    }

    async fn process_job(
        &self,
        job: &Job,
        live: &LiveMailboxes,
        mapping: &LoginMailboxMapping,
        cancel: &CancellationToken,
    ) -> bool {
        self.handle.update(|state| {
            state.current_login = Some(job.login.clone());
            state.status = format!("Processing account: {}", job.login);
        });

        let address = mapping.get(&job.login).map(String::as_str);
        let mailbox = address.and_then(|a| self.resolve_mailbox(a, live));
        let guards = GuardProviders::for_job(job, mailbox, self.codes.clone(), cancel.clone())
            .with_code_timeout(self.code_timeout);

        match self.link_job(job, address, &guards).await {
            Ok(()) => {
                info!("Successfully linked account {}", job.login);
                true
            }
            Err(e) => {
                error!("Account {} failed: {}", job.login, e);
                false
            }
        }
    }

    async fn link_job(&self, job: &Job, address: Option<&str>, guards: &GuardProviders) -> Result<()> {
        let proxy = self.proxies.as_ref().and_then(|p| p.select());

        let session = self
            .authenticator
            .login(job, proxy.as_ref(), guards)
            .await?
            .ok_or_else(|| Error::Login(format!("No usable session for {}", job.login)))?;

        let mut artifact = self.linker.link(session, guards).await?;

        artifact.proxy = proxy;
        if let Some(cipher) = &self.cipher {
            artifact.encrypted_password = Some(cipher.seal(job.password.expose_secret())?);
        }
        if let Some(address) = address.filter(|a| !a.trim().is_empty()) {
            artifact.email = Some(address.to_string());
        }

        self.artifacts.persist(&artifact).await
    }

    /// This run's plaintext credentials first, then the stored record.
    fn resolve_mailbox(&self, address: &str, live: &LiveMailboxes) -> Option<MailboxCredentials> {
        if let Some(credentials) = live.get(address) {
            return Some(credentials.clone());
        }

        let store = lock(&self.store);
        let account = store.get(address)?;
        match account.credentials(self.cipher.as_ref()) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!("Stored mailbox {} unusable: {}", address, e);
                None
            }
        }
    }
}

/// Where a planned job's mailbox would come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MailboxResolution {
    /// Listed in the run's mailbox file.
    RunFile,
    /// Already in the credential store.
    Store,
    /// Mapped, but the address is unknown.
    Unknown,
    /// No mapping line for this login.
    Unmapped,
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub login: String,
    pub mailbox: Option<String>,
    pub resolution: MailboxResolution,
}

/// Resolve each job's mailbox without touching the store or any
/// collaborator.
///
/// # Errors
///
/// Any error reading the descriptor files.
pub fn plan_run(
    sources: &RunSources,
    store: &dyn CredentialRepository,
    default_host: &str,
) -> Result<Vec<PlannedJob>> {
    let jobs = jobs::load_accounts(&sources.accounts)?;
    let run_mailboxes = match &sources.mailboxes {
        Some(path) => jobs::load_mailboxes(path, default_host)?,
        None => Vec::new(),
    };
    let mapping = sources
        .mapping
        .as_deref()
        .map(jobs::load_mapping)
        .transpose()?
        .unwrap_or_default();

    Ok(jobs
        .into_iter()
        .map(|job| {
            let mailbox = mapping.get(&job.login).cloned();
            let resolution = match &mailbox {
                None => MailboxResolution::Unmapped,
                Some(address) if run_mailboxes.iter().any(|m| m.address.eq_ignore_ascii_case(address)) => {
                    MailboxResolution::RunFile
                }
                Some(address) if store.get(address).is_some() => MailboxResolution::Store,
                Some(_) => MailboxResolution::Unknown,
            };
            PlannedJob {
                login: job.login,
                mailbox,
                resolution,
            }
        })
        .collect())
}
