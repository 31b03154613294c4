//! Guard strategies handed to the authenticator for one job
//!
//! Each batch job gets its own [`GuardProviders`], built with that job's
//! login and resolved mailbox. Only emailed codes are answered
//! automatically; every other guard kind is declined.

use crate::account::MailboxCredentials;
use crate::config::DEFAULT_CODE_TIMEOUT;
use crate::error::{Error, Result};
use crate::extract::ExtractedCode;
use crate::fetcher::CodeSource;
use crate::jobs::Job;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Second-factor challenge kinds a login may raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardType {
    None,
    EmailCode,
    DeviceCode,
    DeviceConfirmation,
    EmailConfirmation,
    MachineToken,
}

impl fmt::Display for GuardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::EmailCode => "email code",
            Self::DeviceCode => "device code",
            Self::DeviceConfirmation => "device confirmation",
            Self::EmailConfirmation => "email confirmation",
            Self::MachineToken => "machine token",
        };
        f.write_str(name)
    }
}

/// Answers email-code challenges by polling the job's mailbox.
#[derive(Clone)]
pub struct EmailCodeProvider {
    source: Arc<dyn CodeSource>,
    login: String,
    mailbox: Option<MailboxCredentials>,
    run_cancel: CancellationToken,
    timeout: Duration,
}

impl fmt::Debug for EmailCodeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailCodeProvider")
            .field("login", &self.login)
            .field("mailbox", &self.mailbox.as_ref().map(|m| &m.address))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EmailCodeProvider {
    #[must_use]
    pub fn new(
        source: Arc<dyn CodeSource>,
        login: impl Into<String>,
        mailbox: Option<MailboxCredentials>,
        run_cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            login: login.into(),
            mailbox,
            run_cancel,
            timeout: DEFAULT_CODE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn login(&self) -> &str {
        &self.login
    }

    #[must_use]
    pub const fn mailbox(&self) -> Option<&MailboxCredentials> {
        self.mailbox.as_ref()
    }

    /// Fetch the code for this job with the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::fetch_with_timeout`].
    pub async fn fetch_for_current_job(&self, cancel: &CancellationToken) -> Result<ExtractedCode> {
        self.fetch_with_timeout(self.timeout, cancel).await
    }

    /// Fetch the code for this job, waiting at most `timeout`.
    ///
    /// Stops early when either `cancel` or the run's token fires.
    ///
    /// # Errors
    ///
    /// [`Error::MissingMapping`] when the job has no usable mailbox,
    /// [`Error::NotFound`] when no code arrived.
    pub async fn fetch_with_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExtractedCode> {
        let Some(mailbox) = &self.mailbox else {
            warn!("No mailbox mapped for {}", self.login);
            return Err(Error::MissingMapping(self.login.clone()));
        };

        info!("Waiting for email code for {} via {}", self.login, mailbox.address);

        let combined = self.run_cancel.child_token();
        let fetch = self.source.fetch_code(mailbox, timeout, &combined);
        tokio::pin!(fetch);

        let code = tokio::select! {
            code = &mut fetch => code,
            () = cancel.cancelled() => {
                combined.cancel();
                fetch.await
            }
        };

        code.ok_or_else(|| Error::NotFound(format!("{} ({})", self.login, mailbox.address)))
    }
}

/// Phone numbers are never supplied in batch mode.
#[derive(Debug, Clone)]
pub struct PhoneNumberProvider {
    login: String,
}

impl PhoneNumberProvider {
    #[must_use]
    pub fn phone_number(&self) -> Option<String> {
        debug!("No phone number available for {}", self.login);
        None
    }
}

/// SMS codes cannot be answered in batch mode.
#[derive(Debug, Clone)]
pub struct SmsCodeProvider {
    login: String,
}

impl SmsCodeProvider {
    /// # Errors
    ///
    /// Always [`Error::UnsupportedGuard`].
    pub fn sms_code(&self) -> Result<ExtractedCode> {
        warn!("SMS code requested for {}", self.login);
        Err(Error::UnsupportedGuard(format!("SMS code for {}", self.login)))
    }
}

/// Email confirmations need no answer.
#[derive(Debug, Clone)]
pub struct EmailConfirmationProvider {
    login: String,
}

impl EmailConfirmationProvider {
    /// # Errors
    ///
    /// Never fails.
    #[allow(clippy::unnecessary_wraps)]
    pub fn confirm(&self) -> Result<()> {
        debug!("Email confirmation for {} needs no action", self.login);
        Ok(())
    }
}

/// The full set of guard strategies for one job.
#[derive(Debug, Clone)]
pub struct GuardProviders {
    pub email_code: EmailCodeProvider,
    pub phone_number: PhoneNumberProvider,
    pub sms_code: SmsCodeProvider,
    pub email_confirmation: EmailConfirmationProvider,
}

impl GuardProviders {
    /// Build the providers for `job`, answering email codes from
    /// `mailbox` through `source`.
    #[must_use]
    pub fn for_job(
        job: &Job,
        mailbox: Option<MailboxCredentials>,
        source: Arc<dyn CodeSource>,
        run_cancel: CancellationToken,
    ) -> Self {
        let login = job.login.clone();
        Self {
            email_code: EmailCodeProvider::new(source, login.clone(), mailbox, run_cancel),
            phone_number: PhoneNumberProvider {
                login: login.clone(),
            },
            sms_code: SmsCodeProvider {
                login: login.clone(),
            },
            email_confirmation: EmailConfirmationProvider { login },
        }
    }

    #[must_use]
    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.email_code = self.email_code.with_timeout(timeout);
        self
    }

    #[must_use]
    pub fn login(&self) -> &str {
        self.email_code.login()
    }

    /// Whether this set can answer `guard` without a human.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub const fn supports_guard_type(&self, guard: GuardType) -> bool {
        matches!(guard, GuardType::EmailCode)
    }
}
