//! Mailbox polling for verification codes
//!
//! [`MailCodeFetcher`] opens one IMAP session per call, examines the
//! inbox read-only and polls it until a fresh mail from the configured
//! sender yields a code, the timeout elapses, or the caller cancels.

use crate::account::MailboxCredentials;
use crate::config::FetchOptions;
use crate::connection::{self, ImapSession};
use crate::error::{Error, Result};
use crate::extract::{ExtractedCode, extract_code};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOX: &str = "INBOX";

/// Cap for timeouts too large to add to the current instant.
const MAX_WAIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Anything that can produce a verification code for a mailbox.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Wait up to `timeout` for a code to arrive in the mailbox.
    ///
    /// Returns `None` on timeout, cancellation, or any mailbox failure.
    async fn fetch_code(
        &self,
        credentials: &MailboxCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<ExtractedCode>;
}

/// IMAP-backed [`CodeSource`].
#[derive(Debug, Clone, Default)]
pub struct MailCodeFetcher {
    options: FetchOptions,
}

impl MailCodeFetcher {
    #[must_use]
    pub const fn new(options: FetchOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub const fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Poll `credentials`' inbox for a verification code.
    ///
    /// Errors never escape: a failed connect, login or command is logged
    /// and reported as `None`.
    pub async fn fetch_code(
        &self,
        credentials: &MailboxCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<ExtractedCode> {
        if !credentials.is_complete() {
            warn!("Mailbox credentials incomplete, not polling");
            return None;
        }

        match self.poll(credentials, timeout, cancel).await {
            Ok(code) => code,
            Err(e) => {
                warn!("Code fetch for {} failed: {}", credentials.address, e);
                None
            }
        }
    }

    async fn poll(
        &self,
        credentials: &MailboxCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ExtractedCode>> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or_else(|| started + MAX_WAIT);

        let connect = connection::connect(credentials, self.options.connect_timeout);
        let Some(session) = bounded(connect, deadline, cancel).await else {
            log_miss(credentials, timeout, cancel);
            return Ok(None);
        };
        let mut session = session?;

        let outcome = match bounded(self.poll_session(&mut session), deadline, cancel).await {
            Some(outcome) => {
                if tokio::time::timeout(self.options.connect_timeout, session.logout())
                    .await
                    .is_err()
                {
                    debug!("Logout from {} timed out", credentials.address);
                }
                outcome.map(Some)
            }
            None => {
                // The session may be mid-command; drop it without LOGOUT.
                debug!("Abandoning session for {}", credentials.address);
                Ok(None)
            }
        };

        match &outcome {
            Ok(Some(code)) => info!("Verification code {} found for {}", code, credentials.address),
            Ok(None) => log_miss(credentials, timeout, cancel),
            Err(_) => {}
        }
        outcome
    }

    /// Examine the inbox and scan it every poll interval until a code
    /// turns up. Runs until the caller stops awaiting it.
    async fn poll_session(&self, session: &mut ImapSession) -> Result<ExtractedCode> {
        connection::examine(session, INBOX).await?;

        loop {
            if let Some(code) = self.scan(session).await? {
                return Ok(code);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// One pass over the inbox. Returns the code of the newest fresh
    /// matching mail that carries one.
    ///
    /// Delivery dates for all matches come from a single metadata
    /// fetch; bodies are then downloaded newest first, one at a time,
    /// until one yields a code.
    async fn scan(&self, session: &mut ImapSession) -> Result<Option<ExtractedCode>> {
        let now = Utc::now();
        let query = search_query(&self.options.sender, now, self.options.freshness);

        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| Error::Connection(format!("Search failed: {e}")))?;

        if uids.is_empty() {
            debug!("No messages matching '{}'", query);
            return Ok(None);
        }
        debug!("Found {} messages matching '{}'", uids.len(), query);

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();

        let mut candidates = Vec::with_capacity(uids.len());
        for (uid, internal_date) in fetch_dates(session, &uids).await? {
            if let Some(delivered) = internal_date {
                candidates.push(Candidate {
                    uid,
                    delivered,
                    raw: None,
                });
                continue;
            }

            // No INTERNALDATE from the server: the Date header decides.
            let Some(raw) = fetch_body_or_skip(session, uid).await else {
                continue;
            };
            match mailparse::parse_mail(&raw).ok().and_then(|mail| header_date(&mail)) {
                Some(delivered) => candidates.push(Candidate {
                    uid,
                    delivered,
                    raw: Some(raw),
                }),
                None => debug!("UID {} has no usable date", uid),
            }
        }

        for candidate in rank(candidates, now, self.options.freshness) {
            let raw = match candidate.raw {
                Some(raw) => raw,
                None => match fetch_body_or_skip(session, candidate.uid).await {
                    Some(raw) => raw,
                    None => continue,
                },
            };

            let Ok(mail) = mailparse::parse_mail(&raw) else {
                debug!("UID {} is not a parseable message", candidate.uid);
                continue;
            };
            if !is_from(&mail, &self.options.sender) {
                debug!("UID {} is not from {}", candidate.uid, self.options.sender);
                continue;
            }
            if let Some(code) = extract_code(&mail) {
                return Ok(Some(code));
            }
            debug!("UID {} has no code", candidate.uid);
        }

        Ok(None)
    }
}

#[async_trait]
impl CodeSource for MailCodeFetcher {
    async fn fetch_code(
        &self,
        credentials: &MailboxCredentials,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<ExtractedCode> {
        Self::fetch_code(self, credentials, timeout, cancel).await
    }
}

fn log_miss(credentials: &MailboxCredentials, timeout: Duration, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        info!("Code fetch for {} cancelled", credentials.address);
    } else {
        warn!(
            "No verification code for {} within {:?}",
            credentials.address, timeout
        );
    }
}

/// Run `fut` unless the deadline passes or `cancel` fires first.
async fn bounded<F: Future>(fut: F, deadline: Instant, cancel: &CancellationToken) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        () = tokio::time::sleep_until(deadline) => None,
        () = cancel.cancelled() => None,
    }
}

/// A search hit with its delivery time. `raw` is set when the body was
/// already needed to date the message.
#[derive(Debug)]
struct Candidate {
    uid: u32,
    delivered: DateTime<Utc>,
    raw: Option<Vec<u8>>,
}

/// Fresh candidates, newest delivery first, then highest UID.
fn rank(mut candidates: Vec<Candidate>, now: DateTime<Utc>, freshness: Duration) -> Vec<Candidate> {
    candidates.retain(|c| {
        let fresh = is_fresh(c.delivered, now, freshness);
        if !fresh {
            debug!("UID {} delivered at {} is too old", c.uid, c.delivered);
        }
        fresh
    });
    candidates.sort_by(|a, b| b.delivered.cmp(&a.delivered).then(b.uid.cmp(&a.uid)));
    candidates
}

/// A UID with the server's INTERNALDATE, when it sent one.
type DatedUid = (u32, Option<DateTime<Utc>>);

/// `UID FETCH <set> (UID INTERNALDATE)` for every hit at once.
async fn fetch_dates(session: &mut ImapSession, uids: &[u32]) -> Result<Vec<DatedUid>> {
    let uid_set = uids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
    let mut messages = session
        .uid_fetch(&uid_set, "(UID INTERNALDATE)")
        .await
        .map_err(|e| Error::Connection(format!("Fetch failed: {e}")))?;

    let mut dates = Vec::with_capacity(uids.len());
    while let Some(item) = messages.next().await {
        let fetch = item.map_err(|e| Error::Connection(format!("Fetch error: {e}")))?;
        if let Some(uid) = fetch.uid {
            dates.push((uid, fetch.internal_date().map(|d| d.with_timezone(&Utc))));
        }
    }

    Ok(dates)
}

async fn fetch_body(session: &mut ImapSession, uid: u32) -> Result<Option<Vec<u8>>> {
    let uid_set = uid.to_string();
    let mut messages = session
        .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
        .await
        .map_err(|e| Error::Connection(format!("Fetch failed: {e}")))?;

    let mut found = None;
    while let Some(item) = messages.next().await {
        let fetch = item.map_err(|e| Error::Connection(format!("Fetch error: {e}")))?;
        if found.is_none()
            && let Some(body) = fetch.body()
        {
            found = Some(body.to_vec());
        }
    }

    Ok(found)
}

/// Body of `uid`, or `None` after logging why it is unavailable.
async fn fetch_body_or_skip(session: &mut ImapSession, uid: u32) -> Option<Vec<u8>> {
    match fetch_body(session, uid).await {
        Ok(Some(raw)) => Some(raw),
        Ok(None) => {
            debug!("No body returned for UID {}", uid);
            None
        }
        Err(e) => {
            warn!("Failed to fetch UID {}: {}", uid, e);
            None
        }
    }
}

/// Server-side filter for one poll.
///
/// `SINCE` only has day granularity and is evaluated in the server's
/// timezone, so it starts a day before the window; the exact cut is
/// applied client-side.
fn search_query(sender: &str, now: DateTime<Utc>, freshness: Duration) -> String {
    let window = TimeDelta::from_std(freshness).unwrap_or(TimeDelta::MAX);
    let since = now
        .checked_sub_signed(window)
        .and_then(|start| start.checked_sub_signed(TimeDelta::days(1)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .date_naive();
    format!("FROM \"{}\" SINCE {}", sender, since.format("%-d-%b-%Y"))
}

fn is_fresh(delivered: DateTime<Utc>, now: DateTime<Utc>, freshness: Duration) -> bool {
    TimeDelta::from_std(freshness).is_ok_and(|window| now.signed_duration_since(delivered) <= window)
}

fn is_from(mail: &ParsedMail<'_>, sender: &str) -> bool {
    let Some(header) = mail.headers.get_first_header("From") else {
        return false;
    };
    let Ok(addresses) = mailparse::addrparse_header(header) else {
        return false;
    };

    addresses.iter().any(|addr| match addr {
        MailAddr::Single(single) => single.addr.eq_ignore_ascii_case(sender),
        MailAddr::Group(group) => group.addrs.iter().any(|a| a.addr.eq_ignore_ascii_case(sender)),
    })
}

fn header_date(mail: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let value = mail.headers.get_first_value("Date")?;
    let timestamp = mailparse::dateparse(&value).ok()?;
    DateTime::from_timestamp(timestamp, 0)
}
