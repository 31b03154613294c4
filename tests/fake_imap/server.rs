//! In-process fake IMAP server for integration testing
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client connects via TCP (plaintext)
//!       |
//!   Server sends greeting: "* OK IMAP4rev1 ready\r\n"
//!       |
//!   Client sends LOGIN with username and password
//!       |
//!   Client issues commands: EXAMINE, UID SEARCH, UID FETCH, ...
//!       |
//!   Client sends LOGOUT
//! ```
//!
//! Mailbox records created for the fake server carry `UseSsl: false`,
//! so the code fetcher talks to it over plain TCP.
//!
//! A stalling server (`start_stalling`) stops at the LOGIN step: it
//! keeps reading commands but never answers them.
//!
//! ## FETCH and literals
//!
//! Message bodies travel as counted literals: `{bytecount}\r\n`
//! followed by exactly that many raw bytes, then the closing `)`:
//!
//! ```text
//!   * 1 FETCH (UID 42 INTERNALDATE "02-Mar-2025 10:00:00 +0000" BODY[] {1234}
//!   <exactly 1234 bytes of raw RFC 2822 message>
//!   )
//! ```

use super::handlers::{
    handle_examine, handle_login, handle_logout, handle_uid_fetch, handle_uid_search,
};
use super::io::write_line;
use super::mailbox::{Mailbox, TestEmail};
use chrono::Utc;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;

/// How the server answers once a client is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Accept any credentials and serve the mailbox.
    Serve,
    /// Answer every LOGIN with NO.
    RejectLogins,
    /// Accept LOGIN, then read commands without ever answering.
    StallAfterLogin,
}

/// Counters shared between the server and its connections.
#[derive(Debug, Default)]
struct Counters {
    logins: AtomicUsize,
    body_fetches: AtomicUsize,
}

/// A fake IMAP server that runs on localhost with an OS-assigned port.
pub struct FakeImapServer {
    port: u16,
    mailbox: Arc<Mutex<Mailbox>>,
    counters: Arc<Counters>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server that accepts any credentials.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Behavior::Serve).await
    }

    /// Start a server that answers every LOGIN with NO.
    pub async fn start_rejecting_logins(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Behavior::RejectLogins).await
    }

    /// Start a server that accepts LOGIN and then never answers
    /// another command, keeping the connection open.
    pub async fn start_stalling(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Behavior::StallAfterLogin).await
    }

    async fn spawn(mailbox: Mailbox, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let mailbox = Arc::new(Mutex::new(mailbox));
        let counters = Arc::new(Counters::default());

        let shared = mailbox.clone();
        let shared_counters = counters.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let mailbox = shared.clone();
                let counters = shared_counters.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &mailbox, behavior, &counters).await;
                });
            }
        });

        Self {
            port,
            mailbox,
            counters,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Number of LOGIN commands received so far.
    pub fn login_count(&self) -> usize {
        self.counters.logins.load(Ordering::SeqCst)
    }

    /// Number of message bodies sent in UID FETCH responses so far.
    pub fn body_fetch_count(&self) -> usize {
        self.counters.body_fetches.load(Ordering::SeqCst)
    }

    /// Deliver a message to INBOX right now.
    pub fn deliver(&self, uid: u32, raw: &[u8]) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox
            .get_folder_mut("INBOX")
            .expect("mailbox has an INBOX")
            .emails
            .push(TestEmail {
                uid,
                internal_date: Utc::now(),
                raw: raw.to_vec(),
            });
    }
}

/// Handle a single IMAP client connection.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    mailbox: &Mutex<Mailbox>,
    behavior: Behavior,
    counters: &Counters,
) {
    let mut reader = BufReader::new(stream);

    // RFC 3501 Section 7.1.1: Server greeting
    if write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    handle_imap_session(reader, mailbox, behavior, counters).await;
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the IMAP command loop over an established stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each client command
/// into a strongly-typed `Command`, then dispatches to the
/// appropriate handler based on the `CommandBody` variant. Each
/// command sees a fresh snapshot of the mailbox, so mail delivered
/// between polls becomes visible.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    mailbox: &Mutex<Mailbox>,
    behavior: Behavior,
    counters: &Counters,
) {
    let mut stalled = false;
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || stalled {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Login { .. } => {
                counters.logins.fetch_add(1, Ordering::SeqCst);
                let accept = behavior != Behavior::RejectLogins;
                if !handle_login(tag, accept, &mut reader).await {
                    break;
                }
                stalled = behavior == Behavior::StallAfterLogin;
            }
            CommandBody::Examine { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_examine(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: true,
                ..
            } => {
                handle_uid_search(
                    tag,
                    criteria.as_ref(),
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Fetch {
                sequence_set,
                macro_or_item_names,
                uid: true,
                ..
            } => {
                let bodies = handle_uid_fetch(
                    tag,
                    &sequence_set,
                    &macro_or_item_names,
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
                counters.body_fetches.fetch_add(bodies, Ordering::SeqCst);
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
