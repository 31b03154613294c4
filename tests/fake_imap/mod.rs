//! Fake IMAP server for the fetcher and CLI tests
//!
//! Plaintext only. A session walks through
//! greeting, LOGIN, EXAMINE INBOX, repeated UID SEARCH / UID FETCH
//! polls and LOGOUT. Tests can push new mail into INBOX while a client
//! is polling (`FakeImapServer::deliver`) and count LOGIN attempts.
//!
//! - `server`: listener, command loop, delivery and login counter
//! - `handlers/`: one file per supported command
//! - `mailbox`: folders, messages with delivery dates, builder
//! - `io`: flushed writes

#![allow(dead_code)]

mod server;

pub use mailbox::MailboxBuilder;
pub use server::FakeImapServer;
