//! IMAP connection and TLS helpers
//!
//! Provides the low-level `connect()` and `examine()` functions used by
//! the code fetcher. A mailbox is reached either over implicit TLS
//! (the usual port 993 setup) or, when the record's security flag is
//! off, over plain TCP.

use crate::account::MailboxCredentials;
use crate::error::{Error, Result};
use async_imap::Session;
use rustls::pki_types::ServerName;
use secrecy::ExposeSecret;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

/// An authenticated IMAP session over either transport.
pub type ImapSession = Session<Compat<MailStream>>;

/// Transport under an IMAP session.
#[derive(Debug)]
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Build a TLS connector trusting the webpki root set.
fn tls_connector() -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Connection(format!("TLS setup failed: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Open a fresh authenticated IMAP session.
///
/// Connects to `host:port`, performs the TLS handshake when
/// `use_tls` is set, and logs in. The whole sequence is bounded by
/// `connect_timeout`.
pub async fn connect(creds: &MailboxCredentials, connect_timeout: Duration) -> Result<ImapSession> {
    tokio::time::timeout(connect_timeout, open_session(creds))
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "Timed out connecting to {}:{}",
                creds.host, creds.port
            ))
        })?
}

async fn open_session(creds: &MailboxCredentials) -> Result<ImapSession> {
    let addr = format!("{}:{}", creds.host, creds.port);
    debug!("Connecting to IMAP server at {}", addr);

    let tcp_stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::Connection(format!("Connect to {addr} failed: {e}")))?;

    let stream = if creds.use_tls {
        let server_name = ServerName::try_from(creds.host.clone())
            .map_err(|e| Error::Connection(format!("Invalid server name: {e}")))?;
        let tls_stream = tls_connector()?
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| Error::Connection(format!("TLS handshake failed: {e}")))?;
        MailStream::Tls(Box::new(tls_stream))
    } else {
        MailStream::Plain(tcp_stream)
    };

    let client = async_imap::Client::new(stream.compat());
    let session = client
        .login(&creds.address, creds.secret.expose_secret())
        .await
        .map_err(|(e, _)| Error::Connection(format!("Login failed: {e}")))?;

    info!("Connected to IMAP server for {}", creds.address);
    Ok(session)
}

/// EXAMINE (read-only SELECT) a folder on an existing session.
pub async fn examine(session: &mut ImapSession, folder: &str) -> Result<()> {
    session
        .examine(folder)
        .await
        .map_err(|e| Error::Connection(format!("Failed to examine {folder}: {e}")))?;
    Ok(())
}
