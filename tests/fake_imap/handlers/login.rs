//! LOGIN command handler.
//!
//! The fake server does not check credentials. It either accepts every
//! LOGIN or, for tests that exercise authentication failures, rejects
//! every LOGIN with a tagged NO and closes the connection.

use crate::fake_imap::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the LOGIN command. Returns `false` when the connection
/// should be closed.
pub async fn handle_login<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    accept: bool,
    stream: &mut BufReader<S>,
) -> bool {
    if accept {
        let resp = format!("{tag} OK LOGIN completed\r\n");
        return write_line(stream, &resp).await.is_ok();
    }

    let resp = format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n");
    let _ = write_line(stream, &resp).await;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn run(tag: &str, accept: bool) -> (String, bool) {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        let keep_open = handle_login(tag, accept, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        (String::from_utf8(buf).unwrap(), keep_open)
    }

    #[tokio::test]
    async fn accepts_with_ok() {
        let (output, keep_open) = run("A0001", true).await;
        assert!(keep_open);
        assert_eq!(output, "A0001 OK LOGIN completed\r\n");
    }

    #[tokio::test]
    async fn rejects_with_no_and_closes() {
        let (output, keep_open) = run("A0001", false).await;
        assert!(!keep_open);
        assert!(output.starts_with("A0001 NO "));
    }
}
