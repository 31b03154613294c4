//! UID FETCH command handler.
//!
//! Every requested UID gets its UID and internal date. The full body is
//! added only when the client asked for one (`BODY[]`, `BODY.PEEK[]`
//! or `RFC822`):
//!
//! ```text
//! * <seq> FETCH (UID <uid> INTERNALDATE "<date>")
//! * <seq> FETCH (UID <uid> INTERNALDATE "<date>" BODY[] {<length>}
//! <exactly length bytes of raw RFC 2822 message>
//! )
//! ```
//!
//! The sequence number is the 1-based index of the message within the
//! folder, per RFC 3501 Section 7.4.2.

use crate::fake_imap::io::{write_bytes, write_line};
use crate::fake_imap::mailbox::Mailbox;
use imap_codec::imap_types::fetch::{MacroOrMessageDataItemNames, MessageDataItemName};
use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// RFC 3501 `date-time` layout.
const INTERNALDATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// Extract UIDs from a `SequenceSet`. Only single values and
/// comma-separated lists of them are supported.
fn extract_uids(seq_set: &SequenceSet) -> Vec<u32> {
    seq_set
        .0
        .as_ref()
        .iter()
        .filter_map(|seq| match seq {
            Sequence::Single(SeqOrUid::Value(v)) => Some(v.get()),
            _ => None,
        })
        .collect()
}

/// Whether the requested items include the message body.
fn wants_body(items: &MacroOrMessageDataItemNames<'_>) -> bool {
    match items {
        MacroOrMessageDataItemNames::Macro(_) => false,
        MacroOrMessageDataItemNames::MessageDataItemNames(names) => names.iter().any(|name| {
            matches!(
                name,
                MessageDataItemName::BodyExt { .. } | MessageDataItemName::Rfc822
            )
        }),
    }
}

/// Answer a UID FETCH. Returns the number of bodies sent.
pub async fn handle_uid_fetch<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    sequence_set: &SequenceSet,
    items: &MacroOrMessageDataItemNames<'_>,
    mailbox: &Mailbox,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) -> usize {
    let Some(folder) = selected_folder.and_then(|name| mailbox.get_folder(name)) else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return 0;
    };

    let with_body = wants_body(items);
    let mut bodies = 0;

    for uid in extract_uids(sequence_set) {
        let Some((idx, email)) = folder.emails.iter().enumerate().find(|(_, e)| e.uid == uid) else {
            continue;
        };

        let meta = format!(
            "* {seq} FETCH (UID {uid} INTERNALDATE \"{date}\"",
            seq = idx + 1,
            date = email.internal_date.format(INTERNALDATE_FORMAT),
        );

        if !with_body {
            if write_line(stream, &format!("{meta})\r\n")).await.is_err() {
                return bodies;
            }
            continue;
        }

        let header = format!("{meta} BODY[] {{{len}}}\r\n", len = email.raw.len());
        if write_line(stream, &header).await.is_err()
            || write_bytes(stream, &email.raw).await.is_err()
            || write_line(stream, ")\r\n").await.is_err()
        {
            return bodies;
        }
        bodies += 1;
    }

    let resp = format!("{tag} OK FETCH completed\r\n");
    let _ = write_line(stream, &resp).await;
    bodies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use chrono::{TimeZone, Utc};
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    const RAW: &[u8] = b"From: a@b.com\r\nSubject: Test\r\n\r\nBody";

    fn uid_set(uid: u32) -> SequenceSet {
        SequenceSet(
            vec![Sequence::Single(SeqOrUid::Value(NonZeroU32::new(uid).unwrap()))]
                .try_into()
                .unwrap(),
        )
    }

    fn items(names: Vec<MessageDataItemName<'static>>) -> MacroOrMessageDataItemNames<'static> {
        MacroOrMessageDataItemNames::MessageDataItemNames(names)
    }

    fn body_items() -> MacroOrMessageDataItemNames<'static> {
        items(vec![
            MessageDataItemName::Uid,
            MessageDataItemName::InternalDate,
            MessageDataItemName::BodyExt {
                section: None,
                partial: None,
                peek: true,
            },
        ])
    }

    async fn run_with(
        sequence_set: &SequenceSet,
        items: &MacroOrMessageDataItemNames<'_>,
        mailbox: &Mailbox,
        selected: Option<&str>,
    ) -> (String, usize) {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        let bodies = handle_uid_fetch("A1", sequence_set, items, mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        (String::from_utf8(buf).unwrap(), bodies)
    }

    async fn run(sequence_set: &SequenceSet, mailbox: &Mailbox, selected: Option<&str>) -> String {
        run_with(sequence_set, &body_items(), mailbox, selected).await.0
    }

    #[tokio::test]
    async fn metadata_only_fetch_sends_no_body() {
        let delivered = Utc.with_ymd_and_hms(2025, 3, 2, 9, 5, 7).unwrap();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .email_at(3, delivered, RAW)
            .email_at(5, delivered, RAW)
            .build();
        let set = SequenceSet(
            vec![
                Sequence::Single(SeqOrUid::Value(NonZeroU32::new(3).unwrap())),
                Sequence::Single(SeqOrUid::Value(NonZeroU32::new(5).unwrap())),
            ]
            .try_into()
            .unwrap(),
        );
        let names = items(vec![MessageDataItemName::Uid, MessageDataItemName::InternalDate]);

        let (output, bodies) = run_with(&set, &names, &mailbox, Some("INBOX")).await;

        assert_eq!(bodies, 0);
        assert_eq!(
            output,
            "* 1 FETCH (UID 3 INTERNALDATE \"02-Mar-2025 09:05:07 +0000\")\r\n\
             * 2 FETCH (UID 5 INTERNALDATE \"02-Mar-2025 09:05:07 +0000\")\r\n\
             A1 OK FETCH completed\r\n"
        );
    }


    #[tokio::test]
    async fn returns_internal_date_and_literal_body() {
        let delivered = Utc.with_ymd_and_hms(2025, 3, 2, 9, 5, 7).unwrap();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .email(7, RAW)
            .email_at(42, delivered, RAW)
            .build();

        let output = run(&uid_set(42), &mailbox, Some("INBOX")).await;

        let expected = format!(
            "* 2 FETCH (UID 42 INTERNALDATE \"02-Mar-2025 09:05:07 +0000\" BODY[] {{{}}}\r\n",
            RAW.len()
        );
        assert!(output.starts_with(&expected));
        assert!(output.contains("Subject: Test"));
        assert!(output.ends_with(")\r\nA1 OK FETCH completed\r\n"));
    }

    #[tokio::test]
    async fn missing_uid_returns_only_ok() {
        let mailbox = MailboxBuilder::new().folder("INBOX").build();

        let output = run(&uid_set(99), &mailbox, Some("INBOX")).await;

        assert_eq!(output, "A1 OK FETCH completed\r\n");
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let mailbox = MailboxBuilder::new().folder("INBOX").build();

        let output = run(&uid_set(1), &mailbox, None).await;

        assert!(output.contains("A1 BAD No folder selected"));
    }
}
