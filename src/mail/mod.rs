/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Plain text message formatting.

pub mod address;
pub mod encode;

use std::{fmt::Write, sync::OnceLock};

use chrono::{DateTime, FixedOffset, Local};
use rand::RngCore;
use regex::Regex;

use self::{
    address::Mailbox,
    encode::{q_encode, quoted_printable},
};

const MESSAGE_ID_PREFIX: &str = "zmail";

/// Formats a message dated now, with a Message-ID drawn from the thread
/// CSPRNG.
pub fn format(subject: &str, from: &Mailbox, to: &[Mailbox], body: &str) -> Vec<u8> {
    format_with(
        subject,
        from,
        to,
        body,
        Local::now().into(),
        &mut rand::thread_rng(),
    )
}

/// Formats a message. The output only depends on the arguments, so a
/// fixed date and a seeded `rng` yield identical bytes.
pub fn format_with<R: RngCore + ?Sized>(
    subject: &str,
    from: &Mailbox,
    to: &[Mailbox],
    body: &str,
    date: DateTime<FixedOffset>,
    rng: &mut R,
) -> Vec<u8> {
    let mut msg = String::with_capacity(body.len() + 512);

    let _ = write!(msg, "From: {from}\r\n");
    msg.push_str("To: ");
    for (pos, rcpt) in to.iter().enumerate() {
        if pos > 0 {
            msg.push(',');
        }
        let _ = write!(msg, "{rcpt}");
    }
    msg.push_str("\r\n");
    let _ = write!(msg, "Date: {}\r\n", date.format("%a, %d %b %Y %H:%M:%S %z"));
    msg.push_str("Content-Type: text/plain;charset=utf-8\r\n");
    msg.push_str("Content-Transfer-Encoding: quoted-printable\r\n");
    let _ = write!(msg, "Message-ID: <{}>\r\n", message_id(from, body, rng));
    let _ = write!(msg, "Subject: {}\r\n", q_encode(&sanitize_subject(subject)));
    msg.push_str("\r\n");
    msg.push_str(&quoted_printable(body));

    msg.into_bytes()
}

/// Removes every run of two or more CRLF pairs so that a subject cannot
/// terminate the header block.
pub fn sanitize_subject(subject: &str) -> std::borrow::Cow<'_, str> {
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    BLANK_LINES
        .get_or_init(|| Regex::new(r"(\r\n){2,}").expect("valid regex"))
        .replace_all(subject, "")
}

/// `zmail-<fnv1a(body)>-<random>@<sender domain>`, both numbers in base 36.
pub fn message_id<R: RngCore + ?Sized>(from: &Mailbox, body: &str, rng: &mut R) -> String {
    let domain = from
        .email
        .split_once('@')
        .map_or(from.email.as_str(), |(_, domain)| domain);
    format!(
        "{MESSAGE_ID_PREFIX}-{}-{}@{domain}",
        base36(fnv1a64(body.as_bytes())),
        base36(rng.next_u64())
    )
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut buf = Vec::with_capacity(13);
    loop {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    buf.iter().rev().map(|digit| *digit as char).collect()
}
