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

use std::{borrow::Cow, fmt::Write};

use base64::{engine::general_purpose, Engine};

const WORD_PREFIX_Q: &str = "=?utf-8?q?";
const WORD_PREFIX_B: &str = "=?utf-8?b?";
const WORD_SUFFIX: &str = "?=";
const MAX_WORD_LEN: usize = 75;
const MAX_CONTENT_LEN: usize = MAX_WORD_LEN - WORD_PREFIX_Q.len() - WORD_SUFFIX.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordEncoding {
    Q,
    B,
}

/// Returns `true` if the text contains characters that cannot appear
/// verbatim in a header.
pub fn needs_encoding(text: &str) -> bool {
    text.chars()
        .any(|ch| (ch < ' ' || ch > '~') && ch != '\t')
}

/// RFC 2047 Q encoding. Text made of printable ASCII is returned as is.
pub fn q_encode(text: &str) -> Cow<'_, str> {
    encode_word(text, WordEncoding::Q)
}

/// RFC 2047 B encoding. Text made of printable ASCII is returned as is.
pub fn b_encode(text: &str) -> Cow<'_, str> {
    encode_word(text, WordEncoding::B)
}

/// Encodes `text` as one or more encoded words of at most 75 characters,
/// separated by a space. Words never split a UTF-8 sequence.
pub fn encode_word(text: &str, encoding: WordEncoding) -> Cow<'_, str> {
    if !needs_encoding(text) {
        return text.into();
    }

    let prefix = match encoding {
        WordEncoding::Q => WORD_PREFIX_Q,
        WordEncoding::B => WORD_PREFIX_B,
    };
    let mut result = String::with_capacity(text.len() * 3);
    // Q: encoded text of the current word. B: raw text, encoded on flush.
    let mut chunk = String::new();
    let mut buf = [0u8; 4];

    for ch in text.chars() {
        let bytes = ch.encode_utf8(&mut buf).as_bytes();
        let fits = match encoding {
            WordEncoding::Q => {
                chunk.len() + bytes.iter().map(|b| q_len(*b)).sum::<usize>() <= MAX_CONTENT_LEN
            }
            WordEncoding::B => base64_len(chunk.len() + bytes.len()) <= MAX_CONTENT_LEN,
        };

        if !fits && !chunk.is_empty() {
            flush_word(&mut result, prefix, &chunk, encoding);
            chunk.clear();
        }

        match encoding {
            WordEncoding::Q => {
                for byte in bytes {
                    write_q(&mut chunk, *byte);
                }
            }
            WordEncoding::B => chunk.push(ch),
        }
    }
    if !chunk.is_empty() {
        flush_word(&mut result, prefix, &chunk, encoding);
    }

    result.into()
}

fn flush_word(result: &mut String, prefix: &str, chunk: &str, encoding: WordEncoding) {
    if !result.is_empty() {
        result.push(' ');
    }
    result.push_str(prefix);
    match encoding {
        WordEncoding::Q => result.push_str(chunk),
        WordEncoding::B => result.push_str(&general_purpose::STANDARD.encode(chunk)),
    }
    result.push_str(WORD_SUFFIX);
}

fn is_q_literal(byte: u8) -> bool {
    (b'!'..=b'~').contains(&byte) && !matches!(byte, b'=' | b'?' | b'_')
}

fn q_len(byte: u8) -> usize {
    if byte == b' ' || is_q_literal(byte) {
        1
    } else {
        3
    }
}

fn write_q(out: &mut String, byte: u8) {
    if byte == b' ' {
        out.push('_');
    } else if is_q_literal(byte) {
        out.push(byte as char);
    } else {
        let _ = write!(out, "={byte:02X}");
    }
}

fn base64_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Quoted-printable body encoding. Line breaks are normalized to CRLF
/// before encoding.
pub fn quoted_printable(body: &str) -> String {
    let mut normalized = String::with_capacity(body.len() + 16);
    let mut lines = body.split('\n').peekable();
    while let Some(line) = lines.next() {
        normalized.push_str(line.strip_suffix('\r').unwrap_or(line));
        if lines.peek().is_some() {
            normalized.push_str("\r\n");
        }
    }
    quoted_printable::encode_to_str(normalized.as_bytes())
}
