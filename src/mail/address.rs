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

use std::fmt::Display;

use super::encode::{b_encode, q_encode};

/// An e-mail address with an optional display name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    pub name: Option<String>,
    pub email: String,
}

impl Mailbox {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let name = name.into();
        Mailbox {
            name: (!name.is_empty()).then_some(name),
            email: email.into(),
        }
    }
}

/// The text after the last `@` of an address, or the whole address when it
/// has none.
pub fn domain_of(email: &str) -> &str {
    email.rsplit_once('@').map_or(email, |(_, domain)| domain)
}

impl From<&str> for Mailbox {
    fn from(email: &str) -> Self {
        Mailbox {
            name: None,
            email: email.to_string(),
        }
    }
}

impl From<String> for Mailbox {
    fn from(email: String) -> Self {
        Mailbox { name: None, email }
    }
}

impl<T: Into<String>, U: Into<String>> From<(T, U)> for Mailbox {
    fn from((name, email): (T, U)) -> Self {
        Mailbox::new(name, email)
    }
}

const PHRASE_SPECIALS: [char; 23] = [
    '"', '#', '$', '%', '&', '\'', '(', ')', ',', '.', ':', ';', '<', '>', '@', '[', ']', '^', '`',
    '{', '|', '}', '~',
];

fn is_printable(name: &str) -> bool {
    name.chars().all(|ch| matches!(ch, ' ' | '\t' | '!'..='~'))
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            if is_printable(name) {
                f.write_str("\"")?;
                for ch in name.chars() {
                    if matches!(ch, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{ch}")?;
                }
                f.write_str("\" ")?;
            } else if name.contains(&PHRASE_SPECIALS[..]) {
                // Encoded words in a phrase may not carry these in Q form
                write!(f, "{} ", b_encode(name))?;
            } else {
                write!(f, "{} ", q_encode(name))?;
            }
        }
        // Characters that could end the header or the angle address are dropped
        f.write_str("<")?;
        for ch in self
            .email
            .chars()
            .filter(|ch| !matches!(ch, '<' | '>') && !ch.is_control())
        {
            write!(f, "{ch}")?;
        }
        f.write_str(">")
    }
}
