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

use std::{borrow::Cow, collections::BTreeMap, fmt::Display};

/// An SMTP transaction: envelope sender, envelope recipients and the
/// already formatted message.
#[derive(Debug, Default, Clone)]
pub struct Message<'x> {
    pub mail_from: Cow<'x, str>,
    pub rcpt_to: Vec<Cow<'x, str>>,
    pub body: Cow<'x, [u8]>,
}

/// ESMTP parameters appended to MAIL FROM.
#[derive(Debug, Default)]
pub struct Parameters<'x> {
    params: BTreeMap<Cow<'x, str>, Cow<'x, str>>,
}

impl<'x> Message<'x> {
    /// Create a new message
    pub fn new<T, U, V>(from: T, to: U, body: V) -> Self
    where
        T: Into<Cow<'x, str>>,
        U: IntoIterator,
        U::Item: Into<Cow<'x, str>>,
        V: Into<Cow<'x, [u8]>>,
    {
        Message {
            mail_from: from.into(),
            rcpt_to: to.into_iter().map(Into::into).collect(),
            body: body.into(),
        }
    }

    /// Checks the envelope before anything is written to the server.
    pub fn validate(&self) -> crate::Result<()> {
        if self.mail_from.is_empty() {
            return Err(crate::Error::MissingMailFrom);
        } else if self.rcpt_to.is_empty() {
            return Err(crate::Error::MissingRcptTo);
        }
        check_address(&self.mail_from)?;
        self.rcpt_to
            .iter()
            .try_for_each(|rcpt| check_address(rcpt))
    }
}

/// Rejects addresses that would break out of an SMTP command line or the
/// angle brackets around the path.
pub fn check_address(addr: &str) -> crate::Result<()> {
    if addr
        .chars()
        .any(|ch| matches!(ch, '\r' | '\n' | '<' | '>') || ch.is_control())
    {
        Err(crate::Error::InvalidAddress(addr.to_string()))
    } else {
        Ok(())
    }
}

impl<'x> Parameters<'x> {
    pub fn new() -> Self {
        Self {
            params: BTreeMap::new(),
        }
    }

    pub fn param(&mut self, key: impl Into<Cow<'x, str>>, value: impl Into<Cow<'x, str>>) {
        self.params.insert(key.into(), value.into());
    }
}

impl<'x> Display for Parameters<'x> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.params {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}
