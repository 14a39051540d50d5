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

use std::{borrow::Cow, fmt::Debug, net::IpAddr};

use base64::{engine::general_purpose, Engine};
use smtp_proto::{EhloResponse, EXT_AUTH};

use crate::SmtpClient;

use super::stream::SmtpStream;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials<'x> {
    username: Cow<'x, str>,
    secret: Cow<'x, str>,
}

impl<'x> Credentials<'x> {
    /// Creates a new `Credentials` instance.
    pub fn new(
        username: impl Into<Cow<'x, str>>,
        secret: impl Into<Cow<'x, str>>,
    ) -> Credentials<'x> {
        Credentials {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// SASL PLAIN initial response (RFC 4616) with an empty authorization
    /// identity.
    pub fn encode_plain(&self) -> String {
        general_purpose::STANDARD.encode(format!("\u{0}{}\u{0}{}", self.username, self.secret))
    }
}

impl Debug for Credentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// PLAIN sends the secret in the clear, so it is only used once the
/// session is encrypted or when talking to the local machine.
fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().map_or(false, |ip| ip.is_loopback())
}

impl SmtpClient<SmtpStream, EhloResponse<String>> {
    /// Authenticates with AUTH PLAIN.
    pub async fn authenticate(
        &mut self,
        credentials: &Credentials<'_>,
        hostname: &str,
    ) -> crate::Result<()> {
        if !self.capabilities.has_capability(EXT_AUTH) {
            return Err(crate::Error::UnsupportedAuthMechanism);
        } else if !self.stream.is_tls() && !is_loopback(hostname) {
            return Err(crate::Error::InsecureAuth);
        }

        let reply = self
            .cmd(format!("AUTH PLAIN {}\r\n", credentials.encode_plain()).as_bytes())
            .await?;
        if reply.code() == 235 {
            Ok(())
        } else {
            Err(crate::Error::AuthenticationFailed(reply))
        }
    }
}
