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

//! Delivery through a single SMTP relay.

use percent_encoding::percent_decode_str;
use url::Url;

use crate::{
    dispatch::Config,
    smtp::{auth::Credentials, message::Message},
    SmtpClientBuilder,
};

/// A relay parsed from `scheme://[user[:pass]@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
    pub credentials: Option<Credentials<'static>>,
}

impl RelayTarget {
    /// Parses a relay URL. The `smtps` scheme connects over TLS and
    /// defaults to port 465, every other scheme defaults to port 25.
    pub fn parse(relay: &str) -> crate::Result<Self> {
        let url = Url::parse(relay)?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| crate::Error::InvalidRelay(format!("missing host in {relay:?}")))?
            .to_string();
        let implicit_tls = url.scheme().eq_ignore_ascii_case("smtps");
        let port = url
            .port()
            .unwrap_or(if implicit_tls { 465 } else { 25 });

        let credentials = if !url.username().is_empty() {
            Some(Credentials::new(
                decode(url.username())?,
                decode(url.password().unwrap_or_default())?,
            ))
        } else {
            None
        };

        Ok(RelayTarget {
            host,
            port,
            implicit_tls,
            credentials,
        })
    }
}

fn decode(value: &str) -> crate::Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|value| value.into_owned())
        .map_err(|err| crate::Error::InvalidRelay(err.to_string()))
}

/// Sends `body` to every recipient through the relay. Any refusal fails
/// the whole send.
pub async fn deliver(
    target: &RelayTarget,
    config: &Config,
    mail_from: &str,
    recipients: &[String],
    body: &[u8],
) -> crate::Result<()> {
    let result = send(target, config, mail_from, recipients, body).await;

    match &result {
        Ok(()) => log::info!(
            host:% = target.host, from:% = mail_from, to:% = recipients.join(",");
            "Message relayed"
        ),
        Err(err) => log::error!(
            host:% = target.host, from:% = mail_from, to:% = recipients.join(",");
            "Relay delivery failed: {err}"
        ),
    }

    result
}

async fn send(
    target: &RelayTarget,
    config: &Config,
    mail_from: &str,
    recipients: &[String],
    body: &[u8],
) -> crate::Result<()> {
    let mut builder = SmtpClientBuilder::new(target.host.as_str(), target.port)
        .implicit_tls(target.implicit_tls)
        .timeout(config.timeout)
        .allow_invalid_certs(config.allow_invalid_certs);
    if let Some(helo_host) = &config.helo_host {
        builder = builder.helo_host(helo_host);
    }

    let mut client = builder.connect().await?;
    if let Some(credentials) = &target.credentials {
        client.authenticate(credentials, &target.host).await?;
    }

    let message = Message::new(mail_from, recipients.iter().map(String::as_str), body);
    client.send(&message).await?;
    client.quit().await
}
