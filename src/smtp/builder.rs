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

use std::{sync::OnceLock, time::Duration};

use smtp_proto::{EhloResponse, EXT_START_TLS};
use tokio::net::TcpStream;

use crate::{SmtpClient, SmtpClientBuilder};

use super::{stream::SmtpStream, tls::build_tls_connector, AssertReply};

static LOCAL_HOST: OnceLock<String> = OnceLock::new();

/// Name announced in EHLO/HELO. Looked up on first use and shared by
/// every later session; concurrent first callers wait for that lookup.
pub fn local_host() -> &'static str {
    LOCAL_HOST.get_or_init(|| {
        gethostname::gethostname()
            .into_string()
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| "[127.0.0.1]".to_string())
    })
}

impl<T: AsRef<str>> SmtpClientBuilder<T> {
    pub fn new(hostname: T, port: u16) -> Self {
        SmtpClientBuilder {
            addr: format!("{}:{}", hostname.as_ref().trim_end_matches('.'), port),
            timeout: Duration::from_secs(60),
            tls_connector: build_tls_connector(false),
            tls_hostname: hostname,
            tls_implicit: false,
            local_host: local_host().to_string(),
        }
    }

    /// Allow invalid TLS certificates
    pub fn allow_invalid_certs(mut self, allow_invalid_certs: bool) -> Self {
        self.tls_connector = build_tls_connector(allow_invalid_certs);
        self
    }

    /// Start connection in TLS or upgrade with STARTTLS when advertised
    pub fn implicit_tls(mut self, tls_implicit: bool) -> Self {
        self.tls_implicit = tls_implicit;
        self
    }

    /// Set the EHLO/HELO hostname
    pub fn helo_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Sets the SMTP connection timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Opens the connection and reads the server greeting. A negative
    /// greeting is returned as [`crate::Error::UnexpectedReply`].
    pub async fn open(&self) -> crate::Result<SmtpClient<SmtpStream>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| crate::Error::Timeout)??;
        let client = SmtpClient {
            stream: SmtpStream::Basic(stream),
            timeout: self.timeout,
            capabilities: (),
        };

        let mut client = if self.tls_implicit {
            client
                .into_tls(&self.tls_connector, self.tls_hostname.as_ref())
                .await?
        } else {
            client
        };

        // Read greeting
        tokio::time::timeout(self.timeout, client.read())
            .await
            .map_err(|_| crate::Error::Timeout)??
            .assert_positive_completion()?;

        Ok(client)
    }

    /// Greets an opened session, upgrading it with STARTTLS when the server
    /// advertises the extension.
    pub async fn handshake(
        &self,
        mut client: SmtpClient<SmtpStream>,
    ) -> crate::Result<SmtpClient<SmtpStream, EhloResponse<String>>> {
        let capabilities = client.hello(&self.local_host).await?;

        if client.stream.is_tls() || !capabilities.has_capability(EXT_START_TLS) {
            return Ok(SmtpClient {
                stream: client.stream,
                timeout: client.timeout,
                capabilities,
            });
        }

        let mut client = client
            .start_tls(&self.tls_connector, self.tls_hostname.as_ref())
            .await?;
        Ok(SmtpClient {
            capabilities: client.hello(&self.local_host).await?,
            stream: client.stream,
            timeout: client.timeout,
        })
    }

    /// Connects and completes the greeting.
    pub async fn connect(&self) -> crate::Result<SmtpClient<SmtpStream, EhloResponse<String>>> {
        let client = self.open().await?;
        self.handshake(client).await
    }
}
