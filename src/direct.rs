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

//! Delivery straight to the recipients' mail exchangers.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;

use crate::{mail::address::domain_of, mx::MxResolver, smtp::message::Message, SmtpClientBuilder};

/// Why an exchanger did not take the message.
#[derive(Debug)]
pub enum HostFailure {
    /// The exchanger could not be reached or is temporarily unavailable.
    Unreachable(crate::Error),
    /// The exchanger refused this client before the session started.
    Rejected(crate::Error),
    /// The SMTP session failed after the greeting.
    Session(crate::Error),
}

/// Runs one SMTP transaction against one exchanger.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Delivers `message` through `host`. On success returns the recipients
    /// the exchanger refused.
    async fn deliver(
        &self,
        host: &str,
        message: &Message<'_>,
    ) -> Result<Vec<(String, crate::Error)>, HostFailure>;
}

/// Outcome of delivering to the recipients of one domain.
#[derive(Debug)]
pub struct Delivery {
    pub domain: String,
    pub recipients: Vec<String>,
    pub status: Status,
}

#[derive(Debug)]
pub enum Status {
    /// Accepted by `host`, except for the `refused` recipients.
    Delivered {
        host: String,
        refused: Vec<(String, crate::Error)>,
    },
    Failed(crate::Error),
}

/// Speaks SMTP to exchangers.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    pub port: u16,
    pub timeout: Duration,
    pub helo_host: Option<String>,
    pub allow_invalid_certs: bool,
}

impl Default for SmtpConnector {
    fn default() -> Self {
        SmtpConnector {
            port: 25,
            timeout: Duration::from_secs(60),
            helo_host: None,
            allow_invalid_certs: false,
        }
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    async fn deliver(
        &self,
        host: &str,
        message: &Message<'_>,
    ) -> Result<Vec<(String, crate::Error)>, HostFailure> {
        let mut builder = SmtpClientBuilder::new(host, self.port)
            .timeout(self.timeout)
            .allow_invalid_certs(self.allow_invalid_certs);
        if let Some(helo_host) = &self.helo_host {
            builder = builder.helo_host(helo_host);
        }

        let client = builder.open().await.map_err(|err| match err {
            crate::Error::UnexpectedReply(reply) if reply.code() >= 500 => {
                HostFailure::Rejected(crate::Error::UnexpectedReply(reply))
            }
            err => HostFailure::Unreachable(err),
        })?;

        let mut client = builder
            .handshake(client)
            .await
            .map_err(HostFailure::Session)?;
        let refused = client
            .send_partial(message)
            .await
            .map_err(HostFailure::Session)?;
        client.quit().await.map_err(HostFailure::Session)?;

        Ok(refused)
    }
}

/// Groups recipients by domain, keeping the order of first appearance.
pub fn group_by_domain(recipients: &[String]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for rcpt in recipients {
        let domain = domain_of(rcpt).to_ascii_lowercase();
        match groups.iter_mut().find(|(name, _)| *name == domain) {
            Some((_, rcpts)) => {
                if !rcpts.contains(rcpt) {
                    rcpts.push(rcpt.clone());
                }
            }
            None => groups.push((domain, vec![rcpt.clone()])),
        }
    }
    groups
}

struct Recipients<'x>(&'x [String]);

impl Display for Recipients<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Delivers `body` to every recipient, one domain at a time. Each domain is
/// independent: a failure only ends the attempts for that domain.
pub async fn deliver(
    resolver: &dyn MxResolver,
    connector: &dyn Connector,
    mail_from: &str,
    recipients: &[String],
    body: &[u8],
) -> Vec<Delivery> {
    let mut deliveries = Vec::new();

    for (domain, rcpts) in group_by_domain(recipients) {
        let status = deliver_domain(resolver, connector, mail_from, &domain, &rcpts, body).await;
        deliveries.push(Delivery {
            domain,
            recipients: rcpts,
            status,
        });
    }

    deliveries
}

async fn deliver_domain(
    resolver: &dyn MxResolver,
    connector: &dyn Connector,
    mail_from: &str,
    domain: &str,
    rcpts: &[String],
    body: &[u8],
) -> Status {
    let hosts = match resolver.lookup_mx(domain).await {
        Ok(hosts) if !hosts.is_empty() => hosts,
        Ok(_) => {
            let err = crate::Error::Dns(format!("no mail exchangers for {domain}"));
            log::error!(domain:% = domain, to:% = Recipients(rcpts); "{err}");
            return Status::Failed(err);
        }
        Err(err) => {
            log::error!(domain:% = domain, to:% = Recipients(rcpts); "{err}");
            return Status::Failed(err);
        }
    };

    let message = Message::new(mail_from, rcpts.iter().map(String::as_str), body);
    let mut last_err = None;

    for host in hosts {
        match connector.deliver(&host, &message).await {
            Ok(refused) => {
                for (rcpt, err) in &refused {
                    log::warn!(host:% = host, from:% = mail_from, to:% = rcpt; "Recipient refused: {err}");
                }
                log::info!(
                    host:% = host, from:% = mail_from, to:% = Recipients(rcpts);
                    "Message delivered"
                );
                return Status::Delivered { host, refused };
            }
            Err(HostFailure::Unreachable(err)) => {
                log::warn!(host:% = host, from:% = mail_from, to:% = Recipients(rcpts); "{err}");
                last_err = Some(err);
            }
            Err(HostFailure::Rejected(err) | HostFailure::Session(err)) => {
                log::error!(host:% = host, from:% = mail_from, to:% = Recipients(rcpts); "{err}");
                return Status::Failed(err);
            }
        }
    }

    let err = last_err.unwrap_or(crate::Error::Aborted);
    log::error!(
        domain:% = domain, from:% = mail_from, to:% = Recipients(rcpts);
        "No mail exchanger accepted the connection: {err}"
    );
    Status::Failed(err)
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use crate::{mx::MxResolver, smtp::message::Message};

    use super::{deliver, group_by_domain, Connector, HostFailure, SmtpConnector, Status};

    #[derive(Default, Clone)]
    pub struct StaticResolver {
        pub records: HashMap<String, Vec<String>>,
        pub lookups: Arc<Mutex<Vec<String>>>,
    }

    impl StaticResolver {
        pub fn with(mut self, domain: &str, hosts: &[&str]) -> Self {
            self.records.insert(
                domain.to_string(),
                hosts.iter().map(|host| host.to_string()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl MxResolver for StaticResolver {
        async fn lookup_mx(&self, domain: &str) -> crate::Result<Vec<String>> {
            self.lookups.lock().unwrap().push(domain.to_string());
            self.records
                .get(domain)
                .cloned()
                .ok_or_else(|| crate::Error::Dns(format!("{domain}: NXDOMAIN")))
        }
    }

    #[derive(Clone, Copy)]
    pub enum Behavior {
        Accept,
        Unreachable,
        Rejected,
        SessionError,
        RefuseRecipient,
    }

    /// Scripted exchangers; records every attempted host.
    #[derive(Default, Clone)]
    pub struct ScriptedConnector {
        pub hosts: HashMap<String, Behavior>,
        pub attempts: Arc<Mutex<Vec<(String, Vec<String>, usize)>>>,
    }

    impl ScriptedConnector {
        pub fn with(mut self, host: &str, behavior: Behavior) -> Self {
            self.hosts.insert(host.to_string(), behavior);
            self
        }

        pub fn attempted_hosts(&self) -> Vec<String> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .map(|(host, _, _)| host.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn deliver(
            &self,
            host: &str,
            message: &Message<'_>,
        ) -> Result<Vec<(String, crate::Error)>, HostFailure> {
            self.attempts.lock().unwrap().push((
                host.to_string(),
                message.rcpt_to.iter().map(|rcpt| rcpt.to_string()).collect(),
                message.body.len(),
            ));
            match self.hosts.get(host).copied().unwrap_or(Behavior::Unreachable) {
                Behavior::Accept => Ok(vec![]),
                Behavior::Unreachable => Err(HostFailure::Unreachable(crate::Error::Timeout)),
                Behavior::Rejected => Err(HostFailure::Rejected(crate::Error::UnparseableReply)),
                Behavior::SessionError => Err(HostFailure::Session(crate::Error::UnparseableReply)),
                Behavior::RefuseRecipient => Ok(vec![(
                    message.rcpt_to[0].to_string(),
                    crate::Error::MissingRcptTo,
                )]),
            }
        }
    }

    fn rcpts(list: &[&str]) -> Vec<String> {
        list.iter().map(|rcpt| rcpt.to_string()).collect()
    }

    #[tokio::test]
    async fn rejected_greeting_stops_loop() {
        let resolver = StaticResolver::default().with(
            "example.org",
            &["mx1.example.org", "mx2.example.org", "mx3.example.org"],
        );
        let connector = ScriptedConnector::default()
            .with("mx1.example.org", Behavior::Rejected)
            .with("mx2.example.org", Behavior::Accept);

        let result = deliver(
            &resolver,
            &connector,
            "app@example.com",
            &rcpts(&["jane@example.org"]),
            b"message",
        )
        .await;

        assert_eq!(connector.attempted_hosts(), ["mx1.example.org"]);
        assert!(matches!(result[0].status, Status::Failed(_)));
    }

    #[tokio::test]
    async fn unreachable_host_advances() {
        let resolver = StaticResolver::default().with(
            "example.org",
            &["mx1.example.org", "mx2.example.org", "mx3.example.org"],
        );
        let connector = ScriptedConnector::default()
            .with("mx1.example.org", Behavior::Unreachable)
            .with("mx2.example.org", Behavior::Accept);

        let result = deliver(
            &resolver,
            &connector,
            "app@example.com",
            &rcpts(&["jane@example.org"]),
            b"message",
        )
        .await;

        assert_eq!(
            connector.attempted_hosts(),
            ["mx1.example.org", "mx2.example.org"]
        );
        match &result[0].status {
            Status::Delivered { host, refused } => {
                assert_eq!(host, "mx2.example.org");
                assert!(refused.is_empty());
            }
            Status::Failed(err) => panic!("unexpected failure {err}"),
        }
    }

    #[tokio::test]
    async fn session_error_stops_loop() {
        let resolver = StaticResolver::default()
            .with("example.org", &["mx1.example.org", "mx2.example.org"]);
        let connector = ScriptedConnector::default()
            .with("mx1.example.org", Behavior::SessionError)
            .with("mx2.example.org", Behavior::Accept);

        let result = deliver(
            &resolver,
            &connector,
            "app@example.com",
            &rcpts(&["jane@example.org"]),
            b"message",
        )
        .await;

        assert_eq!(connector.attempted_hosts(), ["mx1.example.org"]);
        assert!(matches!(result[0].status, Status::Failed(_)));
    }

    #[tokio::test]
    async fn all_hosts_unreachable() {
        let resolver = StaticResolver::default()
            .with("example.org", &["mx1.example.org", "mx2.example.org"]);
        let connector = ScriptedConnector::default();

        let result = deliver(
            &resolver,
            &connector,
            "app@example.com",
            &rcpts(&["jane@example.org"]),
            b"message",
        )
        .await;

        assert_eq!(connector.attempted_hosts().len(), 2);
        assert!(matches!(
            result[0].status,
            Status::Failed(crate::Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn domains_are_independent() {
        let resolver = StaticResolver::default()
            .with("example.org", &["mx.example.org"])
            .with("example.net", &["mx.example.net"]);
        let connector = ScriptedConnector::default()
            .with("mx.example.org", Behavior::Rejected)
            .with("mx.example.net", Behavior::RefuseRecipient);

        let result = deliver(
            &resolver,
            &connector,
            "app@example.com",
            &rcpts(&[
                "jane@example.org",
                "nobody@example.net",
                "missing@example.invalid",
                "james@example.net",
                "john@example.org",
            ]),
            b"message",
        )
        .await;

        assert_eq!(
            resolver.lookups.lock().unwrap().as_slice(),
            ["example.org", "example.net", "example.invalid"]
        );
        assert_eq!(result.len(), 3);
        assert!(matches!(result[0].status, Status::Failed(_)));
        assert!(matches!(
            result[1].status,
            Status::Delivered { ref refused, .. } if refused.len() == 1
        ));
        assert!(matches!(
            result[2].status,
            Status::Failed(crate::Error::Dns(_))
        ));

        // Each exchanger only sees its own recipients and the same body
        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(
            attempts,
            [
                (
                    "mx.example.org".to_string(),
                    rcpts(&["jane@example.org", "john@example.org"]),
                    7
                ),
                (
                    "mx.example.net".to_string(),
                    rcpts(&["nobody@example.net", "james@example.net"]),
                    7
                ),
            ]
        );
    }

    #[test]
    fn grouping() {
        assert_eq!(
            group_by_domain(&rcpts(&[
                "a@Example.org",
                "b@example.net",
                "c@example.org",
                "a@Example.org",
                "d@x@example.net",
            ])),
            [
                (
                    "example.org".to_string(),
                    rcpts(&["a@Example.org", "c@example.org"])
                ),
                (
                    "example.net".to_string(),
                    rcpts(&["b@example.net", "d@x@example.net"])
                ),
            ]
        );
    }

    /// Sends `greeting`, then answers each line received with the next
    /// reply until the script runs out.
    async fn scripted_exchanger(greeting: &'static str, replies: &'static [&'static str]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer.write_all(greeting.as_bytes()).await.unwrap();
            for reply in replies {
                if lines.next_line().await.unwrap().is_none() {
                    break;
                }
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        port
    }

    fn connector(port: u16) -> SmtpConnector {
        SmtpConnector {
            port,
            timeout: Duration::from_secs(5),
            helo_host: Some("client.test".to_string()),
            allow_invalid_certs: false,
        }
    }

    async fn deliver_to(port: u16) -> Result<Vec<(String, crate::Error)>, HostFailure> {
        let message = Message::new("app@example.com", ["jane@example.org"], &b"body\r\n"[..]);
        connector(port).deliver("127.0.0.1", &message).await
    }

    #[tokio::test]
    async fn blocklisted_greeting_is_rejected() {
        let port = scripted_exchanger(
            "554 5.7.1 Service unavailable; Client host [192.0.2.1] blocked using zen.example\r\n",
            &[],
        )
        .await;
        match deliver_to(port).await {
            Err(HostFailure::Rejected(crate::Error::UnexpectedReply(reply))) => {
                assert_eq!(reply.code(), 554)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn busy_greeting_is_unreachable() {
        let port = scripted_exchanger("421 4.3.2 busy, try later\r\n", &[]).await;
        match deliver_to(port).await {
            Err(HostFailure::Unreachable(crate::Error::UnexpectedReply(reply))) => {
                assert_eq!(reply.code(), 421)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(matches!(
            deliver_to(port).await,
            Err(HostFailure::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn failed_ehlo_is_session_error() {
        let port = scripted_exchanger(
            "220 mx.example.org ESMTP\r\n",
            &["554 5.7.0 go away\r\n"],
        )
        .await;
        match deliver_to(port).await {
            Err(HostFailure::Session(crate::Error::UnexpectedReply(reply))) => {
                assert_eq!(reply.code(), 554)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_by_exchanger() {
        let port = scripted_exchanger(
            "220 mx.example.org ESMTP\r\n",
            &[
                "250 mx.example.org\r\n",
                "250 2.1.0 ok\r\n",
                "250 2.1.5 ok\r\n",
                "354 go ahead\r\n",
                "",
                "250 2.0.0 queued\r\n",
                "221 bye\r\n",
            ],
        )
        .await;
        assert!(deliver_to(port).await.unwrap().is_empty());
    }
}
