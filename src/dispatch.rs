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

use std::{
    io::Write,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    direct::{self, Connector, Delivery, SmtpConnector, Status},
    mail::{self, address::Mailbox},
    mx::{DnsResolver, MxResolver},
    relay::{self, RelayTarget},
    smtp::message::check_address,
};

/// Selects the console transport instead of the network.
pub const CONSOLE: &str = "stdout";

#[derive(Debug, Clone)]
pub struct Config {
    /// `"stdout"`, `""` for direct delivery, or a relay URL.
    pub smtp: String,
    /// Whether console mode prints the message.
    pub print: bool,
    pub timeout: Duration,
    /// EHLO name. Defaults to the local host name.
    pub helo_host: Option<String>,
    /// Port used to reach mail exchangers.
    pub mx_port: u16,
    pub allow_invalid_certs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            smtp: String::new(),
            print: true,
            timeout: Duration::from_secs(60),
            helo_host: None,
            mx_port: 25,
            allow_invalid_certs: false,
        }
    }
}

impl Config {
    /// Sets the delivery mode.
    pub fn smtp(mut self, smtp: impl Into<String>) -> Self {
        self.smtp = smtp.into();
        self
    }

    /// Print messages in console mode
    pub fn print(mut self, print: bool) -> Self {
        self.print = print;
        self
    }

    /// Sets the SMTP timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the EHLO/HELO hostname
    pub fn helo_host(mut self, host: impl Into<String>) -> Self {
        self.helo_host = Some(host.into());
        self
    }

    pub fn mx_port(mut self, port: u16) -> Self {
        self.mx_port = port;
        self
    }

    /// Allow invalid TLS certificates
    pub fn allow_invalid_certs(mut self, allow_invalid_certs: bool) -> Self {
        self.allow_invalid_certs = allow_invalid_certs;
        self
    }
}

/// Outcome of one `send`.
#[derive(Debug)]
pub enum Report {
    /// Console mode, printed or discarded.
    Printed,
    /// One entry per recipient domain.
    Direct(Vec<Delivery>),
    Relay(crate::Result<()>),
}

/// Handle to a message handed to the dispatcher. Dropping it leaves the
/// delivery running in the background.
#[derive(Debug)]
pub enum Pending {
    Ready(Report),
    Spawned(JoinHandle<Report>),
}

impl Pending {
    /// Waits for the delivery to finish.
    pub async fn wait(self) -> crate::Result<Report> {
        match self {
            Pending::Ready(report) => Ok(report),
            Pending::Spawned(handle) => handle.await.map_err(|err| {
                log::error!("Delivery task failed: {err}");
                crate::Error::Aborted
            }),
        }
    }
}

type Console = Arc<Mutex<Box<dyn Write + Send>>>;

/// Fire-and-forget e-mail sender.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    resolver: Arc<OnceLock<Arc<dyn MxResolver>>>,
    connector: Arc<dyn Connector>,
    console: Console,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let connector = SmtpConnector {
            port: config.mx_port,
            timeout: config.timeout,
            helo_host: config.helo_host.clone(),
            allow_invalid_certs: config.allow_invalid_certs,
        };
        Dispatcher {
            config: Arc::new(config),
            resolver: Arc::new(OnceLock::new()),
            connector: Arc::new(connector),
            console: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
        }
    }

    /// Uses `resolver` for MX lookups instead of the system resolver.
    pub fn with_resolver(mut self, resolver: impl MxResolver + 'static) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::new(resolver) as Arc<dyn MxResolver>);
        self.resolver = Arc::new(cell);
        self
    }

    /// Uses `connector` to talk to mail exchangers.
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Writes console mode output to `console` instead of stdout.
    pub fn with_console(mut self, console: impl Write + Send + 'static) -> Self {
        self.console = Arc::new(Mutex::new(Box::new(console)));
        self
    }

    /// Formats the message and hands it to the configured transport.
    ///
    /// Fails here on an unparseable relay URL, on addresses that cannot be
    /// written to the envelope, and when network delivery is requested
    /// outside a Tokio runtime. Delivery failures are logged and reported
    /// through [`Pending::wait`].
    pub fn send(
        &self,
        subject: &str,
        from: &Mailbox,
        to: &[Mailbox],
        body: &str,
    ) -> crate::Result<Pending> {
        let mode = self.config.smtp.as_str();
        let target = match mode {
            CONSOLE => None,
            "" => None,
            relay => Some(RelayTarget::parse(relay)?),
        };

        check_address(&from.email)?;
        for rcpt in to {
            check_address(&rcpt.email)?;
        }

        let message: Arc<[u8]> = mail::format(subject, from, to, body).into();

        if mode == CONSOLE {
            if self.config.print {
                self.print(&message);
            }
            log::debug!(from:% = from.email; "Message sent to console");
            return Ok(Pending::Ready(Report::Printed));
        }

        let runtime = Handle::try_current().map_err(|err| {
            log::error!(from:% = from.email; "Cannot dispatch message: {err}");
            crate::Error::NoRuntime
        })?;
        let mail_from = from.email.clone();
        let recipients = to
            .iter()
            .map(|rcpt| rcpt.email.clone())
            .collect::<Vec<_>>();

        let handle = match target {
            Some(target) => {
                log::debug!(host:% = target.host, port = target.port; "Dispatching through relay");
                let config = self.config.clone();
                runtime.spawn(async move {
                    Report::Relay(
                        relay::deliver(&target, &config, &mail_from, &recipients, &message).await,
                    )
                })
            }
            None => {
                log::debug!(from:% = mail_from; "Dispatching to mail exchangers");
                let resolver = self.resolver.clone();
                let connector = self.connector.clone();
                runtime.spawn(async move {
                    let resolver = match resolver_or_system(&resolver) {
                        Ok(resolver) => resolver,
                        Err(err) => return Report::Direct(unresolved(&recipients, &err)),
                    };
                    Report::Direct(
                        direct::deliver(
                            resolver.as_ref(),
                            connector.as_ref(),
                            &mail_from,
                            &recipients,
                            &message,
                        )
                        .await,
                    )
                })
            }
        };

        Ok(Pending::Spawned(handle))
    }

    fn print(&self, message: &[u8]) {
        let rendered = render_console(&String::from_utf8_lossy(message));
        let mut console = self
            .console
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = console
            .write_all(rendered.as_bytes())
            .and_then(|_| console.flush())
        {
            log::warn!("Failed to print message: {err}");
        }
    }
}

fn resolver_or_system(
    resolver: &OnceLock<Arc<dyn MxResolver>>,
) -> crate::Result<Arc<dyn MxResolver>> {
    if let Some(resolver) = resolver.get() {
        return Ok(resolver.clone());
    }
    let system: Arc<dyn MxResolver> = Arc::new(DnsResolver::from_system_conf()?);
    Ok(resolver.get_or_init(|| system).clone())
}

fn unresolved(recipients: &[String], err: &crate::Error) -> Vec<Delivery> {
    log::error!(to:% = recipients.join(","); "{err}");
    direct::group_by_domain(recipients)
        .into_iter()
        .map(|(domain, recipients)| Delivery {
            domain,
            recipients,
            status: Status::Failed(crate::Error::Dns(err.to_string())),
        })
        .collect()
}

/// Frames a message for the console.
pub fn render_console(message: &str) -> String {
    let rule = "═".repeat(50);
    format!(
        "╔═══ EMAIL {rule}\n║ {}\n╚══════════{rule}\n\n",
        message.trim().replace("\r\n", "\r\n║ ")
    )
}
