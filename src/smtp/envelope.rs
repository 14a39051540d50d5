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

use smtp_proto::{EhloResponse, EXT_SIZE};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::SmtpClient;

use super::{
    message::{check_address, Message, Parameters},
    AssertReply,
};

impl<T: AsyncRead + AsyncWrite + Unpin, U> SmtpClient<T, U> {
    /// Sends a MAIL FROM command to the server.
    pub async fn mail_from(&mut self, addr: &str, params: &Parameters<'_>) -> crate::Result<()> {
        check_address(addr)?;
        self.cmd(format!("MAIL FROM:<{addr}>{params}\r\n").as_bytes())
            .await?
            .assert_positive_completion()
    }

    /// Sends a RCPT TO command to the server.
    pub async fn rcpt_to(&mut self, addr: &str, params: &Parameters<'_>) -> crate::Result<()> {
        check_address(addr)?;
        self.cmd(format!("RCPT TO:<{addr}>{params}\r\n").as_bytes())
            .await?
            .assert_positive_completion()
    }

    /// Sends a DATA command to the server.
    pub async fn data(&mut self, message: impl AsRef<[u8]>) -> crate::Result<()> {
        self.cmd(b"DATA\r\n").await?.assert_code(354)?;
        tokio::time::timeout(self.timeout, async {
            // Write message
            self.write_message(message.as_ref()).await?;
            self.read().await
        })
        .await
        .map_err(|_| crate::Error::Timeout)??
        .assert_positive_completion()
    }

    /// Sends a RSET command to the server.
    pub async fn rset(&mut self) -> crate::Result<()> {
        self.cmd(b"RSET\r\n").await?.assert_positive_completion()
    }

    /// Sends a QUIT command to the server.
    pub async fn quit(mut self) -> crate::Result<()> {
        self.cmd(b"QUIT\r\n").await?.assert_positive_completion()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T, EhloResponse<String>> {
    /// Builds the MAIL FROM parameters supported by this session.
    pub fn mail_params(&self, message: &Message<'_>) -> Parameters<'static> {
        let mut params = Parameters::new();
        if self.capabilities.has_capability(EXT_SIZE) {
            params.param("SIZE", message.body.len().to_string());
        }
        params
    }

    /// Sends a message, failing as soon as the server rejects the sender
    /// or any of the recipients.
    pub async fn send(&mut self, message: &Message<'_>) -> crate::Result<()> {
        message.validate()?;

        let params = self.mail_params(message);
        self.mail_from(&message.mail_from, &params).await?;
        for rcpt in &message.rcpt_to {
            self.rcpt_to(rcpt, &Parameters::default()).await?;
        }
        self.data(&message.body).await
    }

    /// Sends a message to every recipient the server accepts. Returns the
    /// recipients that were refused along with the server's reply; when no
    /// recipient is accepted the transaction is reset and the last refusal
    /// is returned as the error.
    pub async fn send_partial(
        &mut self,
        message: &Message<'_>,
    ) -> crate::Result<Vec<(String, crate::Error)>> {
        message.validate()?;

        let params = self.mail_params(message);
        self.mail_from(&message.mail_from, &params).await?;

        let mut refused = Vec::new();
        for rcpt in &message.rcpt_to {
            match self.rcpt_to(rcpt, &Parameters::default()).await {
                Ok(()) => (),
                Err(err @ crate::Error::UnexpectedReply(_)) => refused.push((rcpt.to_string(), err)),
                Err(err) => return Err(err),
            }
        }

        if refused.len() == message.rcpt_to.len() {
            let _ = self.rset().await;
            return Err(refused
                .pop()
                .map(|(_, err)| err)
                .unwrap_or(crate::Error::MissingRcptTo));
        }

        self.data(&message.body).await?;
        Ok(refused)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use smtp_proto::{EhloResponse, EXT_SIZE};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::{smtp::message::Message, SmtpClient};

    fn client(stream: DuplexStream, capabilities: u32) -> SmtpClient<DuplexStream, EhloResponse<String>> {
        let mut ehlo = EhloResponse::default();
        ehlo.capabilities = capabilities;
        SmtpClient {
            stream,
            timeout: Duration::from_secs(5),
            capabilities: ehlo,
        }
    }

    #[tokio::test]
    async fn send_partial_skips_refused_recipients() {
        let (local, remote) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(remote);
            let mut lines = BufReader::new(reader).lines();
            let mut transcript = Vec::new();
            for reply in [
                "250 ok\r\n",
                "550 5.1.1 no such user\r\n",
                "250 ok\r\n",
                "354 go ahead\r\n",
            ] {
                transcript.push(lines.next_line().await.unwrap().unwrap());
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            loop {
                let line = lines.next_line().await.unwrap().unwrap();
                let done = line == ".";
                transcript.push(line);
                if done {
                    break;
                }
            }
            writer.write_all(b"250 queued\r\n").await.unwrap();
            transcript
        });

        let mut client = client(local, EXT_SIZE);
        let message = Message::new(
            "app@example.com",
            ["nobody@example.org", "jane@example.org"],
            &b"Subject: hi\r\n\r\n.hidden\r\n"[..],
        );
        let refused = client.send_partial(&message).await.unwrap();
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].0, "nobody@example.org");

        assert_eq!(
            server.await.unwrap(),
            [
                "MAIL FROM:<app@example.com> SIZE=24",
                "RCPT TO:<nobody@example.org>",
                "RCPT TO:<jane@example.org>",
                "DATA",
                "Subject: hi",
                "",
                "..hidden",
                ".",
            ]
        );
    }

    #[tokio::test]
    async fn send_partial_all_refused() {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(remote);
            let mut lines = BufReader::new(reader).lines();
            for reply in ["250 ok\r\n", "550 no\r\n", "250 reset\r\n"] {
                lines.next_line().await.unwrap().unwrap();
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            let mut rest = Vec::new();
            let _ = lines.into_inner().read_to_end(&mut rest).await;
        });

        let mut client = client(local, 0);
        let message = Message::new("app@example.com", ["nobody@example.org"], &b"x"[..]);
        match client.send_partial(&message).await {
            Err(crate::Error::UnexpectedReply(reply)) => assert_eq!(reply.code(), 550),
            other => panic!("unexpected result {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn send_requires_envelope() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut client = client(local, 0);
        assert!(matches!(
            client.send(&Message::new("", ["a@b.c"], &b"x"[..])).await,
            Err(crate::Error::MissingMailFrom)
        ));
        assert!(matches!(
            client
                .send(&Message::new("a@b.c", Vec::<&str>::new(), &b"x"[..]))
                .await,
            Err(crate::Error::MissingRcptTo)
        ));
    }

    #[tokio::test]
    async fn envelope_injection_is_not_sent() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut client = client(local, 0);
        let message = Message::new(
            "app@example.com",
            [
                "jane@example.org",
                "jane@example.org>\r\nRCPT TO:<evil@attacker.example",
            ],
            &b"x"[..],
        );
        assert!(matches!(
            client.send_partial(&message).await,
            Err(crate::Error::InvalidAddress(_))
        ));
        assert!(matches!(
            client.send(&message).await,
            Err(crate::Error::InvalidAddress(_))
        ));
        assert!(matches!(
            client
                .rcpt_to("evil@attacker.example>\r\nDATA", &Default::default())
                .await,
            Err(crate::Error::InvalidAddress(_))
        ));
        drop(client);

        let mut written = Vec::new();
        remote.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty(), "{:?}", String::from_utf8_lossy(&written));
    }
}
