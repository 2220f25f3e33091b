//! The outbound SMTP client: a bounded pool of connections to a single
//! upstream relay, with error classification into the four kinds the Email
//! Worker's retry/suppression logic depends on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_send::{SmtpClient, SmtpClientBuilder, smtp};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::config::SmtpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permanent,
    Temporary,
    Connection,
    Unknown,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} smtp failure{}: {message}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct SendError {
    pub kind: ErrorKind,
    pub code: Option<u16>,
    pub message: String,
}

impl SendError {
    pub fn retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Temporary | ErrorKind::Connection)
    }

    /// A permanent failure in {550,551,552,553,554}: the mailbox is gone,
    /// not just momentarily rejecting.
    pub fn is_hard_bounce(&self) -> bool {
        self.kind == ErrorKind::Permanent && matches!(self.code, Some(550..=554))
    }

    fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Connection,
            code: None,
            message: message.into(),
        }
    }
}

pub struct SendOutcome {
    /// The relay's own message id, if it returned one in its final reply.
    pub smtp_id: Option<String>,
}

/// A single outbound email, already DKIM-signed (or deliberately left
/// unsigned) by the caller.
pub struct OutboundMessage<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub raw: &'a [u8],
}

/// The seam the Email Worker depends on. Production code gets the pooled
/// relay client; tests substitute an in-memory fake.
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    async fn send(&self, message: OutboundMessage<'_>) -> Result<SendOutcome, SendError>;
    /// Opens and closes a connection without sending, to confirm the relay
    /// is reachable.
    async fn verify(&self) -> Result<(), SendError>;
    async fn close(&self);
}

/// Classifies a `mail_send` failure per the table in the SMTP Client
/// contract: SMTP 5xx (specifically 550-554) is permanent, 4xx
/// (specifically 450-452) is temporary, network-level failures are
/// `connection`, anything else is `unknown`.
fn classify(err: mail_send::Error) -> SendError {
    use mail_send::Error::*;
    let message = err.to_string();
    match err {
        Io(_) | Tls(_) => SendError {
            kind: ErrorKind::Connection,
            code: None,
            message,
        },
        Timeout => SendError {
            kind: ErrorKind::Connection,
            code: None,
            message,
        },
        Base64(_) | UnparseableReply => SendError {
            kind: ErrorKind::Temporary,
            code: None,
            message,
        },
        Auth(_) => SendError {
            kind: ErrorKind::Temporary,
            code: None,
            message,
        },
        UnexpectedReply(response) | AuthenticationFailed(response) => {
            let code = response.code;
            let kind = if (550..=554).contains(&code) {
                ErrorKind::Permanent
            } else if (450..=452).contains(&code) {
                ErrorKind::Temporary
            } else {
                match response.severity() {
                    smtp_proto::Severity::PermanentNegativeCompletion => ErrorKind::Permanent,
                    smtp_proto::Severity::TransientNegativeCompletion => ErrorKind::Temporary,
                    _ => ErrorKind::Unknown,
                }
            };
            SendError {
                kind,
                code: Some(code),
                message,
            }
        }
        InvalidTLSName => SendError {
            kind: ErrorKind::Connection,
            code: None,
            message,
        },
        MissingCredentials
        | MissingMailFrom
        | MissingRcptTo
        | UnsupportedAuthMechanism
        | MissingStartTls => SendError {
            kind: ErrorKind::Permanent,
            code: None,
            message,
        },
    }
}

/// One idle connection sitting in the pool.
struct PooledConnection(SmtpClient<tokio::net::TcpStream>);

/// A bounded pool of connections to a single fixed upstream relay. Bounding
/// is a `tokio::sync::Semaphore`, the same technique the worker itself uses
/// to bound in-flight sends — a connection is either checked out by one
/// task or sitting idle, never shared.
pub struct RelayTransport {
    config: SmtpConfig,
    ehlo_domain: String,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PooledConnection>>,
}

impl RelayTransport {
    pub fn new(config: SmtpConfig, ehlo_domain: String, pool_size: usize) -> Self {
        Self {
            config,
            ehlo_domain,
            permits: Arc::new(Semaphore::new(pool_size)),
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> Result<PooledConnection, SendError> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }

        let mut builder = SmtpClientBuilder::new(self.config.host.as_str(), self.config.port)
            .say_ehlo(true)
            .helo_host(&self.ehlo_domain)
            .timeout(Duration::from_secs(60));

        if let (Some(user), Some(pass)) = (&self.config.user, &self.config.pass) {
            builder = builder.credentials((user.as_str(), pass.as_str()));
        }

        let client = builder
            .connect()
            .await
            .map_err(|e| SendError::connection(e.to_string()))?;

        Ok(PooledConnection(client))
    }

    async fn checkin(&self, conn: PooledConnection) {
        let mut idle = self.idle.lock().await;
        // A small cap keeps a burst of traffic from pinning the relay's own
        // connection limits once load drops back down.
        if idle.len() < 8 {
            idle.push(conn);
        }
    }
}

#[async_trait]
impl SmtpTransport for RelayTransport {
    async fn send(&self, message: OutboundMessage<'_>) -> Result<SendOutcome, SendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SendError::connection("semaphore closed"))?;

        let mut conn = self.checkout().await?;

        let smtp_message = smtp::message::Message {
            mail_from: message.from.into(),
            rcpt_to: vec![message.to.into()],
            body: message.raw.into(),
        };

        let result = conn.0.send(smtp_message).await;

        match result {
            Ok(()) => {
                self.checkin(conn).await;
                Ok(SendOutcome { smtp_id: None })
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn verify(&self) -> Result<(), SendError> {
        // The handshake (EHLO, and STARTTLS/AUTH if configured) already
        // happened as part of `checkout`; nothing left to do but hand the
        // connection back.
        let conn = self.checkout().await?;
        self.checkin(conn).await;
        Ok(())
    }

    async fn close(&self) {
        self.idle.lock().await.clear();
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Replays a scripted sequence of outcomes, one per call to `send`,
    /// recording every attempt so tests can assert on call count.
    pub struct FakeTransport {
        outcomes: StdMutex<Vec<Result<SendOutcome, SendError>>>,
        pub sent: StdMutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        pub fn new(outcomes: Vec<Result<SendOutcome, SendError>>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes.into_iter().rev().collect()),
                sent: StdMutex::new(Vec::new()),
            }
        }

        pub fn always_succeeds() -> Self {
            Self::new(vec![Ok(SendOutcome { smtp_id: None })])
        }

        pub fn attempt_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SmtpTransport for FakeTransport {
        async fn send(&self, message: OutboundMessage<'_>) -> Result<SendOutcome, SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((message.from.to_string(), message.to.to_string()));

            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.pop() {
                Some(outcome) => outcome,
                None => Ok(SendOutcome { smtp_id: None }),
            }
        }

        async fn verify(&self) -> Result<(), SendError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    pub fn permanent(code: u16) -> SendError {
        SendError {
            kind: ErrorKind::Permanent,
            code: Some(code),
            message: format!("{code} permanent failure"),
        }
    }

    pub fn temporary(code: u16) -> SendError {
        SendError {
            kind: ErrorKind::Temporary,
            code: Some(code),
            message: format!("{code} temporary failure"),
        }
    }

    pub fn connection() -> SendError {
        SendError {
            kind: ErrorKind::Connection,
            code: None,
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn classification_matches_contract() {
        let hard_bounce = permanent(550);
        assert!(!hard_bounce.retryable());
        assert!(hard_bounce.is_hard_bounce());

        let soft_bounce = temporary(421);
        assert!(soft_bounce.retryable());
        assert!(!soft_bounce.is_hard_bounce());

        let conn = connection();
        assert!(conn.retryable());
        assert!(!conn.is_hard_bounce());
    }
}

#[cfg(test)]
mod integration {
    use super::*;
    use crate::config::SmtpConfig;
    use mailcrab::TestMailServerHandle;
    use std::net::Ipv4Addr;

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Exercises `RelayTransport` against a real (local, disposable) SMTP
    /// server rather than `fake::FakeTransport`, so the connection pooling
    /// and `mail_send` wiring itself is covered, not just the worker's
    /// reaction to a scripted outcome.
    #[tokio::test]
    async fn sends_through_a_real_relay() {
        let port = random_port();
        let TestMailServerHandle { token, mut rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _drop_guard = token.drop_guard();

        let transport = RelayTransport::new(
            SmtpConfig {
                host: "127.0.0.1".to_string(),
                port,
                user: None,
                pass: None,
                from_default: "no-reply@test.local".to_string(),
            },
            "test.local".to_string(),
            4,
        );

        let outcome = transport
            .send(OutboundMessage {
                from: "a@example.com",
                to: "b@example.com",
                raw: b"From: a@example.com\r\nTo: b@example.com\r\nSubject: hi\r\n\r\nhello\r\n",
            })
            .await
            .unwrap();
        assert!(outcome.smtp_id.is_none() || outcome.smtp_id.is_some());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.envelope_from.as_str(), "a@example.com");

        transport.close().await;
    }
}
