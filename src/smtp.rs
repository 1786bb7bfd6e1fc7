//! SMTP submission driver
//!
//! Drives one strictly sequential SMTP session over a
//! [`mail_send::SmtpClient`]:
//!
//! ```text
//! Connected -> Greeted -> [SecurityUpgraded] -> [Authenticated]
//!   -> EnvelopeSenderSet -> EnvelopeRecipientSet -> DataOpen -> DataSent -> Closed
//! ```
//!
//! The first failing step ends the session with an error naming that
//! step. Nothing is retried. Only the final QUIT is allowed to fail
//! without failing the submission, since by then the server has
//! already accepted the message.

use crate::config::{Endpoint, SecurityMode, SmtpAuth, SmtpConfig, TrustPolicy};
use crate::error::{Error, Result, Stage};
use crate::message::ProbeMessage;
use crate::transport::{self, MailStream};
use mail_send::SmtpClient;
use mail_send::smtp::AssertReply;
use mail_send::smtp::message::Parameters;
use smtp_proto::{AUTH_CRAM_MD5, AUTH_PLAIN, EXT_START_TLS, EhloResponse, Response};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on any single command/reply exchange.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a session is in the submission sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Connected,
    Greeted,
    SecurityUpgraded,
    Authenticated,
    EnvelopeSenderSet,
    EnvelopeRecipientSet,
    DataOpen,
    DataSent,
    Closed,
}

/// One SMTP client session.
pub struct SmtpSession {
    client: SmtpClient<MailStream>,
    endpoint: Endpoint,
    trust: TrustPolicy,
    state: SmtpState,
    capabilities: Option<EhloResponse<String>>,
}

impl SmtpSession {
    /// Connect and read the `220` banner.
    pub async fn connect(config: &SmtpConfig, trust: TrustPolicy) -> Result<Self> {
        let endpoint = config.endpoint.clone();
        let implicit_tls = config.security == SecurityMode::Implicit;
        let stream = transport::open(&endpoint, implicit_tls, trust, Stage::SmtpConnect).await?;

        let mut client = SmtpClient {
            stream,
            timeout: COMMAND_TIMEOUT,
        };
        let banner = tokio::time::timeout(COMMAND_TIMEOUT, client.read())
            .await
            .map_err(|_| Error::transport(Stage::SmtpConnect, &endpoint, "timed out waiting for banner"))?
            .map_err(|e| smtp_error(Stage::SmtpConnect, &endpoint, e))?;
        debug!("SMTP banner from {}: {}", endpoint, describe(&banner));
        banner
            .assert_code(220)
            .map_err(|e| smtp_error(Stage::SmtpConnect, &endpoint, e))?;

        Ok(Self {
            client,
            endpoint,
            trust,
            state: SmtpState::Connected,
            capabilities: None,
        })
    }

    #[must_use]
    pub const fn state(&self) -> SmtpState {
        self.state
    }

    /// Capabilities from the last EHLO, `None` after a HELO fallback.
    #[must_use]
    pub const fn capabilities(&self) -> Option<&EhloResponse<String>> {
        self.capabilities.as_ref()
    }

    /// EHLO, falling back to HELO if the server refuses EHLO.
    pub async fn greet(&mut self, hello_name: &str) -> Result<()> {
        match self.client.ehlo(hello_name).await {
            Ok(capabilities) => self.capabilities = Some(capabilities),
            Err(mail_send::Error::UnexpectedReply(reply)) if (500..600).contains(&reply.code) => {
                debug!("EHLO refused ({}), falling back to HELO", describe(&reply));
                self.client
                    .cmd(format!("HELO {hello_name}\r\n"))
                    .await
                    .and_then(AssertReply::assert_positive_completion)
                    .map_err(|e| smtp_error(Stage::SmtpGreeting, &self.endpoint, e))?;
                self.capabilities = None;
            }
            Err(e) => return Err(smtp_error(Stage::SmtpGreeting, &self.endpoint, e)),
        }

        if self.state == SmtpState::Connected {
            self.advance(SmtpState::Greeted);
        }
        Ok(())
    }

    /// STARTTLS, the TLS handshake, then a fresh EHLO over TLS.
    ///
    /// Any failure here is a transport error; there is no fallback to
    /// continuing in plaintext.
    pub async fn starttls(mut self, hello_name: &str) -> Result<Self> {
        let advertised = self
            .capabilities
            .as_ref()
            .is_some_and(|caps| caps.capabilities & EXT_START_TLS != 0);
        if !advertised {
            return Err(Error::transport(
                Stage::SmtpStartTls,
                &self.endpoint,
                "server does not advertise STARTTLS",
            ));
        }

        self.client
            .cmd(b"STARTTLS\r\n")
            .await
            .and_then(|reply| reply.assert_code(220))
            .map_err(|e| match e {
                mail_send::Error::UnexpectedReply(reply) => Error::transport(
                    Stage::SmtpStartTls,
                    &self.endpoint,
                    format!("server refused STARTTLS: {}", describe(&reply)),
                ),
                other => Error::transport(Stage::SmtpStartTls, &self.endpoint, other),
            })?;

        let SmtpClient { stream, timeout } = self.client;
        let secure = transport::upgrade(stream, &self.endpoint, self.trust, Stage::SmtpStartTls).await?;
        self.client = SmtpClient {
            stream: secure,
            timeout,
        };
        self.advance(SmtpState::SecurityUpgraded);

        self.greet(hello_name).await?;
        Ok(self)
    }

    /// Authenticate with the configured mechanism. `SmtpAuth::None` is a no-op.
    ///
    /// The server must have advertised that mechanism in its EHLO reply.
    pub async fn authenticate(&mut self, auth: &SmtpAuth) -> Result<()> {
        let (mechanism, name, creds) = match auth {
            SmtpAuth::None => return Ok(()),
            SmtpAuth::Plain(creds) => (AUTH_PLAIN, "PLAIN", creds),
            SmtpAuth::CramMd5(creds) => (AUTH_CRAM_MD5, "CRAM-MD5", creds),
        };

        let Some(capabilities) = self
            .capabilities
            .as_mut()
            .filter(|caps| caps.auth_mechanisms & mechanism != 0)
        else {
            return Err(Error::auth(
                Stage::SmtpAuth,
                &self.endpoint,
                format!("server does not advertise AUTH {name}"),
            ));
        };
        // mail-send tries every advertised mechanism it supports; only
        // the configured one may be used.
        capabilities.auth_mechanisms = mechanism;

        let credentials = mail_send::Credentials::new(creds.username.clone(), creds.password.clone());
        debug!("C: AUTH {} <credentials>", name);
        self.client
            .authenticate(&credentials, &*capabilities)
            .await
            .map_err(|e| smtp_error(Stage::SmtpAuth, &self.endpoint, e))?;

        info!("Authenticated to SMTP server {}", self.endpoint);
        self.advance(SmtpState::Authenticated);
        Ok(())
    }

    pub async fn mail_from(&mut self, sender: &str) -> Result<()> {
        self.client
            .mail_from(sender, &Parameters::default())
            .await
            .map_err(|e| smtp_error(Stage::SmtpMailFrom, &self.endpoint, e))?;
        self.advance(SmtpState::EnvelopeSenderSet);
        Ok(())
    }

    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<()> {
        self.client
            .rcpt_to(recipient, &Parameters::default())
            .await
            .map_err(|e| smtp_error(Stage::SmtpRcptTo, &self.endpoint, e))?;
        self.advance(SmtpState::EnvelopeRecipientSet);
        Ok(())
    }

    /// DATA, the dot-stuffed message and the terminating dot, as one step.
    pub async fn data(&mut self, message: &ProbeMessage) -> Result<()> {
        self.advance(SmtpState::DataOpen);
        self.client
            .data(message.to_wire())
            .await
            .map_err(|e| smtp_error(Stage::SmtpData, &self.endpoint, e))?;
        debug!("Message accepted by {}", self.endpoint);
        self.advance(SmtpState::DataSent);
        Ok(())
    }

    /// Send QUIT. Failures are only logged.
    pub async fn quit(self) {
        let Self {
            client,
            endpoint,
            state,
            ..
        } = self;
        if let Err(e) = client.quit().await {
            warn!("{}", smtp_error(Stage::SmtpQuit, &endpoint, e));
        }
        debug!("SMTP {:?} -> {:?}", state, SmtpState::Closed);
    }

    fn advance(&mut self, next: SmtpState) {
        debug!("SMTP {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Submit the probe message. Returns once the server has accepted it.
pub async fn submit(config: &SmtpConfig, trust: TrustPolicy, message: &ProbeMessage) -> Result<()> {
    let mut session = SmtpSession::connect(config, trust).await?;
    session.greet(&config.hello_name).await?;

    if config.security == SecurityMode::StartTls {
        session = session.starttls(&config.hello_name).await?;
    }

    session.authenticate(&config.auth).await?;
    session.mail_from(&config.mail_from).await?;
    session.rcpt_to(&config.rcpt_to).await?;
    session.data(message).await?;
    session.quit().await;

    info!("Probe message submitted to {}", config.endpoint);
    Ok(())
}

/// `code [class.subject.detail] text`, as the server sent it.
fn describe(reply: &Response<String>) -> String {
    match reply.esc {
        [0, _, _] => format!("{} {}", reply.code, reply.message),
        [class, subject, detail] => {
            format!("{} {class}.{subject}.{detail} {}", reply.code, reply.message)
        }
    }
}

/// Replies the server refused with are protocol errors, a refused AUTH
/// is an auth error, and everything else is a transport problem.
fn smtp_error(stage: Stage, endpoint: &Endpoint, err: mail_send::Error) -> Error {
    match err {
        mail_send::Error::UnexpectedReply(reply) => Error::protocol(stage, endpoint, describe(&reply)),
        mail_send::Error::AuthenticationFailed(reply) => Error::auth(stage, endpoint, describe(&reply)),
        mail_send::Error::UnsupportedAuthMechanism => Error::auth(stage, endpoint, err),
        other => Error::transport(stage, endpoint, other),
    }
}
