//! Probe configuration
//!
//! A [`ProbeConfig`] is built once (by the CLI or an embedding
//! program), validated, and then only ever read.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Default subject text appended to the correlation timestamp.
pub const DEFAULT_SUBJECT: &str = "Delivery quality monitoring";

/// Default mailbox searched for the probe message.
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A username/password pair. The password never shows up in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How a connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Plaintext for the whole session.
    #[default]
    None,
    /// Plaintext greeting, then upgraded with STARTTLS.
    StartTls,
    /// TLS handshake before any protocol bytes.
    Implicit,
}

/// Which server certificates are trusted.
///
/// The prober is a monitoring tool pointed at servers that frequently
/// carry self-signed certificates, so [`TrustPolicy::AcceptInvalidCerts`]
/// is the default. Use [`TrustPolicy::SystemRoots`] to require a
/// certificate chain valid against the platform root store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Skip certificate and hostname verification entirely.
    #[default]
    AcceptInvalidCerts,
    /// Verify against the platform's native root certificates.
    SystemRoots,
}

/// SMTP authentication, chosen once and never downgraded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SmtpAuth {
    #[default]
    None,
    /// `AUTH PLAIN`
    Plain(Credentials),
    /// `AUTH CRAM-MD5` (RFC 2195)
    CramMd5(Credentials),
}

impl SmtpAuth {
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::None => None,
            Self::Plain(c) | Self::CramMd5(c) => Some(c),
        }
    }
}

/// SMTP submission settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub endpoint: Endpoint,
    pub hello_name: String,
    pub auth: SmtpAuth,
    pub security: SecurityMode,
    pub mail_from: String,
    pub rcpt_to: String,
    pub subject: String,
}

/// IMAP polling settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub security: SecurityMode,
    pub mailbox: String,
}

/// How long the IMAP driver keeps looking for the probe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            interval: Duration::from_secs(1),
        }
    }
}

/// Output verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbosity {
    /// Show submission timing and per-attempt search results.
    pub debug: bool,
    /// Print only the elapsed seconds.
    pub silent: bool,
}

/// Everything a probe run needs.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub smtp: SmtpConfig,
    pub imap: ImapConfig,
    pub trust: TrustPolicy,
    pub budget: PollBudget,
    pub verbosity: Verbosity,
}

impl ProbeConfig {
    /// Check that every required field is present and that nothing
    /// sent on the wire contains a line break or NUL.
    pub fn validate(&self) -> Result<()> {
        require(&self.smtp.endpoint.host, "SMTP server")?;
        require(&self.smtp.hello_name, "SMTP hello name")?;
        require(&self.smtp.mail_from, "message sender address")?;
        require(&self.smtp.rcpt_to, "recipient address")?;
        single_line(&self.smtp.subject, "message subject")?;
        if let Some(creds) = self.smtp.auth.credentials() {
            require(&creds.username, "SMTP username")?;
            require(&creds.password, "SMTP password")?;
        }

        require(&self.imap.endpoint.host, "IMAP server")?;
        require(&self.imap.credentials.username, "IMAP username")?;
        require(&self.imap.credentials.password, "IMAP password")?;
        require(&self.imap.mailbox, "IMAP mailbox")?;

        if self.budget.max_attempts == 0 {
            return Err(Error::Config("poll budget needs at least one attempt".into()));
        }
        Ok(())
    }
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("You must specify {what}")));
    }
    single_line(value, what)
}

/// Values end up inside SMTP/IMAP command lines and message headers.
fn single_line(value: &str, what: &str) -> Result<()> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(Error::Config(format!(
            "{what} must not contain line breaks or NUL"
        )));
    }
    Ok(())
}
