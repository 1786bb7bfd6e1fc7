//! Error types for delivery-probe

use crate::config::Endpoint;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The protocol step a failure (or warning) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SmtpConnect,
    SmtpGreeting,
    SmtpStartTls,
    SmtpAuth,
    SmtpMailFrom,
    SmtpRcptTo,
    SmtpData,
    SmtpQuit,
    ImapConnect,
    ImapStartTls,
    ImapLogin,
    ImapSelect,
    ImapSearch,
    ImapStore,
    ImapExpunge,
    ImapLogout,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SmtpConnect => "SMTP connect",
            Self::SmtpGreeting => "SMTP EHLO",
            Self::SmtpStartTls => "SMTP STARTTLS",
            Self::SmtpAuth => "SMTP AUTH",
            Self::SmtpMailFrom => "SMTP MAIL FROM",
            Self::SmtpRcptTo => "SMTP RCPT TO",
            Self::SmtpData => "SMTP DATA",
            Self::SmtpQuit => "SMTP QUIT",
            Self::ImapConnect => "IMAP connect",
            Self::ImapStartTls => "IMAP STARTTLS",
            Self::ImapLogin => "IMAP LOGIN",
            Self::ImapSelect => "IMAP SELECT",
            Self::ImapSearch => "IMAP SEARCH",
            Self::ImapStore => "IMAP STORE",
            Self::ImapExpunge => "IMAP EXPUNGE",
            Self::ImapLogout => "IMAP LOGOUT",
        }
    }

    /// Whether the stage belongs to the SMTP submission phase.
    #[must_use]
    pub const fn is_smtp(self) -> bool {
        matches!(
            self,
            Self::SmtpConnect
                | Self::SmtpGreeting
                | Self::SmtpStartTls
                | Self::SmtpAuth
                | Self::SmtpMailFrom
                | Self::SmtpRcptTo
                | Self::SmtpData
                | Self::SmtpQuit
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{stage} failed ({endpoint}): transport error: {message}")]
    Transport {
        stage: Stage,
        endpoint: Endpoint,
        message: String,
    },

    #[error("{stage} rejected by server ({endpoint}): {message}")]
    Protocol {
        stage: Stage,
        endpoint: Endpoint,
        message: String,
    },

    #[error("{stage} authentication rejected ({endpoint}): {message}")]
    Auth {
        stage: Stage,
        endpoint: Endpoint,
        message: String,
    },

    #[error("message not delivered within {attempts} attempts ({}s)", .elapsed.as_secs())]
    Timeout { attempts: u32, elapsed: Duration },

    #[error("probe cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(stage: Stage, endpoint: &Endpoint, message: impl fmt::Display) -> Self {
        Self::Transport {
            stage,
            endpoint: endpoint.clone(),
            message: message.to_string(),
        }
    }

    pub(crate) fn protocol(stage: Stage, endpoint: &Endpoint, message: impl fmt::Display) -> Self {
        Self::Protocol {
            stage,
            endpoint: endpoint.clone(),
            message: message.to_string(),
        }
    }

    pub(crate) fn auth(stage: Stage, endpoint: &Endpoint, message: impl fmt::Display) -> Self {
        Self::Auth {
            stage,
            endpoint: endpoint.clone(),
            message: message.to_string(),
        }
    }

    /// The stage that failed, for the stage-bearing variants.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Transport { stage, .. } | Self::Protocol { stage, .. } | Self::Auth { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
