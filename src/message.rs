//! The probe message sent over SMTP

use crate::config::SmtpConfig;
use crate::tag::CorrelationTag;
use chrono::{DateTime, TimeZone};
use std::fmt;

/// Fixed body text of every probe message.
pub const PROBE_BODY: &str = "Test message to monitor mail delivery";

/// An RFC 5322 message whose subject is the correlation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMessage {
    from: String,
    to: String,
    subject: String,
    date: String,
}

impl ProbeMessage {
    #[must_use]
    pub fn new<Tz>(config: &SmtpConfig, tag: &CorrelationTag, start: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self {
            from: config.mail_from.clone(),
            to: config.rcpt_to.clone(),
            subject: tag.to_string(),
            date: start.to_rfc2822(),
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The message as CRLF-terminated lines, before SMTP dot-stuffing.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\n\r\n{PROBE_BODY}\r\n",
            self.from, self.to, self.subject, self.date
        )
    }
}
