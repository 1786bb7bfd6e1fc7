//! Probe results and their text rendering

use crate::config::{Endpoint, Verbosity};
use crate::error::{Error, Result, Stage};
use serde::{Serialize, Serializer};
use std::fmt::Write;
use std::time::Duration;

/// How a probe run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// The probe message was found in the mailbox.
    Delivered,
    /// The poll budget ran out before the message showed up.
    TimedOut,
    /// The cancellation token fired during polling.
    Cancelled,
}

/// Search results of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollAttempt {
    pub attempt: u32,
    pub matched: Vec<u32>,
}

/// A non-fatal problem while deleting the probe message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub stage: Stage,
    pub message: String,
}

impl CleanupWarning {
    pub(crate) fn from_error(stage: Stage, err: &Error) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

/// What the cleanup step managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    /// Messages flagged `\Deleted`.
    pub flagged: usize,
    /// Messages the server reported as expunged.
    pub expunged: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// The single, terminal result of a probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub tag: String,
    /// From just before SMTP submission to the end of polling.
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    /// Time spent on SMTP submission alone.
    #[serde(serialize_with = "as_secs_f64")]
    pub submission: Duration,
    pub attempts: Vec<PollAttempt>,
    pub matched: Vec<u32>,
    pub cleanup: Option<CleanupOutcome>,
    pub smtp_endpoint: Endpoint,
    pub imap_endpoint: Endpoint,
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.status == ProbeStatus::Delivered
    }

    /// Whole seconds elapsed, truncated.
    #[must_use]
    pub const fn elapsed_secs(&self) -> u64 {
        self.elapsed.as_secs()
    }

    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempts.last().map_or(0, |a| a.attempt)
    }

    /// Cleanup warnings, if cleanup ran.
    #[must_use]
    pub fn cleanup_warnings(&self) -> &[CleanupWarning] {
        self.cleanup.as_ref().map_or(&[][..], |c| c.warnings.as_slice())
    }

    /// Turn a non-delivered outcome into the matching error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ProbeStatus::Delivered => Ok(self),
            ProbeStatus::TimedOut => Err(Error::Timeout {
                attempts: self.attempt_count(),
                elapsed: self.elapsed,
            }),
            ProbeStatus::Cancelled => Err(Error::Cancelled {
                attempts: self.attempt_count(),
            }),
        }
    }

    /// Render the text report for stdout.
    #[must_use]
    pub fn report(&self, verbosity: Verbosity) -> String {
        let mut out = String::new();

        if verbosity.debug {
            let _ = writeln!(
                out,
                "Time to send message from SMTP server ({}): {}",
                self.smtp_endpoint.host,
                self.submission.as_secs()
            );
            for attempt in &self.attempts {
                let _ = writeln!(out, "Found messages: {:?}", attempt.matched);
            }
        }

        let secs = self.elapsed_secs();
        if verbosity.silent {
            let _ = writeln!(out, "{secs}");
            return out;
        }

        let host = &self.imap_endpoint.host;
        let _ = match self.status {
            ProbeStatus::Delivered => writeln!(
                out,
                "Time to send and receive message with IMAP ({host}): {secs}"
            ),
            ProbeStatus::TimedOut => writeln!(
                out,
                "Message not delivered via IMAP ({host}) within {} attempts: {secs}",
                self.attempt_count()
            ),
            ProbeStatus::Cancelled => writeln!(
                out,
                "Probe cancelled while polling IMAP ({host}) after {} attempts: {secs}",
                self.attempt_count()
            ),
        };
        out
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_secs_f64<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
