//! Probe orchestration
//!
//! Runs one probe: build the tagged message, submit it over SMTP,
//! poll IMAP for it, clean it up. Any fatal error ends the run at the
//! stage that failed, so an SMTP failure never opens an IMAP
//! connection.

use crate::config::ProbeConfig;
use crate::error::Result;
use crate::imap::{ImapProbe, PollResult};
use crate::message::ProbeMessage;
use crate::outcome::{ProbeOutcome, ProbeStatus};
use crate::smtp;
use crate::tag::CorrelationTag;
use chrono::Local;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Round-trip delivery prober for one SMTP/IMAP pair.
pub struct Prober {
    config: ProbeConfig,
}

impl Prober {
    /// Validate `config` and build a prober from it.
    pub fn new(config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run a single probe.
    ///
    /// # Errors
    ///
    /// Returns the first transport, protocol or authentication failure
    /// of SMTP submission, IMAP login, SELECT or SEARCH. Not finding the
    /// message is not an error: it is reported as
    /// [`ProbeStatus::TimedOut`]. Cleanup problems are reported as
    /// warnings on the outcome.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProbeOutcome> {
        let cfg = &self.config;

        let started_at = Local::now();
        let tag = CorrelationTag::new(&started_at, &cfg.smtp.subject);
        let message = ProbeMessage::new(&cfg.smtp, &tag, &started_at);
        info!("Starting delivery probe with tag {:?}", tag.as_str());

        let start = Instant::now();
        smtp::submit(&cfg.smtp, cfg.trust, &message).await?;
        let submission = start.elapsed();
        debug!("SMTP submission took {:?}", submission);

        let mut imap = ImapProbe::connect(&cfg.imap, cfg.trust).await?;
        let report = imap.poll_for_tag(&tag, cfg.budget, cancel).await?;
        let elapsed = start.elapsed();

        let status = match report.result {
            PollResult::Found => ProbeStatus::Delivered,
            PollResult::Exhausted => ProbeStatus::TimedOut,
            PollResult::Cancelled => ProbeStatus::Cancelled,
        };

        let cleanup = if report.found.is_empty() {
            None
        } else {
            Some(imap.cleanup(&report.found).await)
        };
        imap.logout().await;

        info!("Probe finished: {:?} after {:?}", status, elapsed);
        Ok(ProbeOutcome {
            status,
            tag: tag.to_string(),
            elapsed,
            submission,
            attempts: report.attempts,
            matched: report.found.to_vec(),
            cleanup,
            smtp_endpoint: cfg.smtp.endpoint.clone(),
            imap_endpoint: cfg.imap.endpoint.clone(),
        })
    }
}
