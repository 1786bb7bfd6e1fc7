//! Mail delivery round-trip prober
//!
//! Sends a uniquely tagged test message through an SMTP server, then
//! polls an IMAP mailbox until the message shows up and reports how
//! long delivery took. The probe message is deleted afterwards.
//!
//! ```no_run
//! # async fn run(config: delivery_probe::ProbeConfig) -> delivery_probe::Result<()> {
//! use delivery_probe::Prober;
//! use tokio_util::sync::CancellationToken;
//!
//! let prober = Prober::new(config)?;
//! let outcome = prober.run(&CancellationToken::new()).await?;
//! println!("delivered in {}s", outcome.elapsed_secs());
//! # Ok(())
//! # }
//! ```
//!
//! Both connections may be plaintext, upgraded with STARTTLS, or
//! implicit TLS. Certificates are not verified unless
//! [`TrustPolicy::SystemRoots`] is selected.

mod config;
mod error;
mod imap;
mod message;
mod outcome;
mod probe;
mod smtp;
mod tag;
mod transport;

pub use config::{
    Credentials, DEFAULT_MAILBOX, DEFAULT_SUBJECT, Endpoint, ImapConfig, PollBudget, ProbeConfig,
    SecurityMode, SmtpAuth, SmtpConfig, TrustPolicy, Verbosity,
};
pub use error::{Error, Result, Stage};
pub use imap::{ImapProbe, ImapSession, PollReport, PollResult, SearchResultSet};
pub use message::{PROBE_BODY, ProbeMessage};
pub use outcome::{CleanupOutcome, CleanupWarning, PollAttempt, ProbeOutcome, ProbeStatus};
pub use probe::Prober;
pub use smtp::{SmtpSession, SmtpState};
pub use tag::CorrelationTag;
pub use transport::MailStream;
