//! IMAP poll, search and cleanup driver
//!
//! One [`ImapProbe`] owns one logged-in IMAP session for the whole
//! detection phase: [`ImapProbe::poll_for_tag`] re-selects the mailbox
//! and searches for the correlation tag until something matches or the
//! poll budget is spent, then [`ImapProbe::cleanup`] deletes whatever
//! was found.

use crate::config::{Endpoint, ImapConfig, PollBudget, SecurityMode, TrustPolicy};
use crate::error::{Error, Result, Stage};
use crate::outcome::{CleanupOutcome, CleanupWarning, PollAttempt};
use crate::tag::CorrelationTag;
use crate::transport::{self, MailStream};
use async_imap::Session;
use futures::TryStreamExt;
use std::collections::BTreeSet;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An IMAP session over a plain or TLS stream.
pub type ImapSession = Session<Compat<MailStream>>;

/// UIDs matching the tag, in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResultSet(BTreeSet<u32>);

impl SearchResultSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// The set as an IMAP sequence set, e.g. `3,7,12`.
    #[must_use]
    pub fn to_sequence_set(&self) -> String {
        self.iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Extend<u32> for SearchResultSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl FromIterator<u32> for SearchResultSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Why polling stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Found,
    Exhausted,
    Cancelled,
}

/// Everything the poll loop observed.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub result: PollResult,
    pub found: SearchResultSet,
    pub attempts: Vec<PollAttempt>,
}

/// Quote a string for an IMAP command.
///
/// Quoted strings cannot carry CR or LF; callers pass values that
/// [`ProbeConfig::validate`](crate::ProbeConfig::validate) already checked.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// A logged-in IMAP session used to detect and remove the probe message.
pub struct ImapProbe {
    session: ImapSession,
    endpoint: Endpoint,
    mailbox: String,
}

impl ImapProbe {
    /// Connect, optionally upgrade with STARTTLS, and log in.
    pub async fn connect(config: &ImapConfig, trust: TrustPolicy) -> Result<Self> {
        let endpoint = config.endpoint.clone();
        let implicit_tls = config.security == SecurityMode::Implicit;
        let stream = transport::open(&endpoint, implicit_tls, trust, Stage::ImapConnect).await?;
        let mut client = async_imap::Client::new(stream.compat());

        if config.security == SecurityMode::StartTls {
            client
                .run_command_and_check_ok("STARTTLS", None)
                .await
                .map_err(|e| Error::transport(Stage::ImapStartTls, &endpoint, e))?;

            let plain = client.into_inner().into_inner();
            let secure = transport::upgrade(plain, &endpoint, trust, Stage::ImapStartTls).await?;
            client = async_imap::Client::new(secure.compat());
        }

        let creds = &config.credentials;
        let session = client
            .login(&creds.username, &creds.password)
            .await
            .map_err(|(e, _)| login_error(e, &endpoint))?;

        info!("Logged in to IMAP server {}", endpoint);
        Ok(Self {
            session,
            endpoint,
            mailbox: config.mailbox.clone(),
        })
    }

    /// Search for `tag` until it matches, the budget runs out, or
    /// `cancel` fires.
    ///
    /// Stops at the first attempt that returns any match. After an
    /// empty attempt the loop sleeps one interval, so an exhausted
    /// budget takes about `max_attempts * interval`. SELECT and SEARCH
    /// failures abort polling.
    pub async fn poll_for_tag(
        &mut self,
        tag: &CorrelationTag,
        budget: PollBudget,
        cancel: &CancellationToken,
    ) -> Result<PollReport> {
        let mut found = SearchResultSet::new();
        let mut attempts = Vec::new();

        for attempt in 1..=budget.max_attempts {
            if cancel.is_cancelled() {
                return Ok(PollReport {
                    result: PollResult::Cancelled,
                    found,
                    attempts,
                });
            }

            self.select().await?;
            let batch = self.search(tag).await?;
            debug!("Attempt {}: found messages {:?}", attempt, batch.to_vec());

            attempts.push(PollAttempt {
                attempt,
                matched: batch.to_vec(),
            });
            found.extend(batch.iter());

            if !found.is_empty() {
                info!("Probe message found after {} attempts", attempt);
                return Ok(PollReport {
                    result: PollResult::Found,
                    found,
                    attempts,
                });
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Ok(PollReport {
                        result: PollResult::Cancelled,
                        found,
                        attempts,
                    });
                }
                () = tokio::time::sleep(budget.interval) => {}
            }
        }

        warn!(
            "Probe message not found after {} attempts",
            budget.max_attempts
        );
        Ok(PollReport {
            result: PollResult::Exhausted,
            found,
            attempts,
        })
    }

    /// Flag every UID `\Deleted`, then expunge.
    ///
    /// Never fails: each problem becomes a [`CleanupWarning`]. The
    /// expunge is attempted even when flagging failed.
    pub async fn cleanup(&mut self, uids: &SearchResultSet) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        if uids.is_empty() {
            return outcome;
        }

        match self.store_deleted(uids).await {
            Ok(()) => outcome.flagged = uids.len(),
            Err(e) => {
                warn!("Cleanup: {}", e);
                outcome
                    .warnings
                    .push(CleanupWarning::from_error(Stage::ImapStore, &e));
            }
        }

        match self.expunge().await {
            Ok(count) => outcome.expunged = count,
            Err(e) => {
                warn!("Cleanup: {}", e);
                outcome
                    .warnings
                    .push(CleanupWarning::from_error(Stage::ImapExpunge, &e));
            }
        }

        outcome
    }

    /// LOGOUT. Failures are only logged.
    pub async fn logout(mut self) {
        if let Err(e) = self.session.logout().await {
            warn!(
                "{}",
                imap_error(Stage::ImapLogout, &self.endpoint, e)
            );
        }
    }

    // -- private helpers --

    /// SELECT (read-write, since cleanup expunges).
    async fn select(&mut self) -> Result<()> {
        self.session
            .select(&self.mailbox)
            .await
            .map_err(|e| imap_error(Stage::ImapSelect, &self.endpoint, e))?;
        Ok(())
    }

    async fn search(&mut self, tag: &CorrelationTag) -> Result<SearchResultSet> {
        let query = format!("SUBJECT {}", quote(tag.as_str()));
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| imap_error(Stage::ImapSearch, &self.endpoint, e))?;
        Ok(uids.into_iter().collect())
    }

    async fn store_deleted(&mut self, uids: &SearchResultSet) -> Result<()> {
        let endpoint = &self.endpoint;
        let updates: Vec<_> = self
            .session
            .uid_store(uids.to_sequence_set(), "+FLAGS (\\Deleted)")
            .await
            .map_err(|e| imap_error(Stage::ImapStore, endpoint, e))?
            .try_collect()
            .await
            .map_err(|e| imap_error(Stage::ImapStore, endpoint, e))?;
        debug!("Flagged {} messages as deleted", updates.len());
        Ok(())
    }

    async fn expunge(&mut self) -> Result<usize> {
        let endpoint = &self.endpoint;
        let expunged: Vec<_> = self
            .session
            .expunge()
            .await
            .map_err(|e| imap_error(Stage::ImapExpunge, endpoint, e))?
            .try_collect()
            .await
            .map_err(|e| imap_error(Stage::ImapExpunge, endpoint, e))?;
        debug!("Expunged {} messages", expunged.len());
        Ok(expunged.len())
    }
}

/// Connection-level failures are transport errors, everything else
/// the server said no to is a protocol error.
fn imap_error(stage: Stage, endpoint: &Endpoint, err: async_imap::error::Error) -> Error {
    match err {
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
            Error::transport(stage, endpoint, err)
        }
        other => Error::protocol(stage, endpoint, other),
    }
}

/// A `NO` to LOGIN means the credentials were refused.
fn login_error(err: async_imap::error::Error, endpoint: &Endpoint) -> Error {
    match err {
        async_imap::error::Error::No(msg) => Error::auth(Stage::ImapLogin, endpoint, msg),
        other => imap_error(Stage::ImapLogin, endpoint, other),
    }
}
