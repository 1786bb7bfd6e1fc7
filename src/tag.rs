//! Correlation tag
//!
//! The tag is the probe start time at second resolution followed by
//! the configured subject text, e.g.
//! `20240102150405Delivery quality monitoring`. It is both the subject
//! of the probe message and the IMAP search key.

use chrono::{DateTime, TimeZone};
use std::fmt;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// The unique subject a single probe run sends and searches for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationTag(String);

impl CorrelationTag {
    /// Derive the tag from the probe start instant and subject text.
    #[must_use]
    pub fn new<Tz>(start: &DateTime<Tz>, subject: &str) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        Self(format!("{}{subject}", start.format(TIMESTAMP_FORMAT)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
