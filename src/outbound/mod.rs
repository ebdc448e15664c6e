//! Outbound aggregation and delivery.
//!
//! Each destination owns one [`Aggregator`]: a FIFO of [`Fragment`]s that
//! small messages are merged into and large ones are split out of, plus the
//! destination's session. The [`scheduler`] drives one send attempt per tick
//! per destination.

pub mod aggregator;
pub mod scheduler;

use std::time::Duration;

use serde::Serialize;

use crate::config::ConfigError;

pub use aggregator::Aggregator;

/// Reopens a code block at the start of a continued slice.
pub const OPEN_FENCE: &str = "```json\n";

/// Closes the code block at the end of a split slice.
pub const CLOSE_FENCE: &str = "\n```";

/// A unit of queued outbound text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    /// Pending text.
    pub text: String,
    /// Set once a previous slice of this fragment was delivered.
    pub continued: bool,
}

impl Fragment {
    /// A fresh, non-continued fragment.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            continued: false,
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    /// Whether the fragment holds no text.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Size, pacing and retry limits for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationLimits {
    /// Merging stops before a fragment reaches this many characters.
    pub soft_limit: usize,
    /// No single send exceeds this many characters.
    pub hard_limit: usize,
    /// Minimum gap between rate-limited send attempts.
    pub rate_interval: Duration,
    /// Delay before the scheduled re-authentication retry.
    pub auth_retry_delay: Duration,
    /// Ceiling of the exponential failure backoff.
    pub backoff_max: Duration,
}

impl Default for DestinationLimits {
    fn default() -> Self {
        Self {
            soft_limit: 3800,
            hard_limit: 4090,
            rate_interval: Duration::from_secs(1),
            auth_retry_delay: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl DestinationLimits {
    /// Characters a split slice spends on fences in the worst case.
    pub fn fence_overhead() -> usize {
        OPEN_FENCE
            .chars()
            .count()
            .saturating_add(CLOSE_FENCE.chars().count())
    }

    /// Check that the limits can work together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the hard limit cannot fit a
    /// fenced slice, or the soft limit exceeds the hard limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hard_limit <= Self::fence_overhead() {
            return Err(ConfigError::Invalid {
                field: "limits.hard_limit",
                reason: format!(
                    "{} leaves no room for text after {} fence characters",
                    self.hard_limit,
                    Self::fence_overhead()
                ),
            });
        }
        if self.soft_limit == 0 || self.soft_limit > self.hard_limit {
            return Err(ConfigError::Invalid {
                field: "limits.soft_limit",
                reason: format!(
                    "{} must be between 1 and hard_limit ({})",
                    self.soft_limit, self.hard_limit
                ),
            });
        }
        Ok(())
    }
}

/// How a destination counts message length against its limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LengthUnit {
    /// Unicode scalar values.
    #[default]
    Chars,
    /// UTF-16 code units, as Telegram counts them.
    Utf16,
}

impl LengthUnit {
    /// Length of `text` in this unit.
    pub fn measure(self, text: &str) -> usize {
        match self {
            Self::Chars => text.chars().count(),
            Self::Utf16 => text.encode_utf16().count(),
        }
    }

    /// Split `text` after at most `n` units, on a char boundary.
    pub fn split(self, text: &str, n: usize) -> (&str, &str) {
        match self {
            Self::Chars => split_at_char(text, n),
            Self::Utf16 => {
                let mut used = 0_usize;
                for (idx, c) in text.char_indices() {
                    used = used.saturating_add(c.len_utf16());
                    if used > n {
                        return text.split_at(idx);
                    }
                }
                (text, "")
            }
        }
    }
}

/// Split `text` after `n` characters.
pub fn split_at_char(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}
