//! Pipeline from a raw notification payload to queued outbound text.
//!
//! Parse, filter on the allow-list, normalize into a [`ChangeEvent`], format
//! once, then render per destination dialect and append to each aggregator.
//! Nothing here sends; delivery belongs to the scheduler.

use std::sync::Arc;

use tracing::debug;

use crate::capture::{CaptureError, ChangeEvent, EventFilter, Notification};
use crate::format::otp::LookupError;
use crate::format::Formatter;
use crate::outbound::Aggregator;

/// Why a payload produced no output.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The payload could not be understood.
    #[error("malformed notification: {0}")]
    Malformed(#[from] CaptureError),

    /// The one-time-code lookup failed.
    #[error("one-time-code lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// What happened to a payload that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Outside the table/database allow-list.
    Filtered {
        /// Table named in the payload.
        table: String,
        /// Database named in the payload.
        database_name: String,
    },
    /// Text was appended to this many destinations.
    Queued {
        /// Number of aggregators that received text.
        routes: usize,
    },
}

/// The shared pipeline, called by every listener.
#[derive(Debug)]
pub struct Relay {
    filter: EventFilter,
    key_field: String,
    formatter: Formatter,
    routes: Vec<Arc<Aggregator>>,
}

impl Relay {
    /// Build a relay delivering to `routes`.
    pub fn new(
        filter: EventFilter,
        key_field: impl Into<String>,
        formatter: Formatter,
        routes: Vec<Arc<Aggregator>>,
    ) -> Self {
        Self {
            filter,
            key_field: key_field.into(),
            formatter,
            routes,
        }
    }

    /// Aggregators text is appended to.
    pub fn routes(&self) -> &[Arc<Aggregator>] {
        &self.routes
    }

    /// Run one payload through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Malformed`] for unparseable or unsupported
    /// payloads, and [`RelayError::Lookup`] when a one-time-code change cannot
    /// be resolved. Nothing is queued in either case.
    pub async fn handle_payload(&self, payload: &str) -> Result<RelayOutcome, RelayError> {
        let notification = Notification::parse(payload)?;
        if !self
            .filter
            .accepts(notification.table(), notification.database())
        {
            return Ok(RelayOutcome::Filtered {
                table: notification.table().to_owned(),
                database_name: notification.database().to_owned(),
            });
        }

        let event = notification.into_event(&self.key_field)?;
        self.handle_event(&event).await
    }

    /// Format an already-accepted event and queue it on every route.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Lookup`] when formatting fails.
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<RelayOutcome, RelayError> {
        let rendered = self.formatter.format(event).await?;

        for aggregator in &self.routes {
            let text = rendered.render(aggregator.dialect());
            aggregator.append(&text).await;
        }

        debug!(
            database = %event.database,
            table = %event.table,
            action = event.action.headline(),
            routes = self.routes.len(),
            "change relayed"
        );
        Ok(RelayOutcome::Queued {
            routes: self.routes.len(),
        })
    }
}
