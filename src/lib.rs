//! tblwatch: relays database row changes to chat destinations.
//!
//! PostgreSQL triggers publish row changes on a `NOTIFY` channel. The
//! [`capture`] listeners pick them up, the [`relay`] pipeline diffs, sanitizes
//! and formats them, and one [`outbound::Aggregator`] per destination batches
//! the text and delivers it on a fixed tick through a [`destinations::Destination`].
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod capture;
pub mod config;
pub mod destinations;
pub mod format;
pub mod logging;
pub mod outbound;
pub mod relay;
