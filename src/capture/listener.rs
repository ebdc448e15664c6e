//! PostgreSQL `LISTEN` loop feeding the relay pipeline.
//!
//! One listener task runs per configured database. Every per-event error is
//! logged and swallowed; only the shutdown signal ends the loop.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DatabaseSettings;
use crate::relay::{Relay, RelayOutcome};

/// Pause before reconnecting after a failed connect.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pause after a receive error before polling again.
const RECV_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Connect to `settings.url` and subscribe to `channel`.
///
/// # Errors
///
/// Returns the sqlx error when the connection or `LISTEN` fails.
pub async fn connect(settings: &DatabaseSettings, channel: &str) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect(&settings.url).await?;
    listener.listen(channel).await?;
    Ok(listener)
}

/// Run one database's listener until shutdown.
pub async fn run_listener(
    settings: DatabaseSettings,
    channel: String,
    relay: Arc<Relay>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let database = settings.name.clone();

    loop {
        let mut listener = match connect(&settings, &channel).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(database = %database, error = %e, "listener connect failed, retrying");
                if wait_or_shutdown(&mut shutdown_rx, CONNECT_RETRY_DELAY).await {
                    break;
                }
                continue;
            }
        };
        info!(database = %database, channel = %channel, "listening for row changes");

        if receive_until_shutdown(&mut listener, &database, &relay, &mut shutdown_rx).await {
            break;
        }
    }

    info!(database = %database, "listener stopped");
}

/// Receive notifications until shutdown. Returns `true` on shutdown.
async fn receive_until_shutdown(
    listener: &mut PgListener,
    database: &str,
    relay: &Relay,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            received = listener.recv() => match received {
                Ok(notification) => {
                    handle_payload(relay, database, notification.payload()).await;
                }
                Err(e) => {
                    error!(database, error = %e, "error receiving notification");
                    if wait_or_shutdown(shutdown_rx, RECV_ERROR_DELAY).await {
                        return true;
                    }
                }
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Push one payload through the relay, logging instead of failing.
pub async fn handle_payload(relay: &Relay, database: &str, payload: &str) {
    match relay.handle_payload(payload).await {
        Ok(RelayOutcome::Filtered { table, database_name }) => {
            debug!(database, table = %table, database_name = %database_name, "notification filtered");
        }
        Ok(RelayOutcome::Queued { routes }) => {
            debug!(database, routes, "change queued");
        }
        Err(e) => {
            warn!(database, error = %e, "dropping notification");
        }
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns `true` on shutdown.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        result = shutdown_rx.changed() => result.is_err() || *shutdown_rx.borrow(),
    }
}
