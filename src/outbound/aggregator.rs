//! Per-destination fragment queue with merge-on-append and split-on-send.
//!
//! All state lives behind one FIFO-fair `tokio::sync::Mutex`, and no lock is
//! held across network I/O. A send snapshots the head under the lock,
//! delivers it unlocked, then re-locks to commit. While that send is in
//! flight the head fragment is pinned: `append` skips it, so the commit never
//! overwrites text merged in the meantime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditRecord, AuditSink, AuditStatus, FragmentSummary};
use crate::destinations::{Destination, Session};
use crate::format::Dialect;

use super::{split_at_char, DestinationLimits, Fragment, LengthUnit, CLOSE_FENCE, OPEN_FENCE};

#[derive(Debug, Default)]
struct DestinationState {
    session: Option<Session>,
    queue: VecDeque<Fragment>,
    send_in_progress: bool,
    last_send_at: Option<Instant>,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

/// Text chosen for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPlan {
    /// Exactly what is handed to the destination.
    pub text: String,
    /// Bytes of the head consumed by a partial send; `None` sends it whole.
    pub split_after: Option<usize>,
}

/// Decide what to send for `fragment`, counting length in `unit`.
///
/// Continued fragments are reopened with [`OPEN_FENCE`]. When the result
/// would exceed the hard limit, only a slice is sent and closed with
/// [`CLOSE_FENCE`], sized so the fenced slice still fits the hard limit.
/// A slice never ends inside a backslash escape.
pub fn plan_send(fragment: &Fragment, limits: &DestinationLimits, unit: LengthUnit) -> SendPlan {
    let open = if fragment.continued { OPEN_FENCE } else { "" };
    let open_len = unit.measure(open);

    if open_len.saturating_add(unit.measure(&fragment.text)) <= limits.hard_limit {
        return SendPlan {
            text: format!("{open}{}", fragment.text),
            split_after: None,
        };
    }

    let take = limits
        .hard_limit
        .saturating_sub(open_len)
        .saturating_sub(unit.measure(CLOSE_FENCE))
        .max(1);
    let (mut slice, _) = unit.split(&fragment.text, take);
    if slice.is_empty() {
        slice = split_at_char(&fragment.text, 1).0;
    }
    if ends_with_open_escape(slice) {
        if let Some(shorter) = slice.strip_suffix('\\').filter(|s| !s.is_empty()) {
            slice = shorter;
        }
    }
    SendPlan {
        text: format!("{open}{slice}{CLOSE_FENCE}"),
        split_after: Some(slice.len()),
    }
}

/// Whether `text` ends in an odd run of backslashes.
fn ends_with_open_escape(text: &str) -> bool {
    text.chars().rev().take_while(|&c| c == '\\').count().rem_euclid(2) == 1
}

/// Delay before the next scheduled attempt after `failures` consecutive failures.
///
/// Doubles from the rate interval and is capped at the backoff ceiling.
pub fn backoff_delay(limits: &DestinationLimits, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = failures.saturating_sub(1).min(16);
    limits
        .rate_interval
        .saturating_mul(2_u32.saturating_pow(exponent))
        .min(limits.backoff_max)
}

enum Delivery {
    Delivered,
    /// Nothing was sent, but not because the destination failed.
    Deferred,
    Failed,
}

/// Owns one destination's queue, session and retry timer.
pub struct Aggregator {
    name: String,
    destination: Arc<dyn Destination>,
    limits: DestinationLimits,
    unit: LengthUnit,
    audit: Arc<dyn AuditSink>,
    state: Mutex<DestinationState>,
    auth_retry: std::sync::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Create an aggregator with an empty queue and no session.
    pub fn new(
        destination: Arc<dyn Destination>,
        limits: DestinationLimits,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: destination.name().to_owned(),
            unit: destination.dialect().length_unit(),
            destination,
            limits,
            audit,
            state: Mutex::new(DestinationState::default()),
            auth_retry: std::sync::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Destination name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dialect messages for this destination are rendered in.
    pub fn dialect(&self) -> Dialect {
        self.destination.dialect()
    }

    /// Limits in force.
    pub fn limits(&self) -> &DestinationLimits {
        &self.limits
    }

    /// Queue `text`, merging it into a recent fragment when it fits.
    ///
    /// Fragments are scanned newest first; the first one that stays strictly
    /// under the soft limit receives the text. Otherwise a new fragment is
    /// pushed. The head is skipped while a send of it is in flight.
    pub async fn append(&self, text: &str) {
        if text.is_empty() {
            debug!(destination = %self.name, "ignoring empty append");
            return;
        }
        let added = self.unit.measure(text);

        let queue = {
            let mut state = self.state.lock().await;
            let pinned = usize::from(state.send_in_progress);
            let soft_limit = self.limits.soft_limit;

            let target = state
                .queue
                .iter_mut()
                .skip(pinned)
                .rev()
                .find(|fragment| {
                    self.unit.measure(&fragment.text).saturating_add(added) < soft_limit
                });

            match target {
                Some(fragment) => fragment.text.push_str(text),
                None => state.queue.push_back(Fragment::new(text)),
            }

            summarize(&state.queue)
        };

        debug!(destination = %self.name, fragments = queue.len(), "message appended");
        self.audit(AuditEvent::AppendMessage {
            message: text.to_owned(),
            queue,
        })
        .await;
    }

    /// Attempt to deliver the head fragment once.
    ///
    /// Returns without side effects when a send is already in flight, the
    /// queue is empty, or (with `rate_limited`) the last attempt was less than
    /// the rate interval ago or the destination is backing off after
    /// failures. Returns `true` only when a send happened and succeeded.
    pub async fn try_send_one(self: &Arc<Self>, rate_limited: bool) -> bool {
        let plan = {
            let mut state = self.state.lock().await;
            if state.send_in_progress || state.queue.is_empty() {
                return false;
            }

            if rate_limited {
                let now = Instant::now();
                let too_soon = state
                    .last_send_at
                    .is_some_and(|last| now.duration_since(last) < self.limits.rate_interval);
                if too_soon {
                    return false;
                }
                state.last_send_at = Some(now);

                if state.next_attempt_at.is_some_and(|next| now < next) {
                    debug!(
                        destination = %self.name,
                        failures = state.consecutive_failures,
                        "backing off after failed sends"
                    );
                    return false;
                }
            }

            let Some(head) = state.queue.front() else {
                return false;
            };
            let plan = plan_send(head, &self.limits, self.unit);
            state.send_in_progress = true;
            plan
        };

        let outcome = self.deliver(&plan.text).await;

        let mut state = self.state.lock().await;
        state.send_in_progress = false;
        match outcome {
            Delivery::Delivered => {
                state.consecutive_failures = 0;
                state.next_attempt_at = None;
                match plan.split_after {
                    Some(consumed) => {
                        if let Some(head) = state.queue.front_mut() {
                            let remainder =
                                head.text.get(consumed..).unwrap_or_default().to_owned();
                            head.text = remainder;
                            head.continued = true;
                        }
                    }
                    None => {
                        state.queue.pop_front();
                    }
                }
                true
            }
            Delivery::Deferred => false,
            Delivery::Failed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let delay = backoff_delay(&self.limits, state.consecutive_failures);
                let now = Instant::now();
                state.next_attempt_at = Some(now.checked_add(delay).unwrap_or(now));
                false
            }
        }
    }

    /// Send `text` with the current session. Returns `true` on success.
    ///
    /// Without a session this only attempts to authenticate. An
    /// authorization failure triggers exactly one re-authentication.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> bool {
        matches!(self.deliver(text).await, Delivery::Delivered)
    }

    async fn deliver(self: &Arc<Self>, text: &str) -> Delivery {
        let session = self.state.lock().await.session.clone();
        let Some(session) = session else {
            info!(destination = %self.name, "not authenticated, attempting to login");
            return if self.authenticate().await {
                Delivery::Deferred
            } else {
                Delivery::Failed
            };
        };

        match self.destination.send(&session, text).await {
            Ok(()) => {
                debug!(destination = %self.name, chars = text.chars().count(), "message sent");
                self.audit(AuditEvent::SendMessage {
                    status: AuditStatus::Success,
                    message: text.to_owned(),
                    error: None,
                })
                .await;
                Delivery::Delivered
            }
            Err(e) => {
                warn!(destination = %self.name, error = %e, "send failed");
                self.audit(AuditEvent::SendMessage {
                    status: AuditStatus::Error,
                    message: text.to_owned(),
                    error: Some(e.to_string()),
                })
                .await;

                if e.is_unauthorized() {
                    info!(destination = %self.name, "authorization rejected, re-authenticating");
                    self.state.lock().await.session = None;
                    self.authenticate().await;
                }
                Delivery::Failed
            }
        }
    }

    /// Log in and store the session.
    ///
    /// On failure a single delayed retry is scheduled (if none is pending)
    /// and the caller is not blocked. Returns `true` on success.
    pub async fn authenticate(self: &Arc<Self>) -> bool {
        match self.destination.authenticate().await {
            Ok(session) => {
                self.state.lock().await.session = Some(session);
                info!(destination = %self.name, "login successful");
                self.audit(AuditEvent::Login {
                    status: AuditStatus::Success,
                    error: None,
                })
                .await;
                true
            }
            Err(e) => {
                warn!(destination = %self.name, error = %e, "login failed");
                self.audit(AuditEvent::Login {
                    status: AuditStatus::Error,
                    error: Some(e.to_string()),
                })
                .await;
                self.schedule_auth_retry();
                false
            }
        }
    }

    fn schedule_auth_retry(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut slot) = self.auth_retry.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(destination = %self.name, "re-authentication already scheduled");
            return;
        }

        let delay = self.limits.auth_retry_delay;
        let weak: Weak<Self> = Arc::downgrade(self);
        info!(
            destination = %self.name,
            delay_secs = delay.as_secs(),
            "scheduling re-authentication"
        );
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(aggregator) = weak.upgrade() {
                // Free the slot first so a failure here can schedule the next retry.
                aggregator.release_retry_slot();
                aggregator.authenticate().await;
            }
        }));
    }

    fn release_retry_slot(&self) {
        if let Ok(mut slot) = self.auth_retry.lock() {
            slot.take();
        }
    }

    /// Whether a re-authentication retry is waiting to run.
    #[doc(hidden)]
    pub fn auth_retry_pending(&self) -> bool {
        self.auth_retry
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Whether a session is stored.
    #[doc(hidden)]
    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Snapshot of the queue, head first.
    #[doc(hidden)]
    pub async fn fragments(&self) -> Vec<Fragment> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    /// Consecutive failed send attempts since the last success.
    #[doc(hidden)]
    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Cancel the pending re-authentication and refuse to schedule more.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.auth_retry.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        debug!(destination = %self.name, "aggregator shut down");
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(AuditRecord::now(&self.name, event)).await {
            warn!(destination = %self.name, error = %e, "failed to write audit record");
        }
    }
}

fn summarize(queue: &VecDeque<Fragment>) -> Vec<FragmentSummary> {
    queue
        .iter()
        .map(|fragment| FragmentSummary {
            len: fragment.len(),
            continued: fragment.continued,
        })
        .collect()
}
