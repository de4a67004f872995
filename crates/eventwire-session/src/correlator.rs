//! Ack correlation.
//!
//! Every call registers a pending entry keyed by a fresh correlation id and
//! gets back the receiving half of a oneshot. Replies, deadline timers,
//! cancellation and connection teardown all race to remove the entry; the
//! path that removes it is the only one that sends, so each id sees at most
//! one outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use eventwire_codec::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

/// What a pending call eventually receives.
pub type AckOutcome = std::result::Result<Vec<Value>, SessionError>;

struct PendingAck {
    channel: String,
    timeout: Duration,
    /// Connection instance the request was written on, once it was.
    sent_epoch: Option<u64>,
    tx: oneshot::Sender<AckOutcome>,
    timer: AbortHandle,
}

impl PendingAck {
    fn settle(self, outcome: AckOutcome) {
        self.timer.abort();
        let _ = self.tx.send(outcome);
    }
}

pub struct AckCorrelator {
    next_id: AtomicU64,
    max_pending: usize,
    pending: Mutex<HashMap<u64, PendingAck>>,
}

impl AckCorrelator {
    pub fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            max_pending,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingAck>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids wrap around and skip 0.
    fn allocate_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a pending ack and arm its deadline on the current tokio
    /// runtime. Fails with `NoRuntime` outside one.
    pub fn register(
        self: &Arc<Self>,
        channel: &str,
        timeout: Duration,
    ) -> Result<(u64, oneshot::Receiver<AckOutcome>)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.len() >= self.max_pending {
            warn!(
                pending = pending.len(),
                max_pending = self.max_pending,
                channel,
                "too many pending acks; refusing new call"
            );
            return Err(SessionError::TooManyPending {
                max: self.max_pending,
            });
        }

        let id = self.allocate_id();
        let weak = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.expire(id);
            }
        })
        .abort_handle();

        pending.insert(
            id,
            PendingAck {
                channel: channel.to_string(),
                timeout,
                sent_epoch: None,
                tx,
                timer,
            },
        );
        debug!(
            correlation_id = id,
            channel,
            ?timeout,
            pending = pending.len(),
            "registered pending ack"
        );
        Ok((id, rx))
    }

    /// Deliver a reply. Returns false for unknown, late or duplicate ids and
    /// for replies arriving on a different channel than the request.
    pub fn resolve(&self, id: u64, channel: &str, reply: Vec<Value>) -> bool {
        let entry = {
            let mut pending = self.lock();
            match pending.get(&id) {
                Some(entry) if entry.channel == channel => pending.remove(&id),
                Some(entry) => {
                    warn!(
                        correlation_id = id,
                        expected = %entry.channel,
                        got = channel,
                        "ack reply on the wrong channel; ignoring"
                    );
                    None
                }
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                debug!(correlation_id = id, channel, "ack resolved");
                entry.settle(Ok(reply));
                true
            }
            None => {
                debug!(correlation_id = id, channel, "no pending ack for reply");
                false
            }
        }
    }

    fn expire(&self, id: u64) {
        let entry = self.lock().remove(&id);
        if let Some(entry) = entry {
            let timeout = entry.timeout;
            debug!(correlation_id = id, channel = %entry.channel, ?timeout, "ack timed out");
            let _ = entry.tx.send(Err(SessionError::AckTimeout { id, timeout }));
        }
    }

    /// Cancel a pending call. Idempotent; false if it already completed.
    pub fn cancel(&self, id: u64) -> bool {
        self.fail(id, SessionError::Cancelled(id))
    }

    /// Fail one pending call with `error`.
    pub fn fail(&self, id: u64, error: SessionError) -> bool {
        let entry = self.lock().remove(&id);
        match entry {
            Some(entry) => {
                debug!(correlation_id = id, %error, "ack failed");
                entry.settle(Err(error));
                true
            }
            None => false,
        }
    }

    fn fail_where(
        &self,
        mut select: impl FnMut(&PendingAck) -> bool,
        make_error: impl Fn(u64) -> SessionError,
    ) -> usize {
        let removed: Vec<(u64, PendingAck)> = {
            let mut pending = self.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| select(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = removed.len();
        for (id, entry) in removed {
            entry.settle(Err(make_error(id)));
        }
        count
    }

    /// Fail every call pending on `channel`.
    pub fn fail_channel(&self, channel: &str, make_error: impl Fn(u64) -> SessionError) -> usize {
        self.fail_where(|entry| entry.channel == channel, make_error)
    }

    /// Fail every pending call.
    pub fn fail_all(&self, make_error: impl Fn(u64) -> SessionError) -> usize {
        self.fail_where(|_| true, make_error)
    }

    /// Record that the request for `id` was written on connection instance `epoch`.
    pub fn mark_sent(&self, id: u64, epoch: u64) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.sent_epoch = Some(epoch);
        }
    }

    /// Fail every call whose request was written on instance `epoch`.
    pub fn fail_sent_in(&self, epoch: u64, make_error: impl Fn(u64) -> SessionError) -> usize {
        self.fail_where(|entry| entry.sent_epoch == Some(epoch), make_error)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn pending_on(&self, channel: &str) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.channel == channel)
            .count()
    }

    /// Sorted ids of calls still waiting, for diagnostics.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for AckCorrelator {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}
