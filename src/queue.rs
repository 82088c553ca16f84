//! Bounded priority admission queue with a concurrency cap.
//!
//! Items wait in `pending` until [`AdmissionQueue::dequeue`] hands out a slot.
//! Order is computed on demand at dequeue time: lowest priority number
//! first, then earliest enqueue. Re-prioritising a waiting item therefore
//! takes effect at the next dequeue. Low-priority items can starve under
//! sustained urgent load.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::error::DispatchError;

/// Finished requests retained for status queries.
pub const COMPLETED_HISTORY: usize = 100;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Urgency level in `0..=9`; lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(3);
    pub const NORMAL: Priority = Priority(5);
    pub const LOW: Priority = Priority(7);
    pub const BACKGROUND: Priority = Priority(9);
    pub const MAX: u8 = 9;

    /// Any integer, clamped into `0..=9`.
    pub fn clamped(level: i64) -> Self {
        Priority(level.clamp(0, Self::MAX as i64) as u8)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "critical" => Some(Self::CRITICAL),
            "high" => Some(Self::HIGH),
            "normal" => Some(Self::NORMAL),
            "low" => Some(Self::LOW),
            "background" => Some(Self::BACKGROUND),
            _ => None,
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Caller-supplied priority: a named level or an integer.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PriorityInput {
    /// 0 (most urgent) to 9; out-of-range values are clamped.
    Level(i64),
    /// "critical", "high", "normal", "low" or "background".
    Named(String),
}

impl PriorityInput {
    pub fn resolve(&self) -> Result<Priority, DispatchError> {
        match self {
            Self::Level(n) => Ok(Priority::clamped(*n)),
            Self::Named(name) => Priority::from_name(name).ok_or_else(|| {
                DispatchError::Other(format!(
                    "unknown priority '{name}': use critical, high, normal, low, background or 0-9"
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
struct QueueItem<P> {
    id: RequestId,
    payload: Option<P>,
    priority: Priority,
    enqueued_at: Instant,
    /// Tie-break for identical enqueue instants.
    seq: u64,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    attempts: u32,
    status: RequestStatus,
    error: Option<String>,
}

impl<P> QueueItem<P> {
    fn order_key(&self) -> (Priority, Instant, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }

    fn snapshot(&self) -> RequestSnapshot {
        let now = Instant::now();
        let queued_until = self.started_at.or(self.completed_at).unwrap_or(now);
        RequestSnapshot {
            id: self.id,
            priority: self.priority.value(),
            status: self.status,
            attempts: self.attempts,
            queued_ms: ms(queued_until.saturating_duration_since(self.enqueued_at)),
            processing_ms: self.started_at.map(|start| {
                ms(self.completed_at.unwrap_or(now).saturating_duration_since(start))
            }),
            error: self.error.clone(),
            position: None,
            estimated_wait_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub priority: u8,
    pub status: RequestStatus,
    pub attempts: u32,
    pub queued_ms: u64,
    pub processing_ms: Option<u64>,
    pub error: Option<String>,
    /// 0-based place in dequeue order while queued.
    pub position: Option<usize>,
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub peak_size: usize,
    pub avg_processing_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Waiting items in dequeue order.
    pub queued: Vec<RequestSnapshot>,
    pub processing: Vec<RequestSnapshot>,
    /// Most recent first.
    pub recent: Vec<RequestSnapshot>,
    pub stats: QueueStats,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

struct QueueState<P> {
    pending: Vec<QueueItem<P>>,
    processing: HashMap<RequestId, QueueItem<P>>,
    completed: VecDeque<QueueItem<P>>,
    stats: QueueStats,
    next_id: u64,
    next_seq: u64,
}

impl<P> QueueState<P> {
    fn finish(&mut self, mut item: QueueItem<P>, status: RequestStatus, error: Option<String>) {
        item.status = status;
        item.completed_at = Some(Instant::now());
        item.error = error;
        item.payload = None;
        if self.completed.len() >= COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(item);
    }

    fn pending_index(&self, id: RequestId) -> Option<usize> {
        self.pending.iter().position(|i| i.id == id)
    }

    fn sorted_pending(&self) -> Vec<&QueueItem<P>> {
        let mut items: Vec<&QueueItem<P>> = self.pending.iter().collect();
        items.sort_by_key(|i| i.order_key());
        items
    }

    /// Where `id` sits relative to the rest, or a not-queued error.
    fn locate(&self, id: RequestId) -> Result<usize, DispatchError> {
        if let Some(idx) = self.pending_index(id) {
            return Ok(idx);
        }
        if self.processing.contains_key(&id) || self.completed.iter().any(|i| i.id == id) {
            return Err(DispatchError::NotQueued(id));
        }
        Err(DispatchError::RequestNotFound(id))
    }
}

pub struct AdmissionQueue<P> {
    state: Mutex<QueueState<P>>,
    max_concurrent: usize,
    max_queue_size: usize,
    default_priority: Priority,
    processing_timeout: Duration,
}

impl<P> AdmissionQueue<P> {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                processing: HashMap::new(),
                completed: VecDeque::with_capacity(COMPLETED_HISTORY),
                stats: QueueStats::default(),
                next_id: 1,
                next_seq: 0,
            }),
            max_concurrent: config.max_concurrent.max(1),
            max_queue_size: config.max_queue_size.max(1),
            default_priority: Priority::clamped(config.default_priority as i64),
            processing_timeout: config.processing_timeout(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admit `payload`. Fails with `QueueFull` once `max_queue_size` items wait.
    pub fn enqueue(&self, payload: P, priority: Option<Priority>) -> Result<RequestId, DispatchError> {
        let mut state = self.lock();
        let size = state.pending.len();
        if size >= self.max_queue_size {
            tracing::warn!(size, max = self.max_queue_size, "queue full, rejecting request");
            return Err(DispatchError::QueueFull {
                size,
                max: self.max_queue_size,
            });
        }

        let id = RequestId(state.next_id);
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        let priority = priority.unwrap_or(self.default_priority);

        state.pending.push(QueueItem {
            id,
            payload: Some(payload),
            priority,
            enqueued_at: Instant::now(),
            seq,
            started_at: None,
            completed_at: None,
            attempts: 0,
            status: RequestStatus::Queued,
            error: None,
        });
        state.stats.total_enqueued += 1;
        state.stats.peak_size = state.stats.peak_size.max(state.pending.len());

        tracing::debug!(%id, priority = priority.value(), queued = state.pending.len(), "request queued");
        Ok(id)
    }

    /// Claim a concurrency slot for the most urgent waiting item.
    ///
    /// Returns None while all slots are busy or nothing waits.
    pub fn dequeue(&self) -> Option<RequestId> {
        let mut state = self.lock();
        if state.processing.len() >= self.max_concurrent || state.pending.is_empty() {
            return None;
        }

        let idx = state
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| item.order_key())
            .map(|(idx, _)| idx)?;

        let mut item = state.pending.remove(idx);
        item.status = RequestStatus::Processing;
        item.started_at = Some(Instant::now());
        item.attempts += 1;
        let id = item.id;
        state.processing.insert(id, item);
        Some(id)
    }

    /// Run a dequeued item's payload through `processor`, bounded by the
    /// processing timeout. On timeout the processor future is dropped.
    ///
    /// Either way the item leaves the in-flight set and lands in the
    /// completed history; the outcome is returned to the caller.
    pub async fn process_request<T, F, Fut>(
        &self,
        id: RequestId,
        processor: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce(P) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let payload = {
            let mut state = self.lock();
            if state.pending_index(id).is_some() {
                return Err(DispatchError::Other(format!(
                    "request {id} has not been dequeued"
                )));
            }
            let item = state
                .processing
                .get_mut(&id)
                .ok_or(DispatchError::RequestNotFound(id))?;
            item.payload.take().ok_or(DispatchError::NotQueued(id))?
        };

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.processing_timeout, processor(payload)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(%id, timeout_ms = ms(self.processing_timeout), "request timed out");
                Err(DispatchError::Timeout(ms(self.processing_timeout)))
            }
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut state = self.lock();
        if let Some(item) = state.processing.remove(&id) {
            match &outcome {
                Ok(_) => {
                    let stats = &mut state.stats;
                    stats.total_completed += 1;
                    let n = stats.total_completed as f64;
                    stats.avg_processing_ms = (stats.avg_processing_ms * (n - 1.0) + elapsed_ms) / n;
                    state.finish(item, RequestStatus::Completed, None);
                }
                Err(e) => {
                    state.stats.total_failed += 1;
                    state.finish(item, RequestStatus::Failed, Some(e.user_message()));
                }
            }
        }
        outcome
    }

    /// Cancel a waiting item and hand back its payload.
    /// Items already processing or finished cannot be cancelled.
    pub fn cancel(&self, id: RequestId) -> Result<P, DispatchError> {
        let mut state = self.lock();
        let idx = state.locate(id)?;
        let mut item = state.pending.remove(idx);
        let payload = item.payload.take();
        state.stats.total_cancelled += 1;
        state.finish(item, RequestStatus::Cancelled, None);
        tracing::debug!(%id, "request cancelled");
        payload.ok_or(DispatchError::NotQueued(id))
    }

    /// Change a waiting item's priority; applied at the next dequeue.
    pub fn prioritize(&self, id: RequestId, priority: Priority) -> Result<(), DispatchError> {
        let mut state = self.lock();
        let idx = state.locate(id)?;
        state.pending[idx].priority = priority;
        tracing::debug!(%id, priority = priority.value(), "request re-prioritized");
        Ok(())
    }

    /// `ceil(ahead / max(1, free slots)) * avg processing time` for a waiting item.
    pub fn estimate_wait(&self, id: RequestId) -> Result<Duration, DispatchError> {
        let state = self.lock();
        let idx = state.locate(id)?;
        Ok(self.wait_for(&state, &state.pending[idx]))
    }

    fn wait_for(&self, state: &QueueState<P>, item: &QueueItem<P>) -> Duration {
        let key = item.order_key();
        let ahead = state
            .pending
            .iter()
            .filter(|other| other.id != item.id && other.order_key() <= key)
            .count();
        let free = self.max_concurrent.saturating_sub(state.processing.len()).max(1);
        let rounds = ahead.div_ceil(free) as f64;
        Duration::from_secs_f64(rounds * state.stats.avg_processing_ms / 1000.0)
    }

    pub fn status(&self, id: RequestId) -> Result<RequestSnapshot, DispatchError> {
        let state = self.lock();
        if let Some(item) = state.pending.iter().find(|i| i.id == id) {
            let mut snap = item.snapshot();
            snap.position = state.sorted_pending().iter().position(|i| i.id == id);
            snap.estimated_wait_ms = Some(ms(self.wait_for(&state, item)));
            return Ok(snap);
        }
        if let Some(item) = state.processing.get(&id) {
            return Ok(item.snapshot());
        }
        state
            .completed
            .iter()
            .rev()
            .find(|i| i.id == id)
            .map(QueueItem::snapshot)
            .ok_or(DispatchError::RequestNotFound(id))
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        let queued = state
            .sorted_pending()
            .into_iter()
            .enumerate()
            .map(|(pos, item)| {
                let mut snap = item.snapshot();
                snap.position = Some(pos);
                snap.estimated_wait_ms = Some(ms(self.wait_for(&state, item)));
                snap
            })
            .collect();
        let mut processing: Vec<RequestSnapshot> =
            state.processing.values().map(QueueItem::snapshot).collect();
        processing.sort_by_key(|s| s.id);

        QueueSnapshot {
            queued,
            processing,
            recent: state.completed.iter().rev().map(QueueItem::snapshot).collect(),
            stats: state.stats,
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue_size,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Number of waiting items.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn processing_count(&self) -> usize {
        self.lock().processing.len()
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
