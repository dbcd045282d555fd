//! Per-conversation coalescing of batchable events.
//!
//! Each conversation with pending `message.created` payloads owns one bucket
//! and one timer task. The timer removes the bucket and queues a
//! `message.batch` record while holding the bucket lock, so a flush can never
//! race with an append to the same bucket. Before anything is routed, buckets
//! whose deadline has already passed are flushed first; a batch that became
//! due between two immediate events is therefore queued between them even if
//! its timer task has not been polled yet.
//!
//! The emission queue is bounded. Records go into a backlog under the lock
//! and move to the queue in backlog order, without waiting while the lock is
//! held. Whoever produced a record then waits for queue capacity until the
//! backlog is empty, so the read loop slows down to the sink's pace.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cablewatch_core::metrics::BATCHES_FLUSHED_TOTAL;
use cablewatch_core::OutboundEventRecord;
use cablewatch_settings::DebouncePolicy;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::classifier::{ClassifiedEvent, is_batchable};
use crate::config::DebounceConfig;
use crate::emitter::{EmitterHandle, Queued};
use crate::normalize::normalize;

type BucketKey = Option<u64>;

struct Bucket {
    items: Vec<Value>,
    raw_items: Option<Vec<Value>>,
    first_seen_at: Instant,
    deadline: Instant,
    generation: u64,
}

impl Bucket {
    fn into_record(self, conversation_id: BucketKey) -> OutboundEventRecord {
        OutboundEventRecord::batch(conversation_id, self.items, self.raw_items)
    }
}

#[derive(Default)]
struct Buckets {
    open: HashMap<BucketKey, Bucket>,
    next_generation: u64,
    backlog: VecDeque<Queued>,
}

impl Buckets {
    fn push(&mut self, queued: Queued, emitter: &EmitterHandle) {
        self.backlog.push_back(queued);
        self.pump_ready(emitter);
    }

    /// Move backlog records into the queue until it is full.
    fn pump_ready(&mut self, emitter: &EmitterHandle) {
        while let Some(queued) = self.backlog.pop_front() {
            match emitter.try_send(queued) {
                Ok(()) => {}
                Err(TrySendError::Full(queued)) => {
                    self.backlog.push_front(queued);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn flush(&mut self, key: BucketKey, retain: bool, emitter: &EmitterHandle) {
        if let Some(bucket) = self.open.remove(&key) {
            debug!(conversation_id = ?key, items = bucket.items.len(), "flushing batch");
            counter!(BATCHES_FLUSHED_TOTAL).increment(1);
            let record = bucket.into_record(key);
            let queued = if retain {
                Queued::retained(record)
            } else {
                Queued::new(record)
            };
            self.push(queued, emitter);
        }
    }

    fn flush_due(&mut self, now: Instant, emitter: &EmitterHandle) {
        let mut due: Vec<(Instant, BucketKey)> = self
            .open
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(k, b)| (b.deadline, *k))
            .collect();
        due.sort_unstable();
        for (_, key) in due {
            self.flush(key, false, emitter);
        }
    }
}

/// Wait for queue capacity until the backlog is empty or the writer is gone.
async fn drain_backlog(state: &Mutex<Buckets>, emitter: &EmitterHandle) {
    loop {
        if state.lock().backlog.is_empty() {
            return;
        }
        let Some(permit) = emitter.reserve().await else {
            state.lock().backlog.clear();
            return;
        };
        let mut buckets = state.lock();
        let Some(queued) = buckets.backlog.pop_front() else {
            return;
        };
        permit.send(queued);
        buckets.pump_ready(emitter);
    }
}

/// Routes classified events: immediate ones straight to the emitter,
/// batchable ones into per-conversation buckets.
pub struct DebounceEngine {
    config: DebounceConfig,
    include_raw: bool,
    emitter: EmitterHandle,
    state: Arc<Mutex<Buckets>>,
    cancel: CancellationToken,
    timers: JoinSet<()>,
}

impl DebounceEngine {
    /// Create an engine. Timers stop when `cancel` (or a parent) fires.
    pub fn new(
        config: DebounceConfig,
        include_raw: bool,
        emitter: EmitterHandle,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            config,
            include_raw,
            emitter,
            state: Arc::new(Mutex::new(Buckets::default())),
            cancel: cancel.child_token(),
            timers: JoinSet::new(),
        }
    }

    /// Number of conversations with a pending batch.
    pub fn pending(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Route one accepted event.
    ///
    /// Returns once everything it produced is in the emission queue, or
    /// early on cancellation.
    pub async fn route(&mut self, event: ClassifiedEvent) {
        while self.timers.try_join_next().is_some() {}

        self.enqueue(event);

        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = drain_backlog(&self.state, &self.emitter) => {}
        }
    }

    fn enqueue(&mut self, event: ClassifiedEvent) {
        let now = Instant::now();
        let data = normalize(&event.event_name, &event.payload);
        let raw = self.include_raw.then_some(event.payload);
        let key = event.conversation_id;

        let mut state = self.state.lock();
        state.flush_due(now, &self.emitter);

        if !is_batchable(&event.event_name) {
            trace!(event = %event.event_name, conversation_id = ?key, "emitting immediately");
            let record = OutboundEventRecord::event(event.event_name, key, data, raw);
            state.push(Queued::new(record), &self.emitter);
            return;
        }

        if let Some(bucket) = state.open.get_mut(&key) {
            bucket.items.push(data);
            if let (Some(raw_items), Some(raw)) = (bucket.raw_items.as_mut(), raw) {
                raw_items.push(raw);
            }
            if self.config.policy == DebouncePolicy::Sliding {
                let cap = bucket.first_seen_at + self.config.max_wait;
                bucket.deadline = (now + self.config.window).min(cap);
            }
            trace!(conversation_id = ?key, items = bucket.items.len(), "appended to batch");
            return;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let deadline = now + self.config.window;
        let _ = state.open.insert(
            key,
            Bucket {
                items: vec![data],
                raw_items: raw.map(|r| vec![r]),
                first_seen_at: now,
                deadline,
                generation,
            },
        );
        drop(state);

        trace!(conversation_id = ?key, "opened batch");
        let _ = self.timers.spawn(flush_timer(
            Arc::clone(&self.state),
            self.emitter.clone(),
            self.cancel.clone(),
            key,
            generation,
            deadline,
        ));
    }

    /// Stop all timers. Pending batches are flushed oldest-first when
    /// `flush_on_shutdown` is set and dropped otherwise. Flushed batches are
    /// retained through a draining writer.
    pub async fn shutdown(mut self) {
        {
            let mut state = self.state.lock();
            if self.config.flush_on_shutdown {
                let mut keys: Vec<(Instant, BucketKey)> =
                    state.open.iter().map(|(k, b)| (b.first_seen_at, *k)).collect();
                keys.sort_unstable();
                for (_, key) in keys {
                    state.flush(key, true, &self.emitter);
                }
            } else if !state.open.is_empty() {
                debug!(dropped = state.open.len(), "discarding pending batches");
                state.open.clear();
            }
        }
        self.cancel.cancel();
        while self.timers.join_next().await.is_some() {}
        drain_backlog(&self.state, &self.emitter).await;
    }
}

async fn flush_timer(
    state: Arc<Mutex<Buckets>>,
    emitter: EmitterHandle,
    cancel: CancellationToken,
    key: BucketKey,
    generation: u64,
    mut deadline: Instant,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep_until(deadline) => {}
        }

        let extended = {
            let mut buckets = state.lock();
            match buckets.open.get(&key) {
                Some(bucket) if bucket.generation == generation => {
                    if bucket.deadline > Instant::now() {
                        Some(bucket.deadline)
                    } else {
                        buckets.flush(key, false, &emitter);
                        None
                    }
                }
                // flushed on the routing path; a newer bucket has its own timer
                _ => return,
            }
        };
        match extended {
            Some(later) => deadline = later,
            None => break,
        }
    }

    tokio::select! {
        () = cancel.cancelled() => {}
        () = drain_backlog(&state, &emitter) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use crate::emitter::QUEUE_CAPACITY;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::{sleep, timeout};

    fn message(conversation_id: u64, id: u64) -> ClassifiedEvent {
        ClassifiedEvent {
            event_name: "message.created".into(),
            conversation_id: Some(conversation_id),
            message_id: Some(id),
            payload: json!({"id": id, "conversation_id": conversation_id, "content": format!("m{id}"), "message_type": 0}),
        }
    }

    fn status(conversation_id: u64) -> ClassifiedEvent {
        ClassifiedEvent {
            event_name: "conversation.status_changed".into(),
            conversation_id: Some(conversation_id),
            message_id: None,
            payload: json!({"id": conversation_id, "status": "resolved"}),
        }
    }

    fn fixed(window_ms: u64) -> DebounceConfig {
        DebounceConfig {
            window: Duration::from_millis(window_ms),
            ..DebounceConfig::default()
        }
    }

    fn sliding(window_ms: u64, max_wait_ms: u64) -> DebounceConfig {
        DebounceConfig {
            window: Duration::from_millis(window_ms),
            policy: DebouncePolicy::Sliding,
            max_wait: Duration::from_millis(max_wait_ms),
            flush_on_shutdown: false,
        }
    }

    fn engine(config: DebounceConfig, include_raw: bool) -> (DebounceEngine, Receiver<Queued>) {
        let (emitter, rx) = EmitterHandle::channel(QUEUE_CAPACITY);
        let engine = DebounceEngine::new(config, include_raw, emitter, &CancellationToken::new());
        (engine, rx)
    }

    async fn next(rx: &mut Receiver<Queued>) -> OutboundEventRecord {
        rx.recv().await.unwrap().record
    }

    fn item_ids(record: &OutboundEventRecord) -> Vec<u64> {
        let OutboundEventRecord::Batch(batch) = record else {
            panic!("expected batch, got {record:?}");
        };
        batch.items.iter().map(|i| i["id"].as_u64().unwrap()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_same_conversation() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        let start = Instant::now();
        engine.route(message(100, 1)).await;
        engine.route(message(100, 2)).await;
        engine.route(message(100, 3)).await;
        assert_eq!(engine.pending(), 1);

        let record = next(&mut rx).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(record.event_name(), "message.batch");
        assert_eq!(record.conversation_id(), Some(100));
        assert_eq!(item_ids(&record), vec![1, 2, 3]);
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_flush_independently() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        engine.route(message(100, 1)).await;
        sleep(Duration::from_millis(40)).await;
        engine.route(message(200, 2)).await;
        engine.route(message(100, 3)).await;

        let first = next(&mut rx).await;
        assert_eq!(first.conversation_id(), Some(100));
        assert_eq!(item_ids(&first), vec![1, 3]);
        let second = next(&mut rx).await;
        assert_eq!(second.conversation_id(), Some(200));
        assert_eq!(item_ids(&second), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_events_are_not_delayed() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        engine.route(message(100, 1)).await;
        engine.route(status(100)).await;
        let record = rx.try_recv().unwrap().record;
        assert_matches!(record, OutboundEventRecord::Event(ref e) if e.event == "conversation.status_changed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_does_not_extend() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        let start = Instant::now();
        engine.route(message(100, 1)).await;
        sleep(Duration::from_millis(80)).await;
        engine.route(message(100, 2)).await;
        sleep(Duration::from_millis(80)).await;
        engine.route(message(100, 3)).await;

        let first = next(&mut rx).await;
        assert_eq!(item_ids(&first), vec![1, 2]);
        let second = next(&mut rx).await;
        assert_eq!(start.elapsed(), Duration::from_millis(260));
        assert_eq!(item_ids(&second), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_restarts_on_append() {
        let (mut engine, mut rx) = engine(sliding(100, 1000), false);
        let start = Instant::now();
        engine.route(message(100, 1)).await;
        sleep(Duration::from_millis(50)).await;
        engine.route(message(100, 2)).await;

        let record = next(&mut rx).await;
        assert_eq!(start.elapsed(), Duration::from_millis(150));
        assert_eq!(item_ids(&record), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_is_capped_by_max_wait() {
        let (mut engine, mut rx) = engine(sliding(100, 250), false);
        let start = Instant::now();
        engine.route(message(100, 1)).await;
        sleep(Duration::from_millis(80)).await;
        engine.route(message(100, 2)).await;
        sleep(Duration::from_millis(80)).await;
        engine.route(message(100, 3)).await;

        let record = next(&mut rx).await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(item_ids(&record), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn due_batch_precedes_later_immediate_event() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        engine.route(message(100, 1)).await;
        sleep(Duration::from_millis(150)).await;
        engine.route(status(100)).await;

        assert_matches!(next(&mut rx).await, OutboundEventRecord::Batch(_));
        assert_matches!(next(&mut rx).await, OutboundEventRecord::Event(_));
    }

    #[tokio::test(start_paused = true)]
    async fn raw_items_parallel_items() {
        let (mut engine, mut rx) = engine(fixed(100), true);
        engine.route(message(100, 1)).await;
        engine.route(message(100, 2)).await;
        engine.route(status(100)).await;

        let OutboundEventRecord::Event(event) = next(&mut rx).await else {
            panic!("expected immediate event first");
        };
        assert_eq!(event.raw.unwrap()["status"], "resolved");

        let OutboundEventRecord::Batch(batch) = next(&mut rx).await else {
            panic!("expected batch");
        };
        let raw_items = batch.raw_items.unwrap();
        assert_eq!(raw_items.len(), batch.items.len());
        assert_eq!(raw_items[0]["content"], "m1");
        assert_eq!(raw_items[1]["message_type"], 0);
        assert_eq!(batch.items[1]["direction"], "incoming");
    }

    #[tokio::test(start_paused = true)]
    async fn without_raw_records_carry_none() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        engine.route(status(100)).await;
        engine.route(message(100, 1)).await;
        assert_matches!(next(&mut rx).await, OutboundEventRecord::Event(ref e) if e.raw.is_none());
        assert_matches!(next(&mut rx).await, OutboundEventRecord::Batch(ref b) if b.raw_items.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_by_default() {
        let (mut engine, mut rx) = engine(fixed(100), false);
        engine.route(message(100, 1)).await;
        engine.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_oldest_first_when_configured() {
        let config = DebounceConfig {
            flush_on_shutdown: true,
            ..fixed(100)
        };
        let (mut engine, mut rx) = engine(config, false);
        engine.route(message(200, 1)).await;
        sleep(Duration::from_millis(10)).await;
        engine.route(message(100, 2)).await;
        let start = Instant::now();
        engine.shutdown().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        for expected in [200, 100] {
            let queued = rx.recv().await.unwrap();
            assert!(queued.retain);
            assert_eq!(queued.record.conversation_id(), Some(expected));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_timers() {
        let (emitter, mut rx) = EmitterHandle::channel(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let mut engine = DebounceEngine::new(fixed(100), false, emitter, &cancel);
        engine.route(message(100, 1)).await;
        cancel.cancel();
        sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.pending(), 1);
        engine.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn route_waits_for_queue_capacity() {
        let (emitter, mut rx) = EmitterHandle::channel(1);
        let mut engine = DebounceEngine::new(fixed(100), false, emitter, &CancellationToken::new());
        engine.route(status(1)).await;

        let blocked = timeout(Duration::from_millis(10), engine.route(status(2))).await;
        assert!(blocked.is_err());

        let ((), (first, second)) = tokio::join!(engine.route(status(3)), async {
            (next(&mut rx).await, next(&mut rx).await)
        });
        assert_eq!(first.conversation_id(), Some(1));
        assert_eq!(second.conversation_id(), Some(2));
        assert_eq!(next(&mut rx).await.conversation_id(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flush_queues_behind_full_queue() {
        let (emitter, mut rx) = EmitterHandle::channel(1);
        let mut engine = DebounceEngine::new(fixed(100), false, emitter, &CancellationToken::new());
        engine.route(message(100, 1)).await;
        engine.route(status(100)).await;
        sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.pending(), 0);

        assert_matches!(next(&mut rx).await, OutboundEventRecord::Event(_));
        let batch = next(&mut rx).await;
        assert_eq!(item_ids(&batch), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_blocked_route() {
        let (emitter, mut rx) = EmitterHandle::channel(1);
        let cancel = CancellationToken::new();
        let mut engine = DebounceEngine::new(fixed(100), false, emitter, &cancel);
        engine.route(status(1)).await;
        cancel.cancel();

        let released = timeout(Duration::from_millis(10), engine.route(status(2))).await;
        assert!(released.is_ok());
        assert_eq!(next(&mut rx).await.conversation_id(), Some(1));
    }
}
