//! Per-user sequenced event log with bounded observer queues.
//!
//! Each user has one channel holding the last assigned `seq`, a bounded
//! retention log for replay, and the list of live observers. `publish` assigns
//! the next `seq` and fans the event out while holding that user's channel
//! lock, so every observer sees events in `seq` order with no gaps.
//!
//! Producers never wait on observers: each observer queue is bounded and an
//! overflow drops the oldest queued event and marks the observer as needing a
//! full snapshot. Taps are bounded too; a full tap loses the new event and
//! counts it in `tap_events_dropped`.
//!
//! Lock order is always channel then observer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use guard_common::UserId;

use super::events::{StatusEvent, StatusPayload};
use crate::config::BroadcastConfig;

/// What the observer should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(StatusEvent),
    /// Liveness probe; the observer must call `ack_heartbeat`.
    Heartbeat { latest_seq: u64 },
    /// Events were dropped; the observer must fetch a full snapshot and `rebase`.
    ResyncRequired { latest_seq: u64 },
}

/// How a new subscription starts.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeStart {
    /// Everything after the observer's `lastSeenSeq`, in order.
    Replay(Vec<StatusEvent>),
    /// The requested position is unknown or no longer retained.
    SnapshotRequired { latest_seq: u64 },
}

#[derive(Debug)]
struct ObserverQueue {
    items: VecDeque<StatusEvent>,
    capacity: usize,
    /// Events up to and including this seq are already known to the observer.
    baseline: u64,
    latest_seq: u64,
    snapshot_required: bool,
    heartbeat_pending: bool,
    missed_heartbeats: u32,
    closed: bool,
}

#[derive(Debug)]
struct Observer {
    id: u64,
    queue: Mutex<ObserverQueue>,
    notify: Notify,
}

impl Observer {
    /// Enqueue without blocking. Returns true if an older event was dropped.
    fn push(&self, event: StatusEvent) -> bool {
        let mut q = self.queue.lock();
        if q.closed {
            return false;
        }
        q.latest_seq = event.seq;
        let mut dropped = false;
        if q.items.len() >= q.capacity {
            q.items.pop_front();
            q.snapshot_required = true;
            dropped = true;
        }
        q.items.push_back(event);
        drop(q);
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Which events a tap receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapFilter {
    All,
    ModeChanges,
}

impl TapFilter {
    fn accepts(self, event: &StatusEvent) -> bool {
        match self {
            TapFilter::All => true,
            TapFilter::ModeChanges => event.mode_change().is_some(),
        }
    }
}

#[derive(Debug)]
struct Tap {
    tx: mpsc::Sender<StatusEvent>,
    filter: TapFilter,
}

#[derive(Debug, Default)]
struct UserChannel {
    latest_seq: u64,
    log: VecDeque<StatusEvent>,
    observers: Vec<Arc<Observer>>,
}

/// Broadcaster counters.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    pub tap_events_dropped: AtomicU64,
    pub observers_released: AtomicU64,
    pub heartbeats_sent: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    config: BroadcastConfig,
    channels: DashMap<UserId, Arc<Mutex<UserChannel>>>,
    taps: Mutex<Vec<Tap>>,
    next_observer_id: AtomicU64,
    stats: BroadcastStats,
}

impl Inner {
    fn channel(&self, user_id: &UserId) -> Arc<Mutex<UserChannel>> {
        self.channels
            .entry(user_id.clone())
            .or_default()
            .value()
            .clone()
    }
}

/// Sequences committed state changes and fans them out. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    inner: Arc<Inner>,
}

impl StatusBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channels: DashMap::new(),
                taps: Mutex::new(Vec::new()),
                next_observer_id: AtomicU64::new(1),
                stats: BroadcastStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.inner.stats
    }

    /// Receive committed events matching `filter` for every user, in per-user
    /// `seq` order. The queue holds `tap_capacity` events.
    pub fn add_tap(&self, filter: TapFilter) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.tap_capacity.max(1));
        self.inner.taps.lock().push(Tap { tx, filter });
        rx
    }

    fn feed_taps(&self, event: &StatusEvent) {
        let mut dropped = 0u64;
        self.inner.taps.lock().retain(|tap| {
            if !tap.filter.accepts(event) {
                return !tap.tx.is_closed();
            }
            match tap.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if dropped > 0 {
            self.inner
                .stats
                .tap_events_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(
                user_id = %event.user_id,
                seq = event.seq,
                event_type = event.event_type(),
                taps = dropped,
                "Tap queue full, event dropped"
            );
        }
    }

    /// Assign the next `seq` for `user_id` and deliver the event.
    pub fn publish(&self, user_id: &UserId, payload: StatusPayload) -> StatusEvent {
        let channel = self.inner.channel(user_id);
        let mut ch = channel.lock();

        ch.latest_seq += 1;
        let event = StatusEvent {
            user_id: user_id.clone(),
            seq: ch.latest_seq,
            payload,
            emitted_at: Utc::now(),
        };

        ch.log.push_back(event.clone());
        while ch.log.len() > self.inner.config.retention {
            ch.log.pop_front();
        }

        let mut dropped = 0u64;
        for observer in &ch.observers {
            if observer.push(event.clone()) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.inner
                .stats
                .events_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            debug!(user_id = %user_id, seq = event.seq, observers = dropped, "Observer queue overflow");
        }

        self.feed_taps(&event);
        self.inner
            .stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            user_id = %user_id,
            seq = event.seq,
            event_type = event.event_type(),
            observers = ch.observers.len(),
            "Status event published"
        );
        event
    }

    /// Last assigned `seq` for `user_id` (0 if nothing was ever published).
    pub fn latest_seq(&self, user_id: &UserId) -> u64 {
        let channel = self.inner.channels.get(user_id).map(|c| c.value().clone());
        channel.map(|c| c.lock().latest_seq).unwrap_or(0)
    }

    /// Register an observer for `user_id`.
    ///
    /// The observer is attached under the channel lock, so no event can fall
    /// between the replay (or snapshot position) and the live stream.
    pub fn subscribe(&self, user_id: &UserId, last_seen: Option<u64>) -> (Subscription, SubscribeStart) {
        let channel = self.inner.channel(user_id);
        let mut ch = channel.lock();

        let start = match last_seen.and_then(|n| replay_from(&ch, n)) {
            Some(events) => SubscribeStart::Replay(events),
            None => SubscribeStart::SnapshotRequired {
                latest_seq: ch.latest_seq,
            },
        };

        let observer = Arc::new(Observer {
            id: self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(ObserverQueue {
                items: VecDeque::new(),
                capacity: self.inner.config.observer_queue_capacity.max(1),
                baseline: ch.latest_seq,
                latest_seq: ch.latest_seq,
                snapshot_required: false,
                heartbeat_pending: false,
                missed_heartbeats: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        ch.observers.push(Arc::clone(&observer));

        info!(
            user_id = %user_id,
            observer_id = observer.id,
            last_seen = ?last_seen,
            latest_seq = ch.latest_seq,
            replay = matches!(start, SubscribeStart::Replay(_)),
            "Observer subscribed"
        );

        let subscription = Subscription {
            inner: Arc::clone(&self.inner),
            user_id: user_id.clone(),
            observer,
        };
        (subscription, start)
    }

    pub fn observer_count(&self, user_id: &UserId) -> usize {
        let channel = self.inner.channels.get(user_id).map(|c| c.value().clone());
        channel.map(|c| c.lock().observers.len()).unwrap_or(0)
    }

    /// One heartbeat round: probe every observer and release those that
    /// missed `max_missed_heartbeats` in a row. Returns the number released.
    pub fn heartbeat_tick(&self) -> usize {
        let max_missed = self.inner.config.max_missed_heartbeats;
        let mut released = 0usize;

        let channels: Vec<(UserId, Arc<Mutex<UserChannel>>)> = self
            .inner
            .channels
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (user_id, channel) in channels {
            let mut ch = channel.lock();
            ch.observers.retain(|observer| {
                let mut q = observer.queue.lock();
                if q.missed_heartbeats >= max_missed {
                    q.closed = true;
                    drop(q);
                    observer.notify.notify_one();
                    warn!(user_id = %user_id, observer_id = observer.id, "Observer missed heartbeats, released");
                    released += 1;
                    return false;
                }
                q.missed_heartbeats += 1;
                q.heartbeat_pending = true;
                drop(q);
                observer.notify.notify_one();
                true
            });
            let probed = ch.observers.len() as u64;
            self.inner
                .stats
                .heartbeats_sent
                .fetch_add(probed, Ordering::Relaxed);
        }

        if released > 0 {
            self.inner
                .stats
                .observers_released
                .fetch_add(released as u64, Ordering::Relaxed);
        }
        released
    }
}

fn replay_from(ch: &UserChannel, after: u64) -> Option<Vec<StatusEvent>> {
    if after > ch.latest_seq {
        return None;
    }
    if after == ch.latest_seq {
        return Some(Vec::new());
    }
    let oldest = ch.log.front().map(|e| e.seq)?;
    if oldest > after + 1 {
        return None;
    }
    Some(ch.log.iter().filter(|e| e.seq > after).cloned().collect())
}

/// A live observer registration. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    inner: Arc<Inner>,
    user_id: UserId,
    observer: Arc<Observer>,
}

impl Subscription {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn id(&self) -> u64 {
        self.observer.id
    }

    /// Next delivery, or `None` once the observer has been released.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            if let Some(next) = self.try_recv() {
                return Some(next);
            }
            if self.observer.queue.lock().closed {
                return None;
            }
            self.observer.notify.notified().await;
        }
    }

    /// Next delivery if one is ready.
    pub fn try_recv(&self) -> Option<Delivery> {
        let mut q = self.observer.queue.lock();
        if q.snapshot_required {
            q.snapshot_required = false;
            q.items.clear();
            return Some(Delivery::ResyncRequired {
                latest_seq: q.latest_seq,
            });
        }
        while let Some(event) = q.items.pop_front() {
            if event.seq > q.baseline {
                q.baseline = event.seq;
                return Some(Delivery::Event(event));
            }
        }
        if q.heartbeat_pending {
            q.heartbeat_pending = false;
            return Some(Delivery::Heartbeat {
                latest_seq: q.latest_seq,
            });
        }
        None
    }

    /// The observer now holds state as of `seq`; skip anything at or before it.
    pub fn rebase(&self, seq: u64) {
        let mut q = self.observer.queue.lock();
        q.baseline = seq;
        q.items.retain(|e| e.seq > seq);
    }

    pub fn ack_heartbeat(&self) {
        self.observer.queue.lock().missed_heartbeats = 0;
    }

    pub fn is_released(&self) -> bool {
        self.observer.queue.lock().closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.observer.close();
        let channel = self.inner.channels.get(&self.user_id).map(|c| c.value().clone());
        if let Some(channel) = channel {
            channel.lock().observers.retain(|o| o.id != self.observer.id);
        }
        debug!(user_id = %self.user_id, observer_id = self.observer.id, "Observer unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::SessionSummary;

    fn config(retention: usize, capacity: usize) -> BroadcastConfig {
        BroadcastConfig {
            retention,
            observer_queue_capacity: capacity,
            max_missed_heartbeats: 2,
            ..Default::default()
        }
    }

    fn payload(step: u8) -> StatusPayload {
        StatusPayload::SessionChanged(SessionSummary {
            user_id: UserId::new("alice"),
            onboarding_step: step,
            onboarding_completed: step >= 5,
        })
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn test_full_tap_drops_and_counts() {
        let b = StatusBroadcaster::new(BroadcastConfig {
            tap_capacity: 2,
            ..Default::default()
        });
        let mut rx = b.add_tap(TapFilter::All);

        for step in 1..=5 {
            b.publish(&alice(), payload(step));
        }
        assert_eq!(b.latest_seq(&alice()), 5);
        assert_eq!(b.stats().tap_events_dropped.load(Ordering::Relaxed), 3);

        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
        assert!(rx.try_recv().is_err());

        // Space again once drained.
        b.publish(&alice(), payload(1));
        assert_eq!(rx.try_recv().unwrap().seq, 6);
    }

    #[test]
    fn test_mode_tap_skips_other_events() {
        let b = StatusBroadcaster::new(BroadcastConfig {
            tap_capacity: 1,
            ..Default::default()
        });
        let mut rx = b.add_tap(TapFilter::ModeChanges);
        for step in 1..=3 {
            b.publish(&alice(), payload(step));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(b.stats().tap_events_dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_closed_tap_is_removed() {
        let b = StatusBroadcaster::new(BroadcastConfig::default());
        let rx = b.add_tap(TapFilter::All);
        drop(rx);
        b.publish(&alice(), payload(1));
        assert!(b.inner.taps.lock().is_empty());
    }

    #[test]
    fn test_seq_is_per_user_and_gapless() {
        let b = StatusBroadcaster::new(config(10, 10));
        let bob = UserId::new("bob");
        assert_eq!(b.publish(&alice(), payload(1)).seq, 1);
        assert_eq!(b.publish(&alice(), payload(2)).seq, 2);
        assert_eq!(b.publish(&bob, payload(1)).seq, 1);
        assert_eq!(b.latest_seq(&alice()), 2);
        assert_eq!(b.latest_seq(&UserId::new("nobody")), 0);
    }

    #[test]
    fn test_subscribe_replays_retained_events() {
        let b = StatusBroadcaster::new(config(10, 10));
        for step in 1..=4 {
            b.publish(&alice(), payload(step));
        }
        let (_sub, start) = b.subscribe(&alice(), Some(2));
        match start {
            SubscribeStart::Replay(events) => {
                let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
                assert_eq!(seqs, vec![3, 4]);
            }
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_beyond_retention_needs_snapshot() {
        let b = StatusBroadcaster::new(config(3, 10));
        for step in 1..=6 {
            b.publish(&alice(), payload(step % 5));
        }
        // Retained: 4, 5, 6.
        assert!(matches!(b.subscribe(&alice(), Some(3)).1, SubscribeStart::Replay(_)));
        assert_eq!(
            b.subscribe(&alice(), Some(2)).1,
            SubscribeStart::SnapshotRequired { latest_seq: 6 }
        );
        assert_eq!(
            b.subscribe(&alice(), None).1,
            SubscribeStart::SnapshotRequired { latest_seq: 6 }
        );
        // A position from the future (e.g. before a restart) is not trusted.
        assert_eq!(
            b.subscribe(&alice(), Some(99)).1,
            SubscribeStart::SnapshotRequired { latest_seq: 6 }
        );
    }

    #[test]
    fn test_live_events_follow_subscription() {
        let b = StatusBroadcaster::new(config(10, 10));
        b.publish(&alice(), payload(1));
        let (sub, _) = b.subscribe(&alice(), Some(1));
        b.publish(&alice(), payload(2));
        match sub.try_recv() {
            Some(Delivery::Event(e)) => assert_eq!(e.seq, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_and_requests_resync() {
        let b = StatusBroadcaster::new(config(100, 2));
        let (sub, _) = b.subscribe(&alice(), None);
        for step in 1..=5 {
            b.publish(&alice(), payload(step));
        }
        assert_eq!(sub.try_recv(), Some(Delivery::ResyncRequired { latest_seq: 5 }));
        assert!(sub.try_recv().is_none());
        assert!(b.stats().events_dropped.load(Ordering::Relaxed) >= 3);

        // After a snapshot at seq 5, only newer events flow.
        sub.rebase(5);
        b.publish(&alice(), payload(1));
        match sub.try_recv() {
            Some(Delivery::Event(e)) => assert_eq!(e.seq, 6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rebase_skips_covered_events() {
        let b = StatusBroadcaster::new(config(10, 10));
        let (sub, _) = b.subscribe(&alice(), None);
        b.publish(&alice(), payload(1));
        b.publish(&alice(), payload(2));
        sub.rebase(1);
        match sub.try_recv() {
            Some(Delivery::Event(e)) => assert_eq!(e.seq, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missed_heartbeats_release_observer() {
        let b = StatusBroadcaster::new(config(10, 10));
        let (sub, _) = b.subscribe(&alice(), None);

        assert_eq!(b.heartbeat_tick(), 0);
        assert_eq!(sub.try_recv(), Some(Delivery::Heartbeat { latest_seq: 0 }));
        assert_eq!(b.heartbeat_tick(), 0);
        assert_eq!(b.heartbeat_tick(), 1);

        assert!(sub.is_released());
        assert_eq!(b.observer_count(&alice()), 0);
        // Producers are unaffected.
        assert_eq!(b.publish(&alice(), payload(1)).seq, 1);
    }

    #[test]
    fn test_acked_heartbeats_keep_observer() {
        let b = StatusBroadcaster::new(config(10, 10));
        let (sub, _) = b.subscribe(&alice(), None);
        for _ in 0..5 {
            b.heartbeat_tick();
            sub.ack_heartbeat();
        }
        assert!(!sub.is_released());
        assert_eq!(b.observer_count(&alice()), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let b = StatusBroadcaster::new(config(10, 10));
        let (sub, _) = b.subscribe(&alice(), None);
        assert_eq!(b.observer_count(&alice()), 1);
        drop(sub);
        assert_eq!(b.observer_count(&alice()), 0);
    }

    #[tokio::test]
    async fn test_taps_receive_in_order() {
        let b = StatusBroadcaster::new(config(10, 10));
        let mut tap = b.add_tap(TapFilter::All);
        b.publish(&alice(), payload(1));
        b.publish(&alice(), payload(2));
        assert_eq!(tap.recv().await.unwrap().seq, 1);
        assert_eq!(tap.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let b = StatusBroadcaster::new(config(10, 10));
        let (sub, _) = b.subscribe(&alice(), None);
        let producer = b.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            producer.publish(&UserId::new("alice"), payload(3));
        });
        match sub.recv().await {
            Some(Delivery::Event(e)) => assert_eq!(e.seq, 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
