//! Per-export fan-out of progress snapshots to push-stream connections.
//!
//! Each connection is a bounded mpsc channel feeding one SSE response, plus a
//! one-frame overflow slot. When the channel is full, the newest snapshot
//! parks in the slot and replaces whatever was parked there; the receiver
//! takes it once the channel is drained. A lagging client therefore skips
//! intermediate snapshots but always ends on the latest one, including the
//! terminal snapshot queued right before a teardown.
//!
//! The broadcaster owns the sending halves together with the connection's
//! heartbeat task, so removing a connection from its set stops the heartbeat
//! and, once buffered frames drain, ends the response.

use std::{
    collections::HashMap,
    future::poll_fn,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::response::sse::Event;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::models::ExportSession;

/// One frame on the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Snapshot(String),
    Heartbeat,
}

impl Frame {
    pub fn snapshot(session: &ExportSession) -> Option<Self> {
        match serde_json::to_string(session) {
            Ok(json) => Some(Self::Snapshot(json)),
            Err(err) => {
                warn!(export_id = %session.export_id, "Failed to serialize snapshot: {err}");
                None
            }
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Self::Snapshot(json) => Event::default().data(json),
            Self::Heartbeat => Event::default().comment("heartbeat"),
        }
    }
}

type LatestSlot = Arc<Mutex<Option<Frame>>>;

struct Connection {
    tx: mpsc::Sender<Frame>,
    latest: LatestSlot,
    heartbeat: JoinHandle<()>,
}

impl Connection {
    /// `false` once the receiving side is gone.
    fn offer(&self, frame: &Frame) -> bool {
        let mut latest = self.latest.lock();
        // Once a frame is parked every newer snapshot must queue behind it.
        if latest.is_some() {
            *latest = Some(frame.clone());
            return true;
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                *latest = Some(frame);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<String, HashMap<u64, Connection>>>,
    next_key: AtomicU64,
    heartbeat_interval: Duration,
    buffer: usize,
}

impl ProgressBroadcaster {
    pub fn new(heartbeat_interval: Duration, buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(0),
            heartbeat_interval,
            buffer: buffer.max(1),
        }
    }

    /// Registers a new connection for `export_id` with `first` already queued
    /// as its opening frame.
    pub fn attach(self: &Arc<Self>, export_id: &str, first: Frame) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        // A fresh channel always has room for one frame.
        let _ = tx.try_send(first);

        let latest: LatestSlot = Arc::new(Mutex::new(None));
        let heartbeat = spawn_heartbeat(tx.clone(), self.heartbeat_interval);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .entry(export_id.to_string())
            .or_default()
            .insert(
                key,
                Connection {
                    tx,
                    latest: Arc::clone(&latest),
                    heartbeat,
                },
            );

        debug!(export_id = %export_id, "Push-stream subscriber attached");

        Subscription {
            rx,
            latest,
            guard: SubscriptionGuard {
                broadcaster: Arc::clone(self),
                export_id: export_id.to_string(),
                key,
            },
        }
    }

    /// Offers `session` to every connection subscribed to it. Connections
    /// whose receiver is gone are dropped from the set.
    pub fn publish(&self, session: &ExportSession) {
        let mut subscribers = self.subscribers.lock();
        let Some(connections) = subscribers.get_mut(&session.export_id) else {
            return;
        };
        let Some(frame) = Frame::snapshot(session) else {
            return;
        };

        connections.retain(|key, connection| {
            let alive = connection.offer(&frame);
            if !alive {
                debug!(export_id = %session.export_id, key, "Subscriber gone, removing");
            }
            alive
        });

        if connections.is_empty() {
            subscribers.remove(&session.export_id);
        }
    }

    /// Ends every connection for `export_id` and forgets the set.
    pub fn close(&self, export_id: &str) -> usize {
        let removed = self.subscribers.lock().remove(export_id);
        let count = removed.as_ref().map(HashMap::len).unwrap_or(0);
        if count > 0 {
            info!(export_id = %export_id, connections = count, "Closing push-stream subscribers");
        }
        count
    }

    pub fn subscriber_count(&self, export_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(export_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.subscribers.lock().values().map(HashMap::len).sum()
    }

    fn detach(&self, export_id: &str, key: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(connections) = subscribers.get_mut(export_id) {
            if connections.remove(&key).is_some() {
                debug!(export_id = %export_id, key, "Push-stream subscriber detached");
            }
            if connections.is_empty() {
                subscribers.remove(export_id);
            }
        }
    }
}

fn spawn_heartbeat(tx: mpsc::Sender<Frame>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            if tx.send(Frame::Heartbeat).await.is_err() {
                break;
            }
        }
    })
}

/// Receiving side of one connection. Dropping it detaches the connection.
pub struct Subscription {
    rx: mpsc::Receiver<Frame>,
    latest: LatestSlot,
    guard: SubscriptionGuard,
}

impl Subscription {
    /// Queued frames first, then the parked snapshot. `None` once the
    /// connection has been closed and everything was delivered.
    pub fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        // Held across the channel poll so a publisher cannot park a newer
        // snapshot between draining the channel and checking the slot.
        let mut latest = self.latest.lock();
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(frame)),
            Poll::Ready(None) => Poll::Ready(latest.take()),
            Poll::Pending => match latest.take() {
                Some(frame) => Poll::Ready(Some(frame)),
                None => Poll::Pending,
            },
        }
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        poll_fn(|cx| self.poll_frame(cx)).await
    }
}

struct SubscriptionGuard {
    broadcaster: Arc<ProgressBroadcaster>,
    export_id: String,
    key: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.detach(&self.export_id, self.key);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::ExportStatus;

    fn broadcaster() -> Arc<ProgressBroadcaster> {
        Arc::new(ProgressBroadcaster::new(Duration::from_secs(30), 8))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let hub = broadcaster();
        let mut first = hub.attach("job", Frame::Heartbeat);
        let mut second = hub.attach("job", Frame::Heartbeat);
        assert_eq!(hub.subscriber_count("job"), 2);

        let mut session = ExportSession::new("job".into(), 2, Utc::now());
        hub.publish(&session);
        session.status = ExportStatus::Processing;
        hub.publish(&session);

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await, Some(Frame::Heartbeat));
            let Some(Frame::Snapshot(a)) = sub.recv().await else {
                panic!("expected snapshot");
            };
            let Some(Frame::Snapshot(b)) = sub.recv().await else {
                panic!("expected snapshot");
            };
            assert!(a.contains("\"pending\""));
            assert!(b.contains("\"processing\""));
        }
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_publish() {
        let hub = broadcaster();
        let mut sub = hub.attach("job", Frame::Heartbeat);
        sub.rx.close();
        hub.publish(&ExportSession::new("job".into(), 1, Utc::now()));
        assert_eq!(hub.subscriber_count("job"), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_latest_snapshot() {
        let hub = broadcaster();
        let mut sub = hub.attach("job", Frame::Heartbeat);

        let mut session = ExportSession::new("job".into(), 100, Utc::now());
        session.status = ExportStatus::Processing;
        for item in 1..=50 {
            session.current_item = item;
            hub.publish(&session);
        }
        session.status = ExportStatus::Complete;
        hub.publish(&session);
        hub.close("job");

        let mut items = Vec::new();
        let mut last = None;
        while let Some(frame) = sub.recv().await {
            if let Frame::Snapshot(json) = frame {
                let snapshot: ExportSession = serde_json::from_str(&json).unwrap();
                items.push(snapshot.current_item);
                last = Some(snapshot);
            }
        }

        // Buffer of 8 holds the opening frame and 7 updates; the slot keeps
        // only the newest.
        assert_eq!(items, vec![1, 2, 3, 4, 5, 6, 7, 50]);
        assert_eq!(last.unwrap().status, ExportStatus::Complete);
    }

    #[tokio::test]
    async fn parked_snapshot_follows_queued_frames() {
        let hub = Arc::new(ProgressBroadcaster::new(Duration::from_secs(30), 2));
        let mut sub = hub.attach("job", Frame::Heartbeat);
        let mut session = ExportSession::new("job".into(), 10, Utc::now());

        session.current_item = 1;
        hub.publish(&session);
        session.current_item = 2;
        hub.publish(&session);

        assert_eq!(sub.recv().await, Some(Frame::Heartbeat));
        // Room again in the channel, yet item 3 replaces the parked item 2
        // instead of overtaking it.
        session.current_item = 3;
        hub.publish(&session);

        let mut items = Vec::new();
        for _ in 0..2 {
            let Some(Frame::Snapshot(json)) = sub.recv().await else {
                panic!("expected snapshot");
            };
            let snapshot: ExportSession = serde_json::from_str(&json).unwrap();
            items.push(snapshot.current_item);
        }
        assert_eq!(items, vec![1, 3]);
    }

    #[tokio::test]
    async fn dropping_subscription_detaches() {
        let hub = broadcaster();
        let sub = hub.attach("job", Frame::Heartbeat);
        assert_eq!(hub.subscriber_count("job"), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count("job"), 0);
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_buffered_frames() {
        let hub = broadcaster();
        let mut sub = hub.attach("job", Frame::Heartbeat);
        hub.publish(&ExportSession::new("job".into(), 1, Utc::now()));
        assert_eq!(hub.close("job"), 1);

        assert_eq!(sub.recv().await, Some(Frame::Heartbeat));
        assert!(matches!(sub.recv().await, Some(Frame::Snapshot(_))));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_each_period() {
        let hub = Arc::new(ProgressBroadcaster::new(Duration::from_secs(30), 8));
        let mut sub = hub.attach("job", Frame::Snapshot("{}".into()));
        assert_eq!(sub.recv().await, Some(Frame::Snapshot("{}".into())));

        let started = Instant::now();
        assert_eq!(sub.recv().await, Some(Frame::Heartbeat));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(sub.recv().await, Some(Frame::Heartbeat));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }
}
