//! Process-wide table of export sessions.
//!
//! The producing job drives a session through `create`, `update` and one of
//! `complete`/`fail`; clients may `cancel`. Every applied change is fanned
//! out to push-stream subscribers while the table lock is still held, so each
//! subscriber sees the updates of one export in the order they were applied.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{sync::RwLock, task::JoinHandle, time};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    broadcaster::{Frame, ProgressBroadcaster, Subscription},
    config::Config,
    models::{ExportResult, ExportSession, ExportStatus, SessionUpdate},
};

pub const CANCELLED_MESSAGE: &str = "Export cancelled by user";

type Teardowns = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

pub struct ExportSessionRegistry {
    sessions: RwLock<HashMap<String, ExportSession>>,
    broadcaster: Arc<ProgressBroadcaster>,
    teardowns: Teardowns,
    teardown_grace: Duration,
}

impl ExportSessionRegistry {
    pub fn new(config: &Config) -> Self {
        Self::with_broadcaster(
            Arc::new(ProgressBroadcaster::new(
                config.heartbeat_interval,
                config.subscriber_buffer,
            )),
            config.teardown_grace,
        )
    }

    pub fn with_broadcaster(broadcaster: Arc<ProgressBroadcaster>, teardown_grace: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            broadcaster,
            teardowns: Arc::new(Mutex::new(HashMap::new())),
            teardown_grace,
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub async fn create(&self, total_items: u64) -> String {
        let export_id = Uuid::new_v4().to_string();
        let session = ExportSession::new(export_id.clone(), total_items, Utc::now());
        self.sessions
            .write()
            .await
            .insert(export_id.clone(), session);
        info!(export_id = %export_id, total_items, "Export session created");
        export_id
    }

    pub async fn get(&self, export_id: &str) -> Option<ExportSession> {
        self.sessions.read().await.get(export_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Merges `update` into the session and notifies subscribers. Unknown ids
    /// and sessions that already reached a terminal state are left alone;
    /// the return value tells whether anything was applied.
    pub async fn update(&self, export_id: &str, update: SessionUpdate) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(export_id) else {
            warn!(export_id = %export_id, "Progress update for unknown export session");
            return false;
        };
        if session.status.is_terminal() {
            info!(
                export_id = %export_id,
                status = session.status.as_str(),
                "Skipping progress update: export already finished"
            );
            return false;
        }

        let entering_terminal = update.status.is_some_and(ExportStatus::is_terminal);
        session.apply(update, Utc::now());
        self.broadcaster.publish(session);

        if entering_terminal {
            self.schedule_teardown(export_id);
        }
        true
    }

    pub async fn complete(&self, export_id: &str, result: ExportResult) -> bool {
        let filename = result.filename.clone();
        let size = result.size;
        let applied = self
            .update(
                export_id,
                SessionUpdate {
                    status: Some(ExportStatus::Complete),
                    progress: Some(100),
                    result: Some(result),
                    ..SessionUpdate::default()
                },
            )
            .await;
        if applied {
            info!(export_id = %export_id, filename = %filename, size, "Export session completed");
        }
        applied
    }

    pub async fn fail(&self, export_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let applied = self
            .update(
                export_id,
                SessionUpdate {
                    status: Some(ExportStatus::Error),
                    error: Some(error.clone()),
                    ..SessionUpdate::default()
                },
            )
            .await;
        if applied {
            warn!(export_id = %export_id, error = %error, "Export session failed");
        }
        applied
    }

    /// Requests cooperative cancellation. `false` when the session is unknown
    /// or already finished with `complete`/`error`.
    pub async fn cancel(&self, export_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(export_id) else {
            return false;
        };
        match session.status {
            ExportStatus::Complete | ExportStatus::Error => return false,
            ExportStatus::Cancelled => return true,
            ExportStatus::Pending | ExportStatus::Processing => {}
        }

        session.apply(
            SessionUpdate::status(ExportStatus::Cancelled).with_message(CANCELLED_MESSAGE),
            Utc::now(),
        );
        self.broadcaster.publish(session);
        self.schedule_teardown(export_id);
        info!(export_id = %export_id, "Export session cancelled");
        true
    }

    pub async fn is_cancelled(&self, export_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(export_id)
            .is_some_and(|session| session.status == ExportStatus::Cancelled)
    }

    /// Attaches a push-stream connection whose first frame is the current
    /// snapshot. `None` for unknown ids.
    pub async fn subscribe(&self, export_id: &str) -> Option<Subscription> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(export_id)?;
        let first = Frame::snapshot(session)?;
        Some(self.broadcaster.attach(export_id, first))
    }

    /// Removes every session last updated before `cutoff`, whatever its
    /// status, along with its subscribers and pending teardown.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .values()
            .filter(|session| session.updated_at < cutoff)
            .map(|session| session.export_id.clone())
            .collect();

        for export_id in &stale {
            if let Some(session) = sessions.remove(export_id) {
                info!(
                    export_id = %export_id,
                    status = session.status.as_str(),
                    "Evicting stale export session"
                );
            }
            if let Some(handle) = self.teardowns.lock().remove(export_id) {
                handle.abort();
            }
            self.broadcaster.close(export_id);
        }
        stale
    }

    fn schedule_teardown(&self, export_id: &str) {
        let broadcaster = Arc::clone(&self.broadcaster);
        let teardowns = Arc::clone(&self.teardowns);
        let grace = self.teardown_grace;
        let key = export_id.to_string();

        let handle = tokio::spawn(async move {
            time::sleep(grace).await;
            broadcaster.close(&key);
            teardowns.lock().remove(&key);
        });

        if let Some(previous) = self.teardowns.lock().insert(export_id.to_string(), handle) {
            previous.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, export_id: &str, by: chrono::Duration) {
        if let Some(session) = self.sessions.write().await.get_mut(export_id) {
            session.updated_at -= by;
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_teardowns(&self) -> usize {
        self.teardowns.lock().len()
    }
}

impl Drop for ExportSessionRegistry {
    fn drop(&mut self) {
        for (_, handle) in self.teardowns.lock().drain() {
            handle.abort();
        }
    }
}
