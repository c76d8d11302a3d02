use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::registry::ExportSessionRegistry;

/// Owns the periodic sweep task; dropping the handle stops it.
pub struct ReaperHandle {
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_reaper(
    registry: Arc<ExportSessionRegistry>,
    period: Duration,
    timeout: Duration,
) -> ReaperHandle {
    let task = tokio::spawn(async move {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            sweep(&registry, timeout).await;
        }
    });
    ReaperHandle { task }
}

/// Evicts every session idle for longer than `timeout`, regardless of status.
pub async fn sweep(registry: &ExportSessionRegistry, timeout: Duration) -> usize {
    let timeout = match chrono::Duration::from_std(timeout) {
        Ok(timeout) => timeout,
        Err(err) => {
            warn!("Session timeout out of range, skipping sweep: {err}");
            return 0;
        }
    };
    let evicted = registry.evict_older_than(Utc::now() - timeout).await;
    if !evicted.is_empty() {
        info!(count = evicted.len(), "Reaped stale export sessions");
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn sweep_removes_sessions_past_timeout() {
        let registry = ExportSessionRegistry::new(&Config::default());
        let abandoned = registry.create(5).await;
        let recent = registry.create(5).await;
        registry
            .backdate(&abandoned, chrono::Duration::minutes(40))
            .await;
        registry.backdate(&recent, chrono::Duration::minutes(10)).await;

        assert_eq!(sweep(&registry, Duration::from_secs(30 * 60)).await, 1);
        assert!(registry.get(&abandoned).await.is_none());
        assert!(registry.get(&recent).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_sweeps_on_each_period() {
        let registry = Arc::new(ExportSessionRegistry::new(&Config::default()));
        let id = registry.create(1).await;
        registry.backdate(&id, chrono::Duration::hours(1)).await;

        let reaper = spawn_reaper(
            Arc::clone(&registry),
            Duration::from_secs(300),
            Duration::from_secs(1800),
        );
        assert!(registry.get(&id).await.is_some());

        time::sleep(Duration::from_secs(301)).await;
        assert!(registry.get(&id).await.is_none());
        reaper.stop();
    }
}
