use std::sync::Arc;

use crate::{
    models::{ExportResult, ExportStatus, SessionUpdate},
    registry::ExportSessionRegistry,
};

/// Handle a producing job holds while it works through its items.
///
/// Cancellation is cooperative: [`ExportJob::advance`] checks the flag before
/// recording the next item and reports `false` once the client has cancelled,
/// at which point the producer is expected to stop.
pub struct ExportJob {
    registry: Arc<ExportSessionRegistry>,
    export_id: String,
    current_item: u64,
}

impl ExportJob {
    pub async fn create(registry: Arc<ExportSessionRegistry>, total_items: u64) -> Self {
        let export_id = registry.create(total_items).await;
        Self::attach(registry, export_id)
    }

    pub fn attach(registry: Arc<ExportSessionRegistry>, export_id: String) -> Self {
        Self {
            registry,
            export_id,
            current_item: 0,
        }
    }

    pub fn export_id(&self) -> &str {
        &self.export_id
    }

    pub async fn start(&self, message: impl Into<String>) -> bool {
        self.registry
            .update(
                &self.export_id,
                SessionUpdate::status(ExportStatus::Processing).with_message(message),
            )
            .await
    }

    /// Records that the next item is done.
    pub async fn advance(&mut self, item_name: impl Into<String>) -> bool {
        if self.is_cancelled().await {
            return false;
        }
        self.current_item += 1;
        self.registry
            .update(
                &self.export_id,
                SessionUpdate::item(self.current_item).with_item_name(item_name),
            )
            .await
    }

    pub async fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.export_id).await
    }

    pub async fn complete(self, result: ExportResult) -> bool {
        self.registry.complete(&self.export_id, result).await
    }

    pub async fn fail(self, error: impl Into<String>) -> bool {
        self.registry.fail(&self.export_id, error).await
    }
}
