use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Processing,
    Complete,
    Error,
    Cancelled,
}

impl ExportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Where the finished artifact can be fetched from. Produced by the storage
/// layer, not by this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub url: String,
    pub filename: String,
    pub size: u64,
}

/// Snapshot of one export job. This is also the JSON pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSession {
    pub export_id: String,
    pub status: ExportStatus,
    pub progress: u8,
    pub current_item: u64,
    pub total_items: u64,
    pub current_item_name: Option<String>,
    pub message: Option<String>,
    pub result: Option<ExportResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportSession {
    pub fn new(export_id: String, total_items: u64, now: DateTime<Utc>) -> Self {
        Self {
            export_id,
            status: ExportStatus::Pending,
            progress: 0,
            current_item: 0,
            total_items,
            current_item_name: None,
            message: None,
            result: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Merges the provided fields. `progress` is derived from `current_item`
    /// when the caller did not supply it explicitly. `result` is only kept
    /// on a session that ends up `complete` and `error` only on one that ends
    /// up in `error`; completion always reports full progress.
    pub fn apply(&mut self, update: SessionUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(current_item) = update.current_item {
            self.current_item = current_item;
        }
        match (update.progress, update.current_item) {
            (Some(progress), _) => self.progress = progress.min(100) as u8,
            (None, Some(current_item)) => {
                if let Some(progress) = percent_of(current_item, self.total_items) {
                    self.progress = progress;
                }
            }
            (None, None) => {}
        }
        if update.current_item_name.is_some() {
            self.current_item_name = update.current_item_name;
        }
        if update.message.is_some() {
            self.message = update.message;
        }
        match self.status {
            ExportStatus::Complete => {
                self.progress = 100;
                if update.result.is_some() {
                    self.result = update.result;
                }
            }
            ExportStatus::Error => {
                if update.error.is_some() {
                    self.error = update.error;
                }
            }
            ExportStatus::Pending | ExportStatus::Processing | ExportStatus::Cancelled => {}
        }
        self.updated_at = now;
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }
}

/// `round(100 * current / total)`, clamped to 100. `None` when there is
/// nothing to divide by.
pub fn percent_of(current: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let current = u128::from(current);
    let total = u128::from(total);
    let rounded = (200 * current + total) / (2 * total);
    Some(rounded.min(100) as u8)
}

/// Partial update merged into a session; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub status: Option<ExportStatus>,
    pub progress: Option<u32>,
    pub current_item: Option<u64>,
    pub current_item_name: Option<String>,
    pub message: Option<String>,
    pub result: Option<ExportResult>,
    pub error: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: ExportStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn item(current_item: u64) -> Self {
        Self {
            current_item: Some(current_item),
            ..Self::default()
        }
    }

    pub fn with_item_name(mut self, name: impl Into<String>) -> Self {
        self.current_item_name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub total_items: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub export_id: String,
    pub sse_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStrategyQuery {
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStrategyResponse {
    pub chunked: bool,
    pub threshold_bytes: u64,
    pub chunk_size_bytes: usize,
}
