//! 推送通知的对外接口：文件创建与目录变更事件。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileCreatedEvent {
    pub user_id: String,
    pub name: String,
    /// Path relative to the user's storage root.
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FolderChangedEvent {
    pub user_id: String,
    pub parent_path: String,
}

/// Receives upload events for the push layer. Delivery is fire-and-forget.
#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    async fn file_created(&self, event: FileCreatedEvent) -> Result<(), NotifyError>;

    async fn folder_changed(&self, event: FolderChangedEvent) -> Result<(), NotifyError>;
}

/// 仅写日志的实现，推送层未接入时使用。
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationEmitter for LogNotifier {
    async fn file_created(&self, event: FileCreatedEvent) -> Result<(), NotifyError> {
        info!(
            user_id = event.user_id,
            path = event.path,
            size = event.size,
            "file created"
        );
        Ok(())
    }

    async fn folder_changed(&self, event: FolderChangedEvent) -> Result<(), NotifyError> {
        info!(
            user_id = event.user_id,
            parent_path = event.parent_path,
            "folder changed"
        );
        Ok(())
    }
}
