//! 上传会话模型、状态与分片集合的规范化。

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initialized,
    Uploading,
    Paused,
    Completed,
    Error,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Initialized => "initialized",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
        }
    }
}

/// One resumable upload. Persisted as JSON with `uploadedChunks` as a sorted array.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub session_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub target_path: PathBuf,
    /// Destination relative to the user's storage root, for display.
    pub relative_target: String,
    pub staging_dir: PathBuf,
    #[serde(default, deserialize_with = "deserialize_chunk_set")]
    pub uploaded_chunks: BTreeSet<u64>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `ceil(file_size / chunk_size)`, with an empty file still needing one (empty) chunk.
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size.max(1)).max(1)
}

impl UploadSession {
    /// 丢弃越界的分片索引。
    pub fn normalize(&mut self) {
        let total = self.total_chunks;
        self.uploaded_chunks.retain(|index| *index < total);
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u64 == self.total_chunks
    }

    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|index| !self.uploaded_chunks.contains(index))
            .collect()
    }

    /// Byte length chunk `index` must not exceed.
    pub fn expected_chunk_len(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.file_size - self.chunk_size * (self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.uploaded_chunks.len() as f64 / self.total_chunks as f64 * 100.0
    }

    /// 按已用时间与已收分片数的平均值估算剩余秒数。
    pub fn estimated_seconds_remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        let uploaded = self.uploaded_chunks.len() as u64;
        if uploaded == 0 {
            return None;
        }
        let elapsed_ms = (now - self.created_at).num_milliseconds().max(0) as u64;
        let remaining = self.total_chunks.saturating_sub(uploaded);
        Some((elapsed_ms / uploaded).saturating_mul(remaining) / 1000)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            target_path: self.relative_target.clone(),
            uploaded_chunks: self.uploaded_chunks.iter().copied().collect(),
            status: self.status,
            progress: self.progress(),
            estimated_time_remaining: self.estimated_seconds_remaining(now),
            created_at: self.created_at,
            last_activity: self.last_activity,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
        }
    }
}

/// Read-only view of a session returned to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub target_path: String,
    pub uploaded_chunks: Vec<u64>,
    pub status: UploadStatus,
    pub progress: f64,
    /// Seconds.
    pub estimated_time_remaining: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

fn deserialize_chunk_set<'de, D>(deserializer: D) -> Result<BTreeSet<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    chunk_set_from_value(&value).map_err(D::Error::custom)
}

/// 兼容多种历史形态的分片集合：数组、对象（类数组或 `{索引: true}`）、逗号分隔字符串。
pub fn chunk_set_from_value(value: &Value) -> Result<BTreeSet<u64>, String> {
    match value {
        Value::Null => Ok(BTreeSet::new()),
        Value::Array(items) => Ok(items.iter().filter_map(index_from_value).collect()),
        Value::Object(map) => {
            let mut positions: Vec<usize> =
                map.keys().filter_map(|key| key.parse().ok()).collect();
            positions.sort_unstable();
            let array_like = positions.len() == map.len()
                && positions.iter().enumerate().all(|(i, key)| i == *key)
                && map.values().all(|value| value.as_u64().is_some());
            if array_like {
                Ok(map.values().filter_map(Value::as_u64).collect())
            } else {
                Ok(map
                    .iter()
                    .filter(|(_, flag)| is_truthy(flag))
                    .filter_map(|(key, _)| key.trim().parse::<u64>().ok())
                    .collect())
            }
        }
        Value::String(text) => Ok(text
            .split(',')
            .filter_map(|part| part.trim().parse::<u64>().ok())
            .collect()),
        other => Err(format!("invalid chunk set: {other}")),
    }
}

fn index_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}
