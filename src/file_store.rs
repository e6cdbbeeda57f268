//! 基于文件的键值存储：每个键一个 JSON 文档，原子替换写入。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::atomic::AtomicFile;
use crate::kv::{KeyValueStore, StoreError, pattern_matches};

const RECORD_SUFFIX: &str = ".json";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    key: String,
    value: String,
    expires_at: DateTime<Utc>,
}

impl Record {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// 每个键一把锁：同一键的读改写（过期、覆盖、删除）依次执行。
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    locks: Arc<KeyLocks>,
}

impl FileStore {
    pub async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: Arc::new(KeyLocks::default()),
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{RECORD_SUFFIX}", encode_key(key)))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<Record>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_record(&self, record: &Record) -> Result<(), StoreError> {
        let content = serde_json::to_vec(record)?;
        let mut atomic = AtomicFile::new(&self.record_path(&record.key)).await?;
        if let Err(err) = atomic.file_mut().write_all(&content).await {
            atomic.cleanup().await;
            return Err(err.into());
        }
        atomic.replace().await?;
        Ok(())
    }

    async fn remove_path(path: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 持键锁重新读取，仍已过期才删除；期间被重新写入的记录保持不变。
    async fn remove_if_expired(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.locks.lock(key).await;
        let path = self.record_path(key);
        if let Some(record) = self.read_record(&path).await?
            && !record.is_live(Utc::now())
        {
            Self::remove_path(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.read_record(&self.record_path(key)).await? {
            Some(record) if record.is_live(Utc::now()) => Ok(Some(record.value)),
            Some(_) => {
                self.remove_if_expired(key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let _guard = self.locks.lock(key).await;
        let record = Record {
            key: key.to_string(),
            value,
            expires_at: expiry_from_now(ttl),
        };
        self.write_record(&record).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = {
            let _guard = self.locks.lock(key).await;
            Self::remove_path(&self.record_path(key)).await?
        };
        self.locks.prune().await;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut dir = fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(key) = name.strip_suffix(RECORD_SUFFIX).and_then(decode_key) else {
                continue;
            };
            if !pattern_matches(pattern, &key) {
                continue;
            }
            let path = entry.path();
            let record = match self.read_record(&path).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = ?path, error = %err, "skipping unreadable session record");
                    continue;
                }
            };
            if !record.is_live(now) {
                if let Err(err) = self.remove_if_expired(&key).await {
                    warn!(path = ?path, error = %err, "failed to drop expired record");
                }
                continue;
            }
            if record.key == key {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(key).await;
        let path = self.record_path(key);
        match self.read_record(&path).await? {
            Some(mut record) if record.is_live(Utc::now()) => {
                record.expires_at = expiry_from_now(ttl);
                self.write_record(&record).await?;
                Ok(true)
            }
            Some(_) => {
                Self::remove_path(&path).await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 将键编码为安全的文件名：保留字母数字与 `-_`，其余字节转为 `%XX`。
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'%' {
            let hex = name.get(pos + 1..pos + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            pos += 3;
        } else {
            decoded.push(bytes[pos]);
            pos += 1;
        }
    }
    String::from_utf8(decoded).ok()
}
