//! 按会话 id 的内存锁：串行化同一会话的读改写，并保证合并单飞。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

use crate::error::UploadError;

/// Manages asynchronous mutexes keyed by session id.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    finalizing: StdMutex<HashSet<String>>,
}

impl SessionLocks {
    /// 创建新的锁表实例。
    pub fn new() -> Self {
        Self::default()
    }

    /// 在给定超时时间内获取会话锁，超时返回 `InvalidState`。
    pub async fn lock_with_timeout(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, UploadError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| UploadError::InvalidState("session busy".into()))
    }

    /// 标记会话进入合并；已有合并在进行时返回 `None`。
    pub fn try_begin_finalize(self: &Arc<Self>, session_id: &str) -> Option<FinalizeGuard> {
        let mut finalizing = self
            .finalizing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !finalizing.insert(session_id.to_string()) {
            return None;
        }
        Some(FinalizeGuard {
            locks: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_finalizing(&self, session_id: &str) -> bool {
        self.finalizing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(session_id)
    }

    /// 移除无人持有的锁条目。
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Held for the duration of one assembly; releases the slot on drop.
#[derive(Debug)]
pub struct FinalizeGuard {
    locks: Arc<SessionLocks>,
    session_id: String,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.locks
            .finalizing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.session_id);
    }
}
