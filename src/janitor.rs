//! 后台清理：回收超过不活跃窗口的上传会话及其暂存目录。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk_store::ChunkStore;
use crate::config::{LOCK_WAIT_TIMEOUT_SECS, UploadConfig};
use crate::error::UploadError;
use crate::locking::SessionLocks;
use crate::session::UploadSession;
use crate::session_store::SessionStore;

pub struct Janitor {
    config: Arc<UploadConfig>,
    sessions: SessionStore,
    chunks: ChunkStore,
    locks: Arc<SessionLocks>,
}

impl Janitor {
    pub fn new(
        config: Arc<UploadConfig>,
        sessions: SessionStore,
        chunks: ChunkStore,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            config,
            sessions,
            chunks,
            locks,
        }
    }

    /// 启动周期清理：首次在启动延迟后执行，之后按固定间隔。
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.config.startup_sweep_delay;
            let mut interval = tokio::time::interval_at(start, self.config.sweep_interval);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// 回收 `lastActivity` 早于 `now - ttl` 的会话，返回回收数量。
    ///
    /// Individual failures are logged and skipped; they never abort the sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        if self.config.session_ttl.is_zero() {
            return 0;
        }
        let sessions = match self.sessions.list_all().await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "upload sweep could not list sessions");
                return 0;
            }
        };

        let mut reaped = 0;
        for session in sessions {
            if !self.is_stale(&session, now) || self.locks.is_finalizing(&session.session_id) {
                continue;
            }
            match self.reap(&session.session_id, now).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        session_id = session.session_id,
                        error = %err,
                        "failed to reap upload session"
                    );
                }
            }
        }
        self.locks.prune().await;

        if reaped > 0 {
            info!(reaped, "upload sweep finished");
        } else {
            debug!("upload sweep found nothing to reap");
        }
        reaped
    }

    fn is_stale(&self, session: &UploadSession, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.config.session_ttl) else {
            return false;
        };
        now - session.last_activity > ttl
    }

    /// 持锁重新读取后再删除，避免与刚到达的分片竞争。
    async fn reap(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool, UploadError> {
        let _guard = self
            .locks
            .lock_with_timeout(session_id, Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS))
            .await?;
        let Some(session) = self.sessions.find(session_id).await? else {
            return Ok(false);
        };
        if !self.is_stale(&session, now) {
            return Ok(false);
        }
        self.chunks
            .remove(&session.staging_dir)
            .await
            .map_err(|err| UploadError::Storage(err.to_string()))?;
        self.sessions.remove(&session).await?;
        info!(
            session_id,
            user_id = session.user_id,
            status = session.status.as_str(),
            "reaped abandoned upload session"
        );
        Ok(true)
    }
}
