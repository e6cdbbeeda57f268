//! 按索引升序合并分片为最终文件，校验大小并清理暂存区。

use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::chunk_store::ChunkStore;
use crate::config::{LOCK_WAIT_TIMEOUT_SECS, MAX_PLACEMENT_ATTEMPTS};
use crate::error::UploadError;
use crate::locking::SessionLocks;
use crate::notify::{FileCreatedEvent, FolderChangedEvent, NotificationEmitter};
use crate::session::{UploadSession, UploadStatus};
use crate::session_store::SessionStore;
use crate::storage::{Storage, unique_target};

/// Turns a complete chunk set into the destination file.
///
/// Assembly is sequential per session: chunks are appended strictly in
/// ascending index order regardless of arrival order.
pub struct Assembler {
    storage: Arc<Storage>,
    sessions: SessionStore,
    chunks: ChunkStore,
    locks: Arc<SessionLocks>,
    notifier: Arc<dyn NotificationEmitter>,
}

impl Assembler {
    pub fn new(
        storage: Arc<Storage>,
        sessions: SessionStore,
        chunks: ChunkStore,
        locks: Arc<SessionLocks>,
        notifier: Arc<dyn NotificationEmitter>,
    ) -> Self {
        Self {
            storage,
            sessions,
            chunks,
            locks,
            notifier,
        }
    }

    /// 合并并收尾。成功时删除会话记录；失败时会话标记为 `error`。两种情况下暂存目录都会被删除。
    ///
    /// 清理暂存目录与改写记录在会话锁内完成：之后拿到锁的分片写入会看到最终状态，
    /// 并撤销它重建的暂存目录。
    pub async fn finalize(&self, mut session: UploadSession) -> Result<UploadSession, UploadError> {
        let result = self.assemble(&session).await;

        let guard = match self
            .locks
            .lock_with_timeout(
                &session.session_id,
                Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
            )
            .await
        {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(session_id = session.session_id, error = %err, "finalizing without session lock");
                None
            }
        };
        if let Err(err) = self.chunks.remove(&session.staging_dir).await {
            warn!(
                session_id = session.session_id,
                staging_dir = ?session.staging_dir,
                error = %err,
                "failed to remove staging dir"
            );
        }

        let (path, size) = match result {
            Ok(placed) => placed,
            Err(err) => {
                warn!(
                    session_id = session.session_id,
                    user_id = session.user_id,
                    error = %err,
                    "upload finalization failed"
                );
                self.record_failure(&session, &err).await;
                return Err(err);
            }
        };

        let now = Utc::now();
        session.relative_target = self.storage.display_path(&session.user_id, &path);
        session.target_path = path;
        session.status = UploadStatus::Completed;
        session.completed_at = Some(now);
        session.touch(now);
        if let Err(err) = self.sessions.remove(&session).await {
            // 记录会在过期后被清理任务回收。
            warn!(session_id = session.session_id, error = %err, "failed to delete completed session");
        }
        drop(guard);

        info!(
            session_id = session.session_id,
            user_id = session.user_id,
            path = session.relative_target,
            size,
            "upload complete"
        );
        self.notify(&session, size).await;
        Ok(session)
    }

    async fn assemble(&self, session: &UploadSession) -> Result<(PathBuf, u64), UploadError> {
        let missing = self
            .chunks
            .missing_chunks(&session.staging_dir, session.total_chunks)
            .await
            .map_err(UploadError::finalization)?;
        if !missing.is_empty() {
            warn!(
                session_id = session.session_id,
                missing = ?missing,
                "chunks missing on disk at finalize"
            );
            return Err(UploadError::IncompleteUpload { missing });
        }

        if let Some(parent) = session.target_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(UploadError::finalization)?;
        }
        let mut atomic = AtomicFile::new(&session.target_path)
            .await
            .map_err(UploadError::finalization)?;

        let written = self.append_chunks(session, &mut atomic).await;
        let actual = match written {
            Ok(_) => atomic.flushed_len().await.map_err(UploadError::finalization),
            Err(err) => Err(err),
        };
        let actual = match actual {
            Ok(actual) => actual,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        if actual != session.file_size {
            warn!(
                session_id = session.session_id,
                expected = session.file_size,
                actual,
                "size mismatch after merge"
            );
            atomic.cleanup().await;
            return Err(UploadError::IntegrityCheckFailed {
                expected: session.file_size,
                actual,
            });
        }

        match self.place(&mut atomic, session).await {
            Ok(path) => Ok((path, actual)),
            Err(err) => {
                atomic.cleanup().await;
                Err(err)
            }
        }
    }

    async fn append_chunks(
        &self,
        session: &UploadSession,
        atomic: &mut AtomicFile,
    ) -> Result<u64, UploadError> {
        let mut total_written = 0u64;
        for index in 0..session.total_chunks {
            let mut part = match self.chunks.open(&session.staging_dir, index).await {
                Ok(part) => part,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(UploadError::IncompleteUpload {
                        missing: vec![index],
                    });
                }
                Err(err) => return Err(UploadError::finalization(err)),
            };
            total_written += tokio::io::copy(&mut part, atomic.file_mut())
                .await
                .map_err(UploadError::finalization)?;
        }
        Ok(total_written)
    }

    /// 放到目标位置；目标名在初始化后被占用时改用下一个空闲的 `name (n).ext`。
    async fn place(
        &self,
        atomic: &mut AtomicFile,
        session: &UploadSession,
    ) -> Result<PathBuf, UploadError> {
        let dir = session
            .target_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| UploadError::Finalization("target has no parent".into()))?;
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            match atomic.persist_new().await {
                Ok(()) => return Ok(atomic.target().to_path_buf()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let next = unique_target(&dir, &session.file_name).await?;
                    warn!(
                        session_id = session.session_id,
                        taken = ?atomic.target(),
                        next = ?next,
                        "target name taken, choosing another"
                    );
                    atomic.retarget(next);
                }
                Err(err) => return Err(UploadError::finalization(err)),
            }
        }
        Err(UploadError::Finalization(
            "could not find a free target name".into(),
        ))
    }

    /// 将失败写回会话记录；记录已被取消删除时不再复活。调用方持有会话锁。
    async fn record_failure(&self, session: &UploadSession, err: &UploadError) {
        let current = match self.sessions.find(&session.session_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(find_err) => {
                warn!(session_id = session.session_id, error = %find_err, "could not record failure");
                return;
            }
        };
        let mut failed = current;
        failed.status = UploadStatus::Error;
        failed.error_message = Some(err.to_string());
        failed.touch(Utc::now());
        if let Err(save_err) = self.sessions.save(&failed).await {
            warn!(session_id = session.session_id, error = %save_err, "could not record failure");
        }
    }

    async fn notify(&self, session: &UploadSession, size: u64) {
        let modified_at = fs::metadata(&session.target_path)
            .await
            .and_then(|metadata| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let name = session
            .target_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| session.file_name.clone());
        let parent_path = session
            .target_path
            .parent()
            .map(|parent| self.storage.display_path(&session.user_id, parent))
            .unwrap_or_default();

        let created = FileCreatedEvent {
            user_id: session.user_id.clone(),
            name,
            path: session.relative_target.clone(),
            size,
            modified_at,
        };
        if let Err(err) = self.notifier.file_created(created).await {
            warn!(session_id = session.session_id, error = %err, "file created notification failed");
        }
        let changed = FolderChangedEvent {
            user_id: session.user_id.clone(),
            parent_path,
        };
        if let Err(err) = self.notifier.folder_changed(changed).await {
            warn!(session_id = session.session_id, error = %err, "folder changed notification failed");
        }
    }
}
