//! 上传会话生命周期：初始化、接收分片、暂停/恢复/取消与触发合并。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::Assembler;
use crate::chunk_store::ChunkStore;
use crate::config::{LOCK_WAIT_TIMEOUT_SECS, STAGING_DIR_NAME, UploadConfig};
use crate::error::UploadError;
use crate::janitor::Janitor;
use crate::kv::KeyValueStore;
use crate::locking::SessionLocks;
use crate::notify::NotificationEmitter;
use crate::session::{SessionSnapshot, UploadSession, UploadStatus, total_chunks_for};
use crate::session_store::SessionStore;
use crate::storage::{Storage, sanitize_file_name, unique_target};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    /// Destination directory relative to the user's root; empty means the root.
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: String,
    pub file_name: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub target_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAccepted {
    pub session_id: String,
    pub completed: bool,
    pub progress: f64,
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

impl ChunkAccepted {
    fn pending(session: &UploadSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            completed: false,
            progress: session.progress(),
            uploaded_chunks: session.uploaded_chunks.len() as u64,
            total_chunks: session.total_chunks,
            target_path: None,
        }
    }

    fn completed(session: &UploadSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            completed: true,
            progress: 100.0,
            uploaded_chunks: session.total_chunks,
            total_chunks: session.total_chunks,
            target_path: Some(session.relative_target.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub session_id: String,
    pub status: UploadStatus,
    pub progress: f64,
    pub missing_chunks: Vec<u64>,
}

/// Owns the upload session lifecycle for all users.
pub struct UploadSessionManager {
    config: Arc<UploadConfig>,
    storage: Arc<Storage>,
    sessions: SessionStore,
    chunks: ChunkStore,
    locks: Arc<SessionLocks>,
    assembler: Assembler,
}

impl UploadSessionManager {
    pub fn new(
        config: Arc<UploadConfig>,
        storage: Arc<Storage>,
        kv: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn NotificationEmitter>,
    ) -> Self {
        let sessions = SessionStore::new(kv, config.record_ttl());
        let chunks = ChunkStore::new();
        let locks = Arc::new(SessionLocks::new());
        let assembler = Assembler::new(
            storage.clone(),
            sessions.clone(),
            chunks,
            locks.clone(),
            notifier,
        );
        Self {
            config,
            storage,
            sessions,
            chunks,
            locks,
            assembler,
        }
    }

    /// 创建共享同一存储与锁表的清理任务。
    pub fn janitor(&self) -> Janitor {
        Janitor::new(
            self.config.clone(),
            self.sessions.clone(),
            self.chunks,
            self.locks.clone(),
        )
    }

    pub async fn initialize_upload(
        &self,
        user_id: &str,
        request: InitUploadRequest,
    ) -> Result<InitUploadResponse, UploadError> {
        let raw_name = request
            .file_name
            .ok_or_else(|| UploadError::InvalidArgument("fileName is required".into()))?;
        let file_name = sanitize_file_name(&raw_name)
            .ok_or_else(|| UploadError::InvalidArgument("fileName is invalid".into()))?;
        let file_size = request
            .file_size
            .ok_or_else(|| UploadError::InvalidArgument("fileSize is required".into()))?;
        if self.config.max_file_size > 0 && file_size > self.config.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: file_size,
                max: self.config.max_file_size,
            });
        }

        let chunk_size = self.resolve_chunk_size(request.chunk_size, file_size)?;
        let total_chunks = total_chunks_for(file_size, chunk_size);
        if self.config.max_chunks > 0 && total_chunks > self.config.max_chunks {
            return Err(UploadError::InvalidArgument(format!(
                "{total_chunks} chunks exceeds limit {}",
                self.config.max_chunks
            )));
        }

        if self.config.max_active_per_user > 0 {
            let active = self
                .sessions
                .list_for_user(user_id)
                .await?
                .iter()
                .filter(|session| counts_as_active(session.status))
                .count() as u64;
            if active >= self.config.max_active_per_user {
                return Err(UploadError::TooManySessions(
                    self.config.max_active_per_user,
                ));
            }
        }

        let relative_dir = request.relative_path.unwrap_or_default();
        let dest_dir = self
            .storage
            .prepare_destination(user_id, &relative_dir)
            .await?;
        let target_path = unique_target(&dest_dir, &file_name).await?;

        let session_id = Uuid::new_v4().to_string();
        let staging_dir = staging_dir_for(&dest_dir, &session_id);
        self.chunks
            .create_staging(&staging_dir)
            .await
            .map_err(|err| UploadError::Storage(err.to_string()))?;

        let now = Utc::now();
        let session = UploadSession {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            file_name,
            file_size,
            chunk_size,
            total_chunks,
            relative_target: self.storage.display_path(user_id, &target_path),
            target_path,
            staging_dir,
            uploaded_chunks: Default::default(),
            status: UploadStatus::Initialized,
            created_at: now,
            last_activity: now,
            completed_at: None,
            error_message: None,
        };
        if let Err(err) = self.sessions.save(&session).await {
            if let Err(cleanup_err) = self.chunks.remove(&session.staging_dir).await {
                warn!(session_id, error = %cleanup_err, "failed to remove staging dir");
            }
            return Err(err);
        }

        info!(
            session_id,
            user_id,
            file_name = session.file_name,
            file_size,
            chunk_size,
            total_chunks,
            "init upload"
        );
        Ok(InitUploadResponse {
            session_id,
            file_name: session.file_name,
            chunk_size,
            total_chunks,
            target_path: session.relative_target,
        })
    }

    /// 接收一个分片。最后一个分片写入后在本次请求内完成合并。
    pub async fn accept_chunk<R>(
        &self,
        session_id: &str,
        user_id: &str,
        chunk_index: u64,
        payload: R,
    ) -> Result<ChunkAccepted, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session = self.sessions.get_owned(session_id, user_id).await?;
        if chunk_index >= session.total_chunks {
            return Err(UploadError::InvalidArgument(format!(
                "chunk index {chunk_index} out of range 0..{}",
                session.total_chunks
            )));
        }
        ensure_accepting(&session)?;
        if session.uploaded_chunks.contains(&chunk_index) {
            debug!(session_id, chunk_index, "duplicate chunk ignored");
            let _guard = self.lock(session_id).await?;
            if let Err(err) = self.sessions.refresh(&session).await {
                warn!(session_id, error = %err, "failed to refresh session expiry");
            }
            return Ok(ChunkAccepted::pending(&session));
        }

        let written = self
            .chunks
            .write(
                &session.staging_dir,
                chunk_index,
                payload,
                session.expected_chunk_len(chunk_index),
            )
            .await;
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(err) => {
                let _guard = self.lock(session_id).await?;
                let current = self.sessions.find(session_id).await?;
                let settled = current.as_ref().is_none_or(|current| {
                    matches!(current.status, UploadStatus::Completed | UploadStatus::Error)
                });
                if settled
                    && let Err(cleanup_err) = self.chunks.remove(&session.staging_dir).await
                {
                    warn!(session_id, error = %cleanup_err, "failed to remove staging dir");
                }
                if current.is_none() {
                    return Err(UploadError::NotFound(format!("session {session_id}")));
                }
                return Err(err);
            }
        };

        let (current, became_complete) = {
            let _guard = self.lock(session_id).await?;
            let Some(mut current) = self.sessions.find(session_id).await? else {
                // 写入期间会话被取消或回收，撤销刚写入的分片。
                if let Err(err) = self.chunks.remove(&session.staging_dir).await {
                    warn!(session_id, error = %err, "failed to remove staging dir");
                }
                return Err(UploadError::NotFound(format!("session {session_id}")));
            };
            if current.user_id != user_id {
                return Err(UploadError::Unauthorized);
            }
            if let Err(err) = ensure_accepting(&current) {
                if matches!(current.status, UploadStatus::Completed | UploadStatus::Error) {
                    // 合并已清理过暂存目录，撤销本次写入重建的目录。
                    if let Err(cleanup_err) = self.chunks.remove(&current.staging_dir).await {
                        warn!(session_id, error = %cleanup_err, "failed to remove staging dir");
                    }
                }
                return Err(err);
            }

            let was_complete = current.is_complete();
            let inserted = current.uploaded_chunks.insert(chunk_index);
            if inserted {
                current.status = UploadStatus::Uploading;
                current.touch(Utc::now());
                self.sessions.save(&current).await?;
            }
            let became_complete = inserted && !was_complete && current.is_complete();
            (current, became_complete)
        };

        debug!(
            session_id,
            chunk_index,
            bytes,
            uploaded = current.uploaded_chunks.len(),
            total = current.total_chunks,
            "chunk accepted"
        );
        if !became_complete {
            return Ok(ChunkAccepted::pending(&current));
        }
        match self.run_finalize(current).await? {
            Finalized::Done(session) => Ok(ChunkAccepted::completed(&session)),
            Finalized::InFlight(session) => Ok(ChunkAccepted::pending(&session)),
        }
    }

    pub async fn get_status(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionSnapshot, UploadError> {
        let session = self.sessions.get_owned(session_id, user_id).await?;
        Ok(session.snapshot(Utc::now()))
    }

    pub async fn pause(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionSnapshot, UploadError> {
        let _guard = self.lock(session_id).await?;
        let mut session = self.sessions.get_owned(session_id, user_id).await?;
        match session.status {
            UploadStatus::Initialized | UploadStatus::Uploading => {
                session.status = UploadStatus::Paused;
                session.touch(Utc::now());
                self.sessions.save(&session).await?;
                info!(session_id, user_id, "upload paused");
            }
            UploadStatus::Paused => {}
            UploadStatus::Completed | UploadStatus::Error => {
                return Err(UploadError::InvalidState(format!(
                    "cannot pause a session in state {}",
                    session.status.as_str()
                )));
            }
        }
        Ok(session.snapshot(Utc::now()))
    }

    /// 恢复暂停的会话，返回仍缺失的分片索引。
    pub async fn resume(&self, session_id: &str, user_id: &str) -> Result<ResumeInfo, UploadError> {
        let _guard = self.lock(session_id).await?;
        let mut session = self.sessions.get_owned(session_id, user_id).await?;
        match session.status {
            UploadStatus::Paused => {
                session.status = if session.uploaded_chunks.is_empty() {
                    UploadStatus::Initialized
                } else {
                    UploadStatus::Uploading
                };
                session.touch(Utc::now());
                self.sessions.save(&session).await?;
                info!(session_id, user_id, "upload resumed");
            }
            UploadStatus::Initialized | UploadStatus::Uploading => {}
            UploadStatus::Completed | UploadStatus::Error => {
                return Err(UploadError::InvalidState(format!(
                    "cannot resume a session in state {}",
                    session.status.as_str()
                )));
            }
        }
        Ok(ResumeInfo {
            session_id: session.session_id.clone(),
            status: session.status,
            progress: session.progress(),
            missing_chunks: session.missing_chunks(),
        })
    }

    /// 取消上传：删除暂存目录与会话记录。
    pub async fn cancel(&self, session_id: &str, user_id: &str) -> Result<(), UploadError> {
        let _guard = self.lock(session_id).await?;
        let session = self.sessions.get_owned(session_id, user_id).await?;
        if self.locks.is_finalizing(session_id) {
            return Err(UploadError::InvalidState(
                "upload is being finalized".into(),
            ));
        }
        if let Err(err) = self.chunks.remove(&session.staging_dir).await {
            warn!(session_id, error = %err, "failed to remove staging dir");
        }
        self.sessions.remove(&session).await?;
        info!(session_id, user_id, "upload canceled");
        Ok(())
    }

    /// 对分片已齐但未合并的会话显式触发合并。
    pub async fn finalize_upload(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<ChunkAccepted, UploadError> {
        let session = self.sessions.get_owned(session_id, user_id).await?;
        ensure_accepting(&session)?;
        if !session.is_complete() {
            return Err(UploadError::IncompleteUpload {
                missing: session.missing_chunks(),
            });
        }
        match self.run_finalize(session).await? {
            Finalized::Done(session) => Ok(ChunkAccepted::completed(&session)),
            Finalized::InFlight(_) => Err(UploadError::InvalidState(
                "finalization already in progress".into(),
            )),
        }
    }

    /// 列出用户未完成的会话，按创建时间排序。
    pub async fn list_active(&self, user_id: &str) -> Result<Vec<SessionSnapshot>, UploadError> {
        let now = Utc::now();
        let mut sessions = self.sessions.list_for_user(user_id).await?;
        sessions.retain(|session| session.status != UploadStatus::Completed);
        sessions.sort_by_key(|session| session.created_at);
        Ok(sessions
            .iter()
            .map(|session| session.snapshot(now))
            .collect())
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &Arc<SessionLocks> {
        &self.locks
    }

    async fn run_finalize(&self, session: UploadSession) -> Result<Finalized, UploadError> {
        let Some(_guard) = self.locks.try_begin_finalize(&session.session_id) else {
            debug!(session_id = session.session_id, "finalization already running");
            return Ok(Finalized::InFlight(session));
        };
        self.assembler.finalize(session).await.map(Finalized::Done)
    }

    async fn lock(
        &self,
        session_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, UploadError> {
        self.locks
            .lock_with_timeout(session_id, Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS))
            .await
    }

    fn resolve_chunk_size(&self, requested: Option<u64>, file_size: u64) -> Result<u64, UploadError> {
        let max = self.config.max_chunk_size;
        match requested {
            Some(0) => Err(UploadError::InvalidArgument(
                "chunkSize must be positive".into(),
            )),
            Some(size) if size > max => Err(UploadError::InvalidArgument(format!(
                "chunkSize {size} exceeds limit {max}"
            ))),
            Some(size) => Ok(size),
            None => {
                let mut size = self.config.default_chunk_size;
                if self.config.max_chunks > 0 {
                    size = size.max(file_size.div_ceil(self.config.max_chunks));
                }
                Ok(size.clamp(1, max))
            }
        }
    }
}

enum Finalized {
    Done(UploadSession),
    InFlight(UploadSession),
}

fn staging_dir_for(dest_dir: &std::path::Path, session_id: &str) -> PathBuf {
    dest_dir.join(STAGING_DIR_NAME).join(session_id)
}

fn counts_as_active(status: UploadStatus) -> bool {
    matches!(
        status,
        UploadStatus::Initialized | UploadStatus::Uploading | UploadStatus::Paused
    )
}

fn ensure_accepting(session: &UploadSession) -> Result<(), UploadError> {
    match session.status {
        UploadStatus::Initialized | UploadStatus::Uploading => Ok(()),
        UploadStatus::Paused => Err(UploadError::InvalidState("upload is paused".into())),
        UploadStatus::Completed => Err(UploadError::InvalidState(
            "upload already completed".into(),
        )),
        UploadStatus::Error => Err(UploadError::InvalidState(format!(
            "upload failed: {}",
            session.error_message.as_deref().unwrap_or("unknown error")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{TempDir, tempdir};
    use tokio::fs;

    use crate::file_store::FileStore;
    use crate::kv::{MemoryStore, StoreError};
    use crate::notify::tests::RecordingNotifier;

    pub(crate) const USER: &str = "alice";

    /// Wraps another store; writes fail while `fail_writes` is set.
    pub(crate) struct FlakyStore {
        inner: Arc<dyn KeyValueStore>,
        pub(crate) fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn over(inner: Arc<dyn KeyValueStore>) -> Self {
            Self {
                inner,
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("store offline")));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.inner.expire(key, ttl).await
        }
    }

    pub(crate) struct Harness {
        pub(crate) temp: TempDir,
        pub(crate) storage: Arc<Storage>,
        pub(crate) kv: Arc<FlakyStore>,
        pub(crate) notifier: Arc<RecordingNotifier>,
        pub(crate) manager: Arc<UploadSessionManager>,
    }

    impl Harness {
        pub(crate) fn user_root(&self) -> PathBuf {
            self.storage.root_path().join(USER)
        }
    }

    pub(crate) fn harness_with(config: UploadConfig, notifier: RecordingNotifier) -> Harness {
        let temp = tempdir().expect("tempdir");
        build_harness(temp, Arc::new(MemoryStore::new()), config, notifier)
    }

    /// Same as `harness`, backed by the on-disk session store.
    pub(crate) async fn file_harness() -> Harness {
        let temp = tempdir().expect("tempdir");
        let kv = FileStore::open(temp.path().join("state"))
            .await
            .expect("open file store");
        build_harness(
            temp,
            Arc::new(kv),
            UploadConfig::default(),
            RecordingNotifier::default(),
        )
    }

    fn build_harness(
        temp: TempDir,
        inner: Arc<dyn KeyValueStore>,
        config: UploadConfig,
        notifier: RecordingNotifier,
    ) -> Harness {
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        let storage = Arc::new(Storage::new(root));
        let kv = Arc::new(FlakyStore::over(inner));
        let notifier = Arc::new(notifier);
        let manager = Arc::new(UploadSessionManager::new(
            Arc::new(config),
            storage.clone(),
            kv.clone(),
            notifier.clone(),
        ));
        Harness {
            temp,
            storage,
            kv,
            notifier,
            manager,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(UploadConfig::default(), RecordingNotifier::default())
    }

    pub(crate) fn init_request(name: &str, size: u64, chunk_size: Option<u64>) -> InitUploadRequest {
        InitUploadRequest {
            file_name: Some(name.to_string()),
            file_size: Some(size),
            relative_path: None,
            chunk_size,
        }
    }

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunk_of(data: &[u8], chunk_size: u64, index: u64) -> &[u8] {
        let start = (index * chunk_size) as usize;
        let end = (start + chunk_size as usize).min(data.len());
        &data[start..end]
    }

    fn staging_of(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(STAGING_DIR_NAME).join(session_id)
    }

    #[tokio::test]
    async fn reverse_order_upload_assembles_in_index_order() {
        let h = harness();
        let size = 10 * 1024 * 1024;
        let chunk_size = 2 * 1024 * 1024;
        let data = pattern_bytes(size as usize);
        let init = h
            .manager
            .initialize_upload(USER, init_request("video.bin", size, Some(chunk_size)))
            .await
            .expect("init");
        assert_eq!(init.total_chunks, 5);
        assert_eq!(init.target_path, "video.bin");

        for index in (1..5).rev() {
            let accepted = h
                .manager
                .accept_chunk(&init.session_id, USER, index, chunk_of(&data, chunk_size, index))
                .await
                .expect("accept");
            assert!(!accepted.completed);
        }
        let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
        assert_eq!(status.uploaded_chunks, vec![1, 2, 3, 4]);
        assert_eq!(status.status, UploadStatus::Uploading);
        assert!((status.progress - 80.0).abs() < f64::EPSILON);

        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, chunk_of(&data, chunk_size, 0))
            .await
            .expect("accept last");
        assert!(done.completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.target_path.as_deref(), Some("video.bin"));

        let written = fs::read(h.user_root().join("video.bin")).await.expect("read");
        assert_eq!(written, data);
        assert!(!staging_of(&h.user_root(), &init.session_id).exists());
        assert!(!h.user_root().join(STAGING_DIR_NAME).exists());
        assert!(matches!(
            h.manager.get_status(&init.session_id, USER).await,
            Err(UploadError::NotFound(_))
        ));

        let created = h.notifier.created.lock().expect("lock");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].path, "video.bin");
        assert_eq!(created[0].size, size);
        let changed = h.notifier.changed.lock().expect("lock");
        assert_eq!(changed[0].parent_path, "");
    }

    #[tokio::test]
    async fn any_arrival_order_yields_identical_bytes() {
        let orders: [[u64; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        let data = pattern_bytes(10);
        for (n, order) in orders.iter().enumerate() {
            let h = harness();
            let name = format!("file{n}.bin");
            let init = h
                .manager
                .initialize_upload(USER, init_request(&name, 10, Some(3)))
                .await
                .expect("init");
            assert_eq!(init.total_chunks, 4);
            let mut last = None;
            for &index in order {
                last = Some(
                    h.manager
                        .accept_chunk(&init.session_id, USER, index, chunk_of(&data, 3, index))
                        .await
                        .expect("accept"),
                );
            }
            assert!(last.expect("accepted").completed);
            let written = fs::read(h.user_root().join(&name)).await.expect("read");
            assert_eq!(written, data, "order {order:?}");
        }
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.txt", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("first");
        let again = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b"xyz"[..])
            .await
            .expect("duplicate");
        assert!(!again.completed);
        assert_eq!(again.uploaded_chunks, 1);

        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
            .await
            .expect("last");
        assert!(done.completed);
        assert_eq!(
            fs::read(h.user_root().join("a.txt")).await.expect("read"),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn chunk_missing_on_disk_fails_finalize_with_its_index() {
        let h = harness();
        let size = 10 * 1024 * 1024;
        let chunk_size = 2 * 1024 * 1024;
        let data = pattern_bytes(size as usize);
        let init = h
            .manager
            .initialize_upload(USER, init_request("video.bin", size, Some(chunk_size)))
            .await
            .expect("init");
        for index in 0..4 {
            h.manager
                .accept_chunk(&init.session_id, USER, index, chunk_of(&data, chunk_size, index))
                .await
                .expect("accept");
        }
        let staging = staging_of(&h.user_root(), &init.session_id);
        std::fs::remove_file(ChunkStore::chunk_path(&staging, 3)).expect("remove chunk");

        let result = h
            .manager
            .accept_chunk(&init.session_id, USER, 4, chunk_of(&data, chunk_size, 4))
            .await;
        match result {
            Err(UploadError::IncompleteUpload { missing }) => assert_eq!(missing, vec![3]),
            other => panic!("unexpected result: {other:?}"),
        }

        let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
        assert_eq!(status.status, UploadStatus::Error);
        assert!(status.error_message.is_some());
        assert!(!staging.exists());
        assert!(!h.user_root().join("video.bin").exists());
        assert!(h.notifier.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn short_chunk_fails_integrity_check() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("short.bin", 9, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&init.session_id, USER, 0, &b"ab"[..])
            .await
            .expect("short chunk is accepted");
        h.manager
            .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
            .await
            .expect("accept");
        let result = h
            .manager
            .accept_chunk(&init.session_id, USER, 2, &b"ghi"[..])
            .await;
        match result {
            Err(UploadError::IntegrityCheckFailed { expected, actual }) => {
                assert_eq!((expected, actual), (9, 8));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(!h.user_root().join("short.bin").exists());
        assert!(!staging_of(&h.user_root(), &init.session_id).exists());
        let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
        assert_eq!(status.status, UploadStatus::Error);
        assert!(matches!(
            h.manager.resume(&init.session_id, USER).await,
            Err(UploadError::InvalidState(_))
        ));

        h.manager.cancel(&init.session_id, USER).await.expect("cancel");
        assert!(matches!(
            h.manager.get_status(&init.session_id, USER).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 5, Some(3)))
            .await
            .expect("init");
        // 最后一个分片只应有 2 字节。
        let result = h
            .manager
            .accept_chunk(&init.session_id, USER, 1, &b"xyz"[..])
            .await;
        assert!(matches!(result, Err(UploadError::InvalidArgument(_))));
        let result = h
            .manager
            .accept_chunk(&init.session_id, USER, 2, &b"x"[..])
            .await;
        assert!(matches!(result, Err(UploadError::InvalidArgument(_))));
        let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
        assert!(status.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn other_users_are_unauthorized() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 3, None))
            .await
            .expect("init");
        assert!(matches!(
            h.manager.get_status(&init.session_id, "bob").await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            h.manager
                .accept_chunk(&init.session_id, "bob", 0, &b"abc"[..])
                .await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            h.manager.cancel(&init.session_id, "bob").await,
            Err(UploadError::Unauthorized)
        ));
        assert!(matches!(
            h.manager.pause(&init.session_id, "bob").await,
            Err(UploadError::Unauthorized)
        ));
        assert!(h.manager.list_active("bob").await.expect("list").is_empty());
        assert!(matches!(
            h.manager.get_status("missing", USER).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pause_blocks_chunks_until_resume() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("accept");

        let paused = h.manager.pause(&init.session_id, USER).await.expect("pause");
        assert_eq!(paused.status, UploadStatus::Paused);
        h.manager.pause(&init.session_id, USER).await.expect("pause again");
        assert!(matches!(
            h.manager
                .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
                .await,
            Err(UploadError::InvalidState(_))
        ));

        let resumed = h.manager.resume(&init.session_id, USER).await.expect("resume");
        assert_eq!(resumed.status, UploadStatus::Uploading);
        assert_eq!(resumed.missing_chunks, vec![1]);
        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
            .await
            .expect("accept");
        assert!(done.completed);
    }

    #[tokio::test]
    async fn resume_without_chunks_returns_to_initialized() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager.pause(&init.session_id, USER).await.expect("pause");
        let resumed = h.manager.resume(&init.session_id, USER).await.expect("resume");
        assert_eq!(resumed.status, UploadStatus::Initialized);
        assert_eq!(resumed.missing_chunks, vec![0, 1]);
    }

    #[tokio::test]
    async fn cancel_removes_staging_and_record() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("accept");
        let staging = staging_of(&h.user_root(), &init.session_id);
        assert!(staging.exists());

        h.manager.cancel(&init.session_id, USER).await.expect("cancel");
        assert!(!staging.exists());
        assert!(matches!(
            h.manager
                .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
                .await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            h.manager.cancel(&init.session_id, USER).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(!h.user_root().join("a.bin").exists());
    }

    #[tokio::test]
    async fn name_collision_gets_numbered_suffix() {
        let h = harness();
        std::fs::create_dir_all(h.user_root()).expect("user root");
        std::fs::write(h.user_root().join("report.pdf"), b"old").expect("seed");

        let init = h
            .manager
            .initialize_upload(USER, init_request("report.pdf", 3, None))
            .await
            .expect("init");
        assert_eq!(init.target_path, "report (1).pdf");

        // 初始化后目标名又被占用，合并时顺延到下一个空闲名字。
        std::fs::write(h.user_root().join("report (1).pdf"), b"race").expect("seed");
        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b"new"[..])
            .await
            .expect("accept");
        assert_eq!(done.target_path.as_deref(), Some("report (2).pdf"));
        assert_eq!(
            std::fs::read(h.user_root().join("report.pdf")).expect("read"),
            b"old"
        );
        assert_eq!(
            std::fs::read(h.user_root().join("report (2).pdf")).expect("read"),
            b"new"
        );
    }

    #[tokio::test]
    async fn zero_byte_file_is_one_empty_chunk() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("empty.txt", 0, None))
            .await
            .expect("init");
        assert_eq!(init.total_chunks, 1);
        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b""[..])
            .await
            .expect("accept");
        assert!(done.completed);
        let metadata = std::fs::metadata(h.user_root().join("empty.txt")).expect("metadata");
        assert_eq!(metadata.len(), 0);
    }

    #[tokio::test]
    async fn init_into_nested_directory() {
        let h = harness();
        let mut request = init_request("a.txt", 3, None);
        request.relative_path = Some("docs/2024".into());
        let init = h
            .manager
            .initialize_upload(USER, request)
            .await
            .expect("init");
        assert_eq!(init.target_path, "docs/2024/a.txt");
        h.manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("accept");
        assert!(h.user_root().join("docs/2024/a.txt").exists());
        let changed = h.notifier.changed.lock().expect("lock");
        assert_eq!(changed[0].parent_path, "docs/2024");
    }

    #[tokio::test]
    async fn init_validates_arguments() {
        let config = UploadConfig {
            max_file_size: 100,
            max_chunk_size: 10,
            default_chunk_size: 4,
            max_chunks: 5,
            ..UploadConfig::default()
        };
        let h = harness_with(config, RecordingNotifier::default());
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request(STAGING_DIR_NAME, 1, None))
                .await,
            Err(UploadError::InvalidArgument(_))
        ));
        let missing_name = InitUploadRequest {
            file_size: Some(1),
            ..InitUploadRequest::default()
        };
        assert!(matches!(
            h.manager.initialize_upload(USER, missing_name).await,
            Err(UploadError::InvalidArgument(_))
        ));
        let missing_size = InitUploadRequest {
            file_name: Some("a".into()),
            ..InitUploadRequest::default()
        };
        assert!(matches!(
            h.manager.initialize_upload(USER, missing_size).await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request("a", 101, None))
                .await,
            Err(UploadError::FileTooLarge { size: 101, max: 100 })
        ));
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request("a", 10, Some(0)))
                .await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request("a", 10, Some(11)))
                .await,
            Err(UploadError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request("a", 60, Some(2)))
                .await,
            Err(UploadError::InvalidArgument(_))
        ));
        let mut traversal = init_request("a", 1, None);
        traversal.relative_path = Some("../bob".into());
        assert!(matches!(
            h.manager.initialize_upload(USER, traversal).await,
            Err(UploadError::InvalidArgument(_))
        ));

        // 自动分片大小会放大以满足分片数上限。
        let auto = h
            .manager
            .initialize_upload(USER, init_request("auto.bin", 30, None))
            .await
            .expect("init");
        assert_eq!(auto.chunk_size, 6);
        assert_eq!(auto.total_chunks, 5);
    }

    #[tokio::test]
    async fn active_session_limit_per_user() {
        let config = UploadConfig {
            max_active_per_user: 2,
            ..UploadConfig::default()
        };
        let h = harness_with(config, RecordingNotifier::default());
        let first = h
            .manager
            .initialize_upload(USER, init_request("1.bin", 3, None))
            .await
            .expect("init");
        h.manager
            .initialize_upload(USER, init_request("2.bin", 3, None))
            .await
            .expect("init");
        assert!(matches!(
            h.manager
                .initialize_upload(USER, init_request("3.bin", 3, None))
                .await,
            Err(UploadError::TooManySessions(2))
        ));
        h.manager
            .initialize_upload("bob", init_request("3.bin", 3, None))
            .await
            .expect("other users are unaffected");

        h.manager.cancel(&first.session_id, USER).await.expect("cancel");
        h.manager
            .initialize_upload(USER, init_request("3.bin", 3, None))
            .await
            .expect("slot freed");
    }

    #[tokio::test]
    async fn persistence_failures_surface_and_leave_no_state() {
        let h = harness();
        h.kv.fail_writes.store(true, Ordering::SeqCst);
        let result = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await;
        assert!(matches!(result, Err(UploadError::SessionPersistence(_))));
        assert!(!h.user_root().join(STAGING_DIR_NAME).exists());
        h.kv.fail_writes.store(false, Ordering::SeqCst);

        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        h.kv.fail_writes.store(true, Ordering::SeqCst);
        let result = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await;
        assert!(matches!(result, Err(UploadError::SessionPersistence(_))));
        let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
        assert!(status.uploaded_chunks.is_empty(), "chunk must not be acknowledged");

        h.kv.fail_writes.store(false, Ordering::SeqCst);
        let accepted = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("retry");
        assert_eq!(accepted.uploaded_chunks, 1);
    }

    #[tokio::test]
    async fn notification_failures_do_not_fail_upload() {
        let h = harness_with(UploadConfig::default(), RecordingNotifier::failing());
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 3, None))
            .await
            .expect("init");
        let done = h
            .manager
            .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("accept");
        assert!(done.completed);
        assert_eq!(h.notifier.created.lock().expect("lock").len(), 1);
        assert_eq!(h.notifier.changed.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn explicit_finalize_requires_all_chunks() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&init.session_id, USER, 1, &b"def"[..])
            .await
            .expect("accept");
        match h.manager.finalize_upload(&init.session_id, USER).await {
            Err(UploadError::IncompleteUpload { missing }) => assert_eq!(missing, vec![0]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_finalize_recovers_complete_session() {
        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        // 模拟分片已记录但合并前进程中断的会话。
        let mut session = h
            .manager
            .sessions
            .find(&init.session_id)
            .await
            .expect("find")
            .expect("present");
        let chunks = ChunkStore::new();
        chunks
            .write(&session.staging_dir, 0, &b"abc"[..], 3)
            .await
            .expect("write");
        chunks
            .write(&session.staging_dir, 1, &b"def"[..], 3)
            .await
            .expect("write");
        session.uploaded_chunks.extend([0, 1]);
        session.status = UploadStatus::Uploading;
        h.manager.sessions.save(&session).await.expect("save");

        let done = h
            .manager
            .finalize_upload(&init.session_id, USER)
            .await
            .expect("finalize");
        assert!(done.completed);
        assert_eq!(
            fs::read(h.user_root().join("a.bin")).await.expect("read"),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn list_active_reports_progress_per_user() {
        let h = harness();
        let first = h
            .manager
            .initialize_upload(USER, init_request("1.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .initialize_upload(USER, init_request("2.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .initialize_upload("bob", init_request("3.bin", 6, Some(3)))
            .await
            .expect("init");
        h.manager
            .accept_chunk(&first.session_id, USER, 0, &b"abc"[..])
            .await
            .expect("accept");

        let active = h.manager.list_active(USER).await.expect("list");
        assert_eq!(active.len(), 2);
        let entry = active
            .iter()
            .find(|snapshot| snapshot.session_id == first.session_id)
            .expect("first listed");
        assert!((entry.progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(entry.target_path, "1.bin");
        assert!(h.temp.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_and_new_chunk_race_keeps_both_on_file_store() {
        let h = file_harness().await;
        for round in 0..25 {
            let init = h
                .manager
                .initialize_upload(USER, init_request(&format!("{round}.bin"), 9, Some(3)))
                .await
                .expect("init");
            h.manager
                .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
                .await
                .expect("accept");

            let resend = tokio::spawn({
                let manager = h.manager.clone();
                let session_id = init.session_id.clone();
                async move { manager.accept_chunk(&session_id, USER, 0, &b"abc"[..]).await }
            });
            let fresh = tokio::spawn({
                let manager = h.manager.clone();
                let session_id = init.session_id.clone();
                async move { manager.accept_chunk(&session_id, USER, 1, &b"def"[..]).await }
            });
            resend.await.expect("join").expect("resend");
            fresh.await.expect("join").expect("new chunk");

            let status = h.manager.get_status(&init.session_id, USER).await.expect("status");
            assert_eq!(status.uploaded_chunks, vec![0, 1], "round {round}");
            h.manager.cancel(&init.session_id, USER).await.expect("cancel");
        }
        assert!(!h.user_root().join(STAGING_DIR_NAME).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_last_chunks_finalize_once() {
        let h = harness();
        for round in 0..20 {
            let name = format!("{round}.bin");
            let init = h
                .manager
                .initialize_upload(USER, init_request(&name, 6, Some(3)))
                .await
                .expect("init");
            h.manager
                .accept_chunk(&init.session_id, USER, 0, &b"abc"[..])
                .await
                .expect("accept");

            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let manager = h.manager.clone();
                    let session_id = init.session_id.clone();
                    tokio::spawn(async move {
                        manager.accept_chunk(&session_id, USER, 1, &b"def"[..]).await
                    })
                })
                .collect();
            let mut completed = 0;
            for task in tasks {
                match task.await.expect("join") {
                    Ok(accepted) if accepted.completed => completed += 1,
                    Ok(_) | Err(UploadError::NotFound(_)) | Err(UploadError::InvalidState(_)) => {}
                    Err(err) => panic!("unexpected error: {err:?}"),
                }
            }
            assert_eq!(completed, 1, "round {round}");
            assert_eq!(
                fs::read(h.user_root().join(&name)).await.expect("read"),
                b"abcdef"
            );
            assert!(!h.user_root().join(format!("{round} (1).bin")).exists());
        }
        assert!(!h.user_root().join(STAGING_DIR_NAME).exists());
        assert_eq!(h.notifier.created.lock().expect("lock").len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunk_in_flight_during_cancel_leaves_nothing_behind() {
        use tokio::io::AsyncWriteExt;

        let h = harness();
        let init = h
            .manager
            .initialize_upload(USER, init_request("a.bin", 6, Some(3)))
            .await
            .expect("init");
        let staging = staging_of(&h.user_root(), &init.session_id);

        let (mut client, body) = tokio::io::duplex(64);
        let upload = tokio::spawn({
            let manager = h.manager.clone();
            let session_id = init.session_id.clone();
            async move { manager.accept_chunk(&session_id, USER, 0, body).await }
        });
        client.write_all(b"ab").await.expect("write");
        // 等到分片的临时文件出现在暂存区。
        while std::fs::read_dir(&staging)
            .map(|entries| entries.count())
            .unwrap_or(0)
            == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.manager.cancel(&init.session_id, USER).await.expect("cancel");
        client.write_all(b"c").await.expect("write");
        drop(client);

        assert!(matches!(
            upload.await.expect("join"),
            Err(UploadError::NotFound(_))
        ));
        assert!(!staging.exists());
        assert!(!h.user_root().join(STAGING_DIR_NAME).exists());
        assert!(!h.user_root().join("a.bin").exists());
    }
}
