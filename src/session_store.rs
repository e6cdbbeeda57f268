//! 上传会话记录的持久化：键规则、按会话 id / 用户查找与读时规范化。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::warn;

use crate::error::UploadError;
use crate::kv::{KeyValueStore, StoreError};
use crate::session::UploadSession;

const KEY_PREFIX: &str = "upload";

fn persistence(err: StoreError) -> UploadError {
    UploadError::SessionPersistence(err.to_string())
}

/// Session records keyed `upload:{userId}:{sessionId}`.
///
/// Keeps a session id to key index so lookups by id skip the pattern scan;
/// ids missing from the index (e.g. after a restart) fall back to the scan.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    record_ttl: Duration,
    index: Arc<StdMutex<HashMap<String, String>>>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, record_ttl: Duration) -> Self {
        Self {
            kv,
            record_ttl,
            index: Arc::default(),
        }
    }

    pub fn key(user_id: &str, session_id: &str) -> String {
        format!("{KEY_PREFIX}:{user_id}:{session_id}")
    }

    /// 写入记录并刷新过期时间。
    pub async fn save(&self, session: &UploadSession) -> Result<(), UploadError> {
        let value = serde_json::to_string(session)
            .map_err(|err| UploadError::SessionPersistence(err.to_string()))?;
        let key = Self::key(&session.user_id, &session.session_id);
        self.kv
            .set(&key, value, self.record_ttl)
            .await
            .map_err(persistence)?;
        self.remember(&session.session_id, key);
        Ok(())
    }

    /// 只延长记录的过期时间，不改写内容。
    pub async fn refresh(&self, session: &UploadSession) -> Result<bool, UploadError> {
        self.kv
            .expire(
                &Self::key(&session.user_id, &session.session_id),
                self.record_ttl,
            )
            .await
            .map_err(persistence)
    }

    /// 仅凭会话 id 查找，不需要预先知道所属用户。
    pub async fn find(&self, session_id: &str) -> Result<Option<UploadSession>, UploadError> {
        if session_id.is_empty() || session_id.contains(['*', ':']) {
            return Ok(None);
        }
        if let Some(key) = self.indexed_key(session_id) {
            if let Some(session) = self.load(&key).await? {
                return Ok(Some(session));
            }
            self.forget(session_id);
        }

        let pattern = format!("{KEY_PREFIX}:*:{session_id}");
        let keys = self.kv.keys(&pattern).await.map_err(persistence)?;
        let mut found: Option<(String, UploadSession)> = None;
        for key in keys {
            if let Some(session) = self.load(&key).await?
                && session.session_id == session_id
            {
                if found.is_some() {
                    warn!(session_id, "multiple records share one session id");
                    continue;
                }
                found = Some((key, session));
            }
        }
        Ok(found.map(|(key, session)| {
            self.remember(session_id, key);
            session
        }))
    }

    /// 查找会话并校验归属：不存在为 `NotFound`，用户不符为 `Unauthorized`。
    pub async fn get_owned(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<UploadSession, UploadError> {
        let session = self
            .find(session_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("upload session {session_id}")))?;
        if session.user_id != user_id {
            warn!(session_id, user_id, "session accessed by another user");
            return Err(UploadError::Unauthorized);
        }
        Ok(session)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<UploadSession>, UploadError> {
        let pattern = format!("{KEY_PREFIX}:{user_id}:*");
        let sessions = self.load_matching(&pattern).await?;
        Ok(sessions
            .into_iter()
            .filter(|session| session.user_id == user_id)
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<UploadSession>, UploadError> {
        self.load_matching(&format!("{KEY_PREFIX}:*")).await
    }

    /// Returns whether a record was removed.
    pub async fn remove(&self, session: &UploadSession) -> Result<bool, UploadError> {
        let removed = self
            .kv
            .delete(&Self::key(&session.user_id, &session.session_id))
            .await
            .map_err(persistence)?;
        self.forget(&session.session_id);
        Ok(removed)
    }

    fn indexed_key(&self, session_id: &str) -> Option<String> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    fn remember(&self, session_id: &str, key: String) {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.to_string(), key);
    }

    fn forget(&self, session_id: &str) {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }

    async fn load_matching(&self, pattern: &str) -> Result<Vec<UploadSession>, UploadError> {
        let keys = self.kv.keys(pattern).await.map_err(persistence)?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(session) = self.load(&key).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn load(&self, key: &str) -> Result<Option<UploadSession>, UploadError> {
        let Some(raw) = self.kv.get(key).await.map_err(persistence)? else {
            return Ok(None);
        };
        let mut session: UploadSession = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(err) => {
                warn!(key, error = %err, "discarding malformed session record");
                return Ok(None);
            }
        };
        if Self::key(&session.user_id, &session.session_id) != key {
            warn!(key, "session record does not match its key");
            return Ok(None);
        }
        session.normalize();
        Ok(Some(session))
    }
}
