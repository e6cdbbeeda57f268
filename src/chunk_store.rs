//! 分片暂存区：按 (暂存目录, 索引) 保存原始分片字节。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::atomic::AtomicFile;
use crate::error::UploadError;

#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkStore;

impl ChunkStore {
    pub fn new() -> Self {
        Self
    }

    pub fn chunk_path(staging_dir: &Path, index: u64) -> PathBuf {
        staging_dir.join(format!("chunk_{index}"))
    }

    /// 创建暂存目录。暂存根目录可能正被另一会话的 `remove` 删除，
    /// 此时 `create_dir_all` 会以 `NotFound` 失败，重试一次即可。
    pub async fn create_staging(&self, staging_dir: &Path) -> io::Result<()> {
        match fs::create_dir_all(staging_dir).await {
            Err(err) if err.kind() == ErrorKind::NotFound => fs::create_dir_all(staging_dir).await,
            result => result,
        }
    }

    /// 流式写入一个分片，超过 `max_len` 字节即拒绝。
    ///
    /// 先写临时文件再改名，同一索引的并发重试不会交错写入。
    pub async fn write<R>(
        &self,
        staging_dir: &Path,
        index: u64,
        payload: R,
        max_len: u64,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.create_staging(staging_dir)
            .await
            .map_err(|err| UploadError::ChunkWrite(err.to_string()))?;
        let mut atomic = AtomicFile::new(&Self::chunk_path(staging_dir, index))
            .await
            .map_err(|err| UploadError::ChunkWrite(err.to_string()))?;

        let mut limited = payload.take(max_len.saturating_add(1));
        let written = match tokio::io::copy(&mut limited, atomic.file_mut()).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(UploadError::ChunkWrite(err.to_string()));
            }
        };
        if written > max_len {
            atomic.cleanup().await;
            return Err(UploadError::InvalidArgument(format!(
                "chunk {index} exceeds {max_len} bytes"
            )));
        }
        atomic
            .replace()
            .await
            .map_err(|err| UploadError::ChunkWrite(err.to_string()))?;
        debug!(staging_dir = ?staging_dir, index, bytes = written, "chunk stored");
        Ok(written)
    }

    /// 逐个检查分片文件是否存在，返回缺失的索引。
    pub async fn missing_chunks(&self, staging_dir: &Path, total_chunks: u64) -> io::Result<Vec<u64>> {
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            match fs::metadata(Self::chunk_path(staging_dir, index)).await {
                Ok(metadata) if metadata.is_file() => {}
                Ok(_) => missing.push(index),
                Err(err) if err.kind() == ErrorKind::NotFound => missing.push(index),
                Err(err) => return Err(err),
            }
        }
        Ok(missing)
    }

    pub async fn open(&self, staging_dir: &Path, index: u64) -> io::Result<File> {
        File::open(Self::chunk_path(staging_dir, index)).await
    }

    /// 递归删除暂存目录（不存在视为成功），并尝试移除已空的暂存根目录。
    pub async fn remove(&self, staging_dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(staging_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        if let Some(parent) = staging_dir.parent() {
            // 仅在目录为空时成功；其他会话仍在使用时失败即可。
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
