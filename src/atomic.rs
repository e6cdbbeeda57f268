//! 临时写入与原子落盘的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 与目标同目录的临时文件，写完后一次性放到目标位置。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// 重新指定落盘目标（须与临时文件同目录）。
    pub fn retarget(&mut self, target: PathBuf) {
        self.target = target;
    }

    /// 刷新缓冲并返回临时文件当前长度。
    pub async fn flushed_len(&mut self) -> io::Result<u64> {
        self.file.flush().await?;
        Ok(self.file.metadata().await?.len())
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn replace(self) -> io::Result<()> {
        let Self {
            target,
            temp_path,
            file,
        } = self;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    if let Err(err) = fs::rename(&temp_path, &target).await {
                        let _ = fs::remove_file(&temp_path).await;
                        return Err(err);
                    }
                } else {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 同步并放到目标位置，但目标已存在时不覆盖。
    ///
    /// 目标已存在时返回 `AlreadyExists`，临时文件保留，调用方可 [`retarget`](Self::retarget) 后重试。
    pub async fn persist_new(&mut self) -> io::Result<()> {
        self.file.sync_all().await?;
        match fs::hard_link(&self.temp_path, &self.target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(err),
            Err(_) => {
                // 文件系统不支持硬链接时退化为检查后改名。
                if fs::try_exists(&self.target).await? {
                    return Err(io::Error::from(io::ErrorKind::AlreadyExists));
                }
                fs::rename(&self.temp_path, &self.target).await?;
                return self.sync_parent().await;
            }
        }
        let _ = fs::remove_file(&self.temp_path).await;
        self.sync_parent().await
    }

    async fn sync_parent(&self) -> io::Result<()> {
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
