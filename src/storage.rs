//! 用户存储树：路径解析、符号链接防护与不冲突的目标文件名。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::{MAX_NAME_SUFFIX, STAGING_DIR_NAME};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 返回用户存储树的根目录；用户 id 必须是单个安全的路径段。
    pub fn user_root(&self, user_id: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(user_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None)
                if segment.to_str() == Some(user_id) && !user_id.contains(['/', '\\']) =>
            {
                Ok(self.root.join(segment))
            }
            _ => Err(StorageError::InvalidPath),
        }
    }

    /// 解析并创建上传目标目录，返回绝对路径。
    pub async fn prepare_destination(
        &self,
        user_id: &str,
        relative_dir: &str,
    ) -> Result<PathBuf, StorageError> {
        let user_root = self.user_root(user_id)?;
        let target = resolve_within(&user_root, relative_dir)?;
        if target
            .components()
            .any(|component| component.as_os_str() == STAGING_DIR_NAME)
        {
            return Err(StorageError::InvalidPath);
        }
        fs::create_dir_all(&user_root).await?;
        ensure_no_symlink_components(&user_root, &target, true).await?;
        fs::create_dir_all(&target).await?;
        ensure_no_symlink_components(&user_root, &target, false).await?;
        Ok(target)
    }

    /// 将绝对路径转换为相对用户根目录的展示路径（`/` 分隔）。
    pub fn display_path(&self, user_id: &str, path: &Path) -> String {
        let Ok(user_root) = self.user_root(user_id) else {
            return String::new();
        };
        path.strip_prefix(&user_root)
            .map(|relative| {
                relative
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/")
            })
            .unwrap_or_default()
    }
}

fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    let mut normalized = PathBuf::new();
    let trimmed = relative.trim().trim_start_matches(['/', '\\']);
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    Ok(base.join(normalized))
}

async fn ensure_no_symlink_components(
    base: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(base)
        .map_err(|_| StorageError::InvalidPath)?;
    let mut current = PathBuf::from(base);
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::InvalidPath);
                }
                if !metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                return Ok(());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

/// 清理文件名：去除控制字符与路径分隔符。
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|ch| !ch.is_control() && *ch != '/' && *ch != '\\')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." || cleaned == STAGING_DIR_NAME {
        return None;
    }
    Some(cleaned.to_string())
}

/// 生成第 n 个候选文件名：`name (n).ext`。
pub fn candidate_name(file_name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return file_name.to_string();
    }
    let path = Path::new(file_name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{} ({attempt}).{}",
            stem.to_string_lossy(),
            ext.to_string_lossy()
        ),
        _ => format!("{file_name} ({attempt})"),
    }
}

/// 在目录中挑选一个尚不存在的文件名，永不覆盖已有文件。
pub async fn unique_target(dir: &Path, file_name: &str) -> Result<PathBuf, StorageError> {
    for attempt in 0..=MAX_NAME_SUFFIX {
        let candidate = dir.join(candidate_name(file_name, attempt));
        match fs::symlink_metadata(&candidate).await {
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(StorageError::Io(err)),
        }
    }
    Err(StorageError::NameExhausted)
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    NameExhausted,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
