//! 临时写入与原子替换的辅助方法（文件与目录）。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let temp_path = sibling_temp_path(target)?;
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

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> io::Result<()> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

/// 在目标目录旁构建的暂存目录，完成后整体改名发布。
///
/// The target must not exist when publishing; an existing target is reported
/// as [`io::ErrorKind::AlreadyExists`] and the staged content is discarded.
#[derive(Debug)]
pub struct StagedDir {
    target: PathBuf,
    temp_path: PathBuf,
}

impl StagedDir {
    /// 创建暂存目录（父目录必须已存在）。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let temp_path = sibling_temp_path(target)?;
        fs::create_dir(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    /// 删除暂存目录及其内容。
    pub async fn cleanup(self) {
        let _ = fs::remove_dir_all(&self.temp_path).await;
    }

    /// 将暂存目录改名为目标目录。
    pub async fn finalize(self) -> io::Result<()> {
        if fs::try_exists(&self.target).await? {
            self.cleanup().await;
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "target directory already exists",
            ));
        }
        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            self.cleanup().await;
            return Err(err);
        }
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

fn sibling_temp_path(target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| "entry".into());
    Ok(parent.join(format!(".{base}.tmp.{}", Uuid::new_v4())))
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
