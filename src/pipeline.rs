//! 章节处理流水线：解压 → 过滤 → 规范化 → 外部转换 → 备份 → 发布。

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info};

use crate::archive::extract_archive;
use crate::atomic::{AtomicFile, StagedDir};
use crate::config::{Args, EXTRACT_DIR, PAGES_DIR, normalize_suffixes};
use crate::converter::Converter;
use crate::pages::{collect_pages, normalize_pages};
use crate::pending::ChapterCreation;
use crate::storage::{Library, LibraryError, backup_path, path_exists};

const SCRATCH_PREFIX: &str = "manga-upload-";

/// Immutable pipeline settings shared by every upload.
#[derive(Debug)]
pub struct PipelineConfig {
    pub supported_suffixes: Vec<String>,
    pub converter: Converter,
    pub convert_jobs: usize,
    pub backup_root: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            supported_suffixes: normalize_suffixes(&args.supported_img_types),
            converter: Converter::new(
                args.converter.clone(),
                args.converter_args.clone(),
                args.converter_timeout(),
            ),
            convert_jobs: args.convert_jobs.max(1),
            backup_root: args.effective_backup_root(),
            scratch_dir: args.scratch_dir.clone(),
        }
    }

    /// 为一次上传创建私有的临时工作目录。
    pub fn create_scratch(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        match &self.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

/// 已落盘的上传文件。
#[derive(Debug, Clone)]
pub struct StagedPayload {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no file found in upload body")]
    MissingPayload,
    #[error("invalid upload body: {0}")]
    Payload(String),
    #[error("cover is not a recognized image")]
    InvalidCover,
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("failed to extract archive: {0}")]
    Extract(String),
    #[error("archive contains no supported images")]
    NoPages,
    #[error("failed to convert image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to start converter {program}: {source}")]
    ConverterSpawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("converter failed on {page} ({status}): {stderr}")]
    ConverterFailed {
        page: String,
        status: String,
        stderr: String,
    },
    #[error("converter timed out on {page} after {secs}s")]
    ConverterTimeout { page: String, secs: u64 },
    #[error("backup failed: {0}")]
    Backup(#[source] io::Error),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::MissingPayload => "missing_payload",
            PipelineError::Payload(_) => "invalid_payload",
            PipelineError::InvalidCover => "invalid_cover",
            PipelineError::UnsupportedArchive(_) => "unsupported_archive",
            PipelineError::Extract(_) => "extract_failed",
            PipelineError::NoPages => "no_pages",
            PipelineError::Image { .. } => "image_failed",
            PipelineError::ConverterSpawn { .. } | PipelineError::ConverterFailed { .. } => {
                "converter_failed"
            }
            PipelineError::ConverterTimeout { .. } => "converter_timeout",
            PipelineError::Backup(_) => "backup_failed",
            PipelineError::Library(err) => err.code(),
            PipelineError::Io(_) => "io_error",
            PipelineError::Task(_) => "internal_error",
        }
    }
}

/// 运行完整章节流水线，返回转换的页数。
///
/// Output is assembled next to the chapter folder and renamed into place only
/// when every page converted (and the optional backup succeeded), so a failed
/// run never leaves a partial chapter behind.
pub async fn run_chapter_pipeline(
    library: &Library,
    config: &PipelineConfig,
    chapter: &ChapterCreation,
    payload: &StagedPayload,
    scratch: &Path,
) -> Result<usize, PipelineError> {
    let extracted = extract_archive(&payload.path, &scratch.join(EXTRACT_DIR)).await?;
    let pages = collect_pages(&extracted, &config.supported_suffixes).await?;
    if pages.is_empty() {
        return Err(PipelineError::NoPages);
    }
    debug!(
        manga = %chapter.manga_name,
        chapter = %chapter.chapter_label,
        count = pages.len(),
        "pages selected"
    );

    let normalized = normalize_pages(pages, &scratch.join(PAGES_DIR)).await?;

    if !path_exists(&library.chapters_path(&chapter.manga_name)).await? {
        return Err(LibraryError::MangaMissing.into());
    }
    let staged = StagedDir::new(&chapter.chapter_path).await?;
    let prepared: Result<usize, PipelineError> = async {
        let out_dir = staged.path().join(PAGES_DIR);
        fs::create_dir(&out_dir).await?;
        let converted =
            convert_pages(&config.converter, &normalized, &out_dir, config.convert_jobs).await?;
        if let Some(backup_root) = &config.backup_root {
            make_backup(backup_root, &chapter.manga_name, payload).await?;
        }
        Ok(converted)
    }
    .await;

    let converted = match prepared {
        Ok(value) => value,
        Err(err) => {
            staged.cleanup().await;
            return Err(err);
        }
    };

    staged.finalize().await.map_err(|err| match err.kind() {
        io::ErrorKind::AlreadyExists => PipelineError::Library(LibraryError::ChapterExists),
        _ => PipelineError::Io(err),
    })?;

    info!(
        manga = %chapter.manga_name,
        chapter = %chapter.chapter_label,
        pages = converted,
        "chapter published"
    );
    Ok(converted)
}

async fn convert_pages(
    converter: &Converter,
    pages: &[PathBuf],
    out_dir: &Path,
    jobs: usize,
) -> Result<usize, PipelineError> {
    let mut tasks: Vec<BoxFuture<'_, Result<(), PipelineError>>> = Vec::with_capacity(pages.len());
    for page in pages {
        let Some(file_name) = page.file_name() else {
            return Err(PipelineError::Task(format!("page without file name: {page:?}")));
        };
        let output = out_dir.join(file_name);
        tasks.push(async move { converter.convert(page, &output).await }.boxed());
    }

    stream::iter(tasks)
        .buffer_unordered(jobs.max(1))
        .try_collect::<Vec<()>>()
        .await?;
    Ok(pages.len())
}

/// 备份原始压缩包到 `<backup_root>/<manga>/<file_name>`。
async fn make_backup(
    backup_root: &Path,
    manga_name: &str,
    payload: &StagedPayload,
) -> Result<(), PipelineError> {
    let target = backup_path(backup_root, manga_name, &payload.file_name);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(PipelineError::Backup)?;
    }

    let mut atomic = AtomicFile::new(&target)
        .await
        .map_err(PipelineError::Backup)?;
    let copied = async {
        let mut source = File::open(&payload.path).await?;
        tokio::io::copy(&mut source, atomic.file_mut()).await
    }
    .await;
    if let Err(err) = copied {
        atomic.cleanup().await;
        return Err(PipelineError::Backup(err));
    }
    atomic.finalize().await.map_err(PipelineError::Backup)?;

    info!(path = ?target, bytes = payload.size, "archive backed up");
    Ok(())
}
