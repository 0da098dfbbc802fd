//! 待上传记录：创建漫画 / 创建章节两种变体及其完成流程。

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::atomic::StagedDir;
use crate::config::{CHAPTERS_DIR, COVER_STEM};
use crate::pipeline::{PipelineConfig, PipelineError, StagedPayload, run_chapter_pipeline};
use crate::storage::{Library, LibraryError, format_chapter_number, sanitize_manga_name};

/// A validated request waiting for its binary payload.
#[derive(Debug, Clone)]
pub enum PendingUpload {
    Manga(MangaCreation),
    Chapter(ChapterCreation),
}

#[derive(Debug, Clone)]
pub struct MangaCreation {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ChapterCreation {
    pub manga_name: String,
    pub chapter_number: f64,
    pub chapter_label: String,
    pub chapter_path: PathBuf,
}

/// 完成后的结果描述，直接作为响应体的一部分返回。
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Completion {
    Manga {
        manga_name: String,
        cover: String,
    },
    Chapter {
        manga_name: String,
        chapter_number: f64,
        pages: usize,
    },
}

impl PendingUpload {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingUpload::Manga(_) => "manga",
            PendingUpload::Chapter(_) => "chapter",
        }
    }

    /// 使用已落盘的上传文件完成记录。
    pub async fn complete(
        &self,
        library: &Library,
        pipeline: &PipelineConfig,
        payload: &StagedPayload,
        scratch: &Path,
    ) -> Result<Completion, PipelineError> {
        match self {
            PendingUpload::Manga(manga) => manga.build_tree(library, payload).await,
            PendingUpload::Chapter(chapter) => {
                let pages =
                    run_chapter_pipeline(library, pipeline, chapter, payload, scratch).await?;
                Ok(Completion::Chapter {
                    manga_name: chapter.manga_name.clone(),
                    chapter_number: chapter.chapter_number,
                    pages,
                })
            }
        }
    }
}

impl MangaCreation {
    /// 校验漫画名并确认目录尚不存在。
    pub async fn new(library: &Library, raw_name: &str) -> Result<Self, LibraryError> {
        let name = sanitize_manga_name(raw_name)?;
        library.check_manga_available(&name).await?;
        Ok(Self { name })
    }

    /// 创建 `mangas/<name>/`、`chapters/` 子目录并保存封面。
    async fn build_tree(
        &self,
        library: &Library,
        cover: &StagedPayload,
    ) -> Result<Completion, PipelineError> {
        let extension = sniff_image_extension(&cover.path)
            .await?
            .ok_or(PipelineError::InvalidCover)?;
        let cover_name = format!("{COVER_STEM}.{extension}");

        let target = library.check_manga_available(&self.name).await?;
        let staged = StagedDir::new(&target).await?;
        let built: io::Result<()> = async {
            fs::create_dir(staged.path().join(CHAPTERS_DIR)).await?;
            fs::copy(&cover.path, staged.path().join(&cover_name)).await?;
            Ok(())
        }
        .await;
        if let Err(err) = built {
            staged.cleanup().await;
            return Err(err.into());
        }

        staged.finalize().await.map_err(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => PipelineError::Library(LibraryError::MangaExists),
            _ => PipelineError::Io(err),
        })?;

        info!(manga = %self.name, cover = %cover_name, "manga created");
        Ok(Completion::Manga {
            manga_name: self.name.clone(),
            cover: cover_name,
        })
    }
}

impl ChapterCreation {
    /// 校验漫画存在且章节尚不存在。
    pub async fn new(
        library: &Library,
        raw_name: &str,
        chapter_number: f64,
    ) -> Result<Self, LibraryError> {
        let manga_name = sanitize_manga_name(raw_name)?;
        let chapter_label = format_chapter_number(chapter_number)?;
        let chapter_path = library
            .check_chapter_available(&manga_name, &chapter_label)
            .await?;
        Ok(Self {
            manga_name,
            chapter_number,
            chapter_label,
            chapter_path,
        })
    }
}

/// 根据文件头判断图片格式，返回规范扩展名。
async fn sniff_image_extension(path: &Path) -> io::Result<Option<&'static str>> {
    let mut header = Vec::with_capacity(64);
    File::open(path).await?.take(64).read_to_end(&mut header).await?;
    Ok(image::guess_format(&header)
        .ok()
        .and_then(|format| format.extensions_str().first().copied()))
}
