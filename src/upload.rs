//! 两步上传处理器：创建记录 → 按令牌上传文件。

use axum::extract::connect_info::ConnectInfo;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Json, Multipart, Path};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::UPLOAD_DIR;
use crate::error::ApiError;
use crate::http::{public_host, upload_url};
use crate::pending::{ChapterCreation, Completion, MangaCreation, PendingUpload};
use crate::pipeline::{PipelineConfig, PipelineError, StagedPayload};
use crate::registry::UploadRegistry;
use crate::storage::Library;

const FALLBACK_FILE_NAME: &str = "upload.bin";

#[derive(Debug)]
pub struct UploadConfig {
    pub public_port: u16,
}

#[derive(Deserialize)]
pub(crate) struct MangaMetadata {
    manga_name: String,
}

#[derive(Deserialize)]
pub(crate) struct ChapterMetadata {
    manga_name: String,
    chapter_number: f64,
}

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    status: &'static str,
    #[serde(flatten)]
    completion: Completion,
}

/// 登记新漫画，返回上传封面用的链接。
pub async fn create_manga(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Extension(library): Extension<Arc<Library>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Json(payload): Json<MangaMetadata>,
) -> Result<String, ApiError> {
    let manga = MangaCreation::new(&library, &payload.manga_name)
        .await
        .inspect_err(|err| warn!(manga = %payload.manga_name, error = %err, "manga rejected"))?;
    let name = manga.name.clone();
    let token = registry.insert(PendingUpload::Manga(manga)).await;
    let pending = registry.len().await;
    info!(
        token = %token,
        manga = %name,
        pending,
        "manga upload registered"
    );

    let host = public_host(&headers, addr.ip());
    Ok(upload_url(&host, upload.public_port, &token))
}

/// 登记新章节，返回上传压缩包用的链接。
pub async fn create_chapter(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Extension(library): Extension<Arc<Library>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Json(payload): Json<ChapterMetadata>,
) -> Result<String, ApiError> {
    let chapter = ChapterCreation::new(&library, &payload.manga_name, payload.chapter_number)
        .await
        .inspect_err(|err| {
            warn!(
                manga = %payload.manga_name,
                chapter = payload.chapter_number,
                error = %err,
                "chapter rejected"
            )
        })?;
    let (name, label) = (chapter.manga_name.clone(), chapter.chapter_label.clone());
    let token = registry.insert(PendingUpload::Chapter(chapter)).await;
    let pending = registry.len().await;
    info!(
        token = %token,
        manga = %name,
        chapter = %label,
        pending,
        "chapter upload registered"
    );

    let host = public_host(&headers, addr.ip());
    Ok(upload_url(&host, upload.public_port, &token))
}

/// 接收令牌对应的文件并执行完成流程；令牌在查询时即失效。
pub async fn upload_payload(
    Path(token): Path<String>,
    Extension(library): Extension<Arc<Library>>,
    Extension(registry): Extension<Arc<UploadRegistry>>,
    Extension(pipeline): Extension<Arc<PipelineConfig>>,
    multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let Some(pending) = registry.take(&token).await else {
        warn!(token = %token, "upload not found");
        return Err(ApiError::upload_not_found());
    };
    let kind = pending.kind();

    let scratch = pipeline
        .create_scratch()
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let result: Result<Completion, PipelineError> = async {
        let payload = stage_payload(multipart, scratch.path()).await?;
        debug!(
            token = %token,
            file = %payload.file_name,
            bytes = payload.size,
            "payload staged"
        );
        pending
            .complete(&library, &pipeline, &payload, scratch.path())
            .await
    }
    .await;
    remove_scratch(scratch).await;

    match result {
        Ok(completion) => {
            info!(token = %token, kind, "upload complete");
            Ok(JsonResponse(UploadResponse {
                status: "ok",
                completion,
            }))
        }
        Err(err) => {
            warn!(token = %token, kind, code = err.code(), error = %err, "upload failed");
            Err(err.into())
        }
    }
}

/// 将上传文件字段流式写入 `scratch/upload/`。
///
/// A field named `data` or `file` wins; otherwise the first field that
/// carries a file name is used.
async fn stage_payload(
    mut multipart: Multipart,
    scratch: &FsPath,
) -> Result<StagedPayload, PipelineError> {
    let upload_dir = scratch.join(UPLOAD_DIR);
    fs::create_dir_all(&upload_dir).await?;

    let mut staged: Option<StagedPayload> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| PipelineError::Payload(err.body_text()))?
    {
        let preferred = matches!(field.name(), Some("data" | "file"));
        if !preferred && (field.file_name().is_none() || staged.is_some()) {
            debug!(field = field.name().unwrap_or("unnamed"), "ignoring form field");
            continue;
        }

        let payload = write_field(field, &upload_dir).await?;
        let previous = staged.replace(payload.clone());
        if let Some(previous) = previous.filter(|previous| previous.path != payload.path) {
            let _ = fs::remove_file(&previous.path).await;
        }
        if preferred {
            break;
        }
    }
    staged.ok_or(PipelineError::MissingPayload)
}

async fn write_field(mut field: Field<'_>, dir: &FsPath) -> Result<StagedPayload, PipelineError> {
    let file_name = sanitize_file_name(field.file_name().unwrap_or(FALLBACK_FILE_NAME));
    let path = dir.join(&file_name);
    let mut file = File::create(&path).await?;
    let mut size: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| PipelineError::Payload(err.body_text()))?
    {
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if size == 0 {
        return Err(PipelineError::Payload("uploaded file is empty".into()));
    }
    Ok(StagedPayload {
        path,
        file_name,
        size,
    })
}

/// 仅保留文件名的最后一段，防止路径穿越。
fn sanitize_file_name(raw: &str) -> String {
    let normalized = raw.replace('\\', "/");
    FsPath::new(&normalized)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_string()
}

async fn remove_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    match tokio::task::spawn_blocking(move || scratch.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(path = ?path, error = %err, "failed to remove scratch dir"),
        Err(err) => warn!(path = ?path, error = %err, "scratch cleanup task failed"),
    }
}
