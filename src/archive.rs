//! 压缩包格式识别与解压（zip/cbz、tar/cbt、tar.gz）。

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::pipeline::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// 优先按文件头识别，无法识别时退回扩展名。
    pub fn detect(header: &[u8], file_name: &str) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Some(ArchiveFormat::Zip);
        }
        if header.starts_with(&[0x1f, 0x8b]) {
            return Some(ArchiveFormat::TarGz);
        }
        if header.len() >= 262 && &header[257..262] == b"ustar" {
            return Some(ArchiveFormat::Tar);
        }

        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Some(ArchiveFormat::TarGz);
        }
        match Path::new(&lower).extension().and_then(|ext| ext.to_str()) {
            Some("zip" | "cbz") => Some(ArchiveFormat::Zip),
            Some("tar" | "cbt") => Some(ArchiveFormat::Tar),
            _ => None,
        }
    }
}

/// 将压缩包解压到 `dest`，返回解压目录。
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<PathBuf, PipelineError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|err| PipelineError::Task(err.to_string()))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<PathBuf, PipelineError> {
    let file_name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut header = Vec::with_capacity(512);
    File::open(archive)?.take(512).read_to_end(&mut header)?;
    let format = ArchiveFormat::detect(&header, &file_name)
        .ok_or_else(|| PipelineError::UnsupportedArchive(file_name.clone()))?;

    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|err| PipelineError::Extract(err.to_string()))?;
            zip.extract(dest)
                .map_err(|err| PipelineError::Extract(err.to_string()))?;
        }
        ArchiveFormat::Tar => {
            tar::Archive::new(file)
                .unpack(dest)
                .map_err(|err| PipelineError::Extract(err.to_string()))?;
        }
        ArchiveFormat::TarGz => {
            tar::Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .map_err(|err| PipelineError::Extract(err.to_string()))?;
        }
    }

    info!(archive = %file_name, format = ?format, "archive extracted");
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = zip::write::FileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).expect("start file");
                writer.write_all(data).expect("write entry");
            }
            writer.finish().expect("finish zip");
        }
        buffer
    }

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *data)
                .expect("append entry");
        }
        builder.into_inner().expect("finish tar")
    }

    #[test]
    fn detect_prefers_magic_over_extension() {
        let zip = zip_bytes(&[("a.png", b"x")]);
        assert_eq!(
            ArchiveFormat::detect(&zip, "chapter.tar"),
            Some(ArchiveFormat::Zip)
        );
        let tar = tar_bytes(&[("a.png", b"x")]);
        assert_eq!(
            ArchiveFormat::detect(&tar[..512], "chapter.bin"),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(
            ArchiveFormat::detect(&[0x1f, 0x8b, 0x08], "x"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::detect(b"", "Chapter 1.CBZ"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::detect(b"Rar!\x1a\x07", "chapter.rar"), None);
    }

    #[tokio::test]
    async fn extracts_nested_zip_entries() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("chapter.cbz");
        std::fs::write(
            &archive,
            zip_bytes(&[("vol/page1.png", b"one"), ("page2.png", b"two")]),
        )
        .expect("write archive");

        let dest = temp.path().join("extracted");
        let extracted = extract_archive(&archive, &dest).await.expect("extract");
        assert_eq!(extracted, dest);
        assert_eq!(std::fs::read(dest.join("vol/page1.png")).unwrap(), b"one");
        assert_eq!(std::fs::read(dest.join("page2.png")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn extracts_gzipped_tar() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("chapter.tar.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&tar_bytes(&[("page1.png", b"one")]))
            .expect("gzip");
        std::fs::write(&archive, encoder.finish().expect("finish gzip")).expect("write");

        let dest = temp.path().join("extracted");
        extract_archive(&archive, &dest).await.expect("extract");
        assert_eq!(std::fs::read(dest.join("page1.png")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("chapter.rar");
        std::fs::write(&archive, b"Rar!\x1a\x07\x00garbage").expect("write");

        let err = extract_archive(&archive, &temp.path().join("extracted"))
            .await
            .expect_err("rar is unsupported");
        assert!(matches!(err, PipelineError::UnsupportedArchive(name) if name == "chapter.rar"));
    }

    #[tokio::test]
    async fn corrupt_zip_fails_extraction() {
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("chapter.zip");
        std::fs::write(&archive, b"PK\x03\x04truncated").expect("write");

        let err = extract_archive(&archive, &temp.path().join("extracted"))
            .await
            .expect_err("corrupt zip");
        assert_eq!(err.code(), "extract_failed");
    }
}
