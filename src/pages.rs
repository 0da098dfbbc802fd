//! 页面筛选与 JPEG 规范化。

use image::ImageReader;
use image::codecs::jpeg::JpegEncoder;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::NORMALIZED_JPEG_QUALITY;
use crate::pipeline::PipelineError;

const MACOS_METADATA_DIR: &str = "__MACOSX";

/// Recursively lists files under `root` whose suffix is supported, sorted by path.
pub async fn collect_pages(root: &Path, suffixes: &[String]) -> Result<Vec<PathBuf>, PipelineError> {
    let root = root.to_path_buf();
    let suffixes = suffixes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, PipelineError> {
        let mut files = Vec::new();
        walk_files(&root, &mut files)?;
        let total = files.len();
        let mut pages: Vec<PathBuf> = files
            .into_iter()
            .filter(|path| has_supported_suffix(path, &suffixes))
            .collect();
        pages.sort();
        debug!(total, kept = pages.len(), "filtered extracted files");
        Ok(pages)
    })
    .await
    .map_err(|err| PipelineError::Task(err.to_string()))?
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == MACOS_METADATA_DIR {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// 判断文件后缀（忽略大小写）是否在支持列表中。
pub fn has_supported_suffix(path: &Path, suffixes: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    suffixes.iter().any(|candidate| *candidate == suffix)
}

/// 将每个页面重新编码为最高质量 JPEG，写入 `out_dir/<stem>.jpg`。
pub async fn normalize_pages(
    pages: Vec<PathBuf>,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, PipelineError> {
    let out_dir = out_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(&out_dir)?;
        let mut used = HashSet::new();
        let mut normalized = Vec::with_capacity(pages.len());
        for page in &pages {
            let name = unique_name(&page_stem(page), &mut used);
            let target = out_dir.join(format!("{name}.jpg"));
            encode_jpeg(page, &target)?;
            normalized.push(target);
        }
        Ok(normalized)
    })
    .await
    .map_err(|err| PipelineError::Task(err.to_string()))?
}

/// File name up to its first dot: `page1.v2.png` becomes `page1`.
fn page_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split('.').next() {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => "page".to_string(),
    }
}

fn unique_name(stem: &str, used: &mut HashSet<String>) -> String {
    if used.insert(stem.to_string()) {
        return stem.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{stem}-{counter}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn encode_jpeg(input: &Path, output: &Path) -> Result<(), PipelineError> {
    let image_error = |source: image::ImageError| PipelineError::Image {
        path: input.display().to_string(),
        source,
    };
    let decoded = ImageReader::open(input)?
        .with_guessed_format()?
        .decode()
        .map_err(image_error)?;
    let rgb = decoded.to_rgb8();

    let mut writer = BufWriter::new(fs::File::create(output)?);
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut writer, NORMALIZED_JPEG_QUALITY);
        encoder.encode_image(&rgb).map_err(image_error)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use tempfile::tempdir;

    fn suffixes() -> Vec<String> {
        vec![".jpg".into(), ".png".into()]
    }

    fn write_png(path: &Path) {
        let image = RgbaImage::from_pixel(8, 12, Rgba([200, 10, 10, 128]));
        image.save_with_format(path, ImageFormat::Png).expect("save png");
    }

    #[test]
    fn suffix_match_ignores_case() {
        let suffixes = suffixes();
        assert!(has_supported_suffix(Path::new("a/b/PAGE1.PNG"), &suffixes));
        assert!(has_supported_suffix(Path::new("page1.jpg"), &suffixes));
        assert!(!has_supported_suffix(Path::new("notes.txt"), &suffixes));
        assert!(!has_supported_suffix(Path::new("README"), &suffixes));
    }

    #[test]
    fn stems_split_at_first_dot_and_stay_unique() {
        assert_eq!(page_stem(Path::new("x/page1.v2.png")), "page1");
        let mut used = HashSet::new();
        assert_eq!(unique_name("page1", &mut used), "page1");
        assert_eq!(unique_name("page1", &mut used), "page1-2");
        assert_eq!(unique_name("page1", &mut used), "page1-3");
    }

    #[tokio::test]
    async fn collect_skips_unsupported_and_metadata_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("vol1")).unwrap();
        std::fs::create_dir_all(root.join("__MACOSX/vol1")).unwrap();
        std::fs::write(root.join("vol1/page2.png"), b"x").unwrap();
        std::fs::write(root.join("page1.JPG"), b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();
        std::fs::write(root.join(".DS_Store.png"), b"x").unwrap();
        std::fs::write(root.join("__MACOSX/vol1/._page2.png"), b"x").unwrap();

        let pages = collect_pages(root, &suffixes()).await.expect("collect");
        assert_eq!(pages, vec![root.join("page1.JPG"), root.join("vol1/page2.png")]);
    }

    #[tokio::test]
    async fn normalize_writes_decodable_jpegs() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("page1.png");
        write_png(&input);

        let out_dir = temp.path().join("pages");
        let outputs = normalize_pages(vec![input], &out_dir).await.expect("normalize");
        assert_eq!(outputs, vec![out_dir.join("page1.jpg")]);

        let reread = image::open(&outputs[0]).expect("decode jpeg");
        assert_eq!((reread.width(), reread.height()), (8, 12));
        assert_eq!(
            image::ImageFormat::from_path(&outputs[0]).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[tokio::test]
    async fn corrupt_image_is_an_image_error() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("page1.png");
        std::fs::write(&input, b"definitely not a png").unwrap();

        let err = normalize_pages(vec![input], &temp.path().join("pages"))
            .await
            .expect_err("corrupt");
        assert_eq!(err.code(), "image_failed");
    }
}
