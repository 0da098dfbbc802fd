//! 漫画库目录布局：路径解析、名称清洗与存在性检查。

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::config::{CHAPTERS_DIR, MANGAS_DIR};

#[derive(Clone, Debug)]
pub struct Library {
    root: PathBuf,
}

impl Library {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 确保 `<root>/mangas` 存在。
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.mangas_path()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn mangas_path(&self) -> PathBuf {
        self.root.join(MANGAS_DIR)
    }

    pub fn manga_path(&self, name: &str) -> PathBuf {
        self.mangas_path().join(name)
    }

    pub fn chapters_path(&self, name: &str) -> PathBuf {
        self.manga_path(name).join(CHAPTERS_DIR)
    }

    pub fn chapter_path(&self, name: &str, chapter: &str) -> PathBuf {
        self.chapters_path(name).join(chapter)
    }

    /// 新建漫画前检查：目标目录不得已存在。
    pub async fn check_manga_available(&self, name: &str) -> Result<PathBuf, LibraryError> {
        let manga_path = self.manga_path(name);
        if path_exists(&manga_path).await? {
            return Err(LibraryError::MangaExists);
        }
        Ok(manga_path)
    }

    /// 新建章节前检查：漫画必须存在，章节不得已存在。
    pub async fn check_chapter_available(
        &self,
        name: &str,
        chapter: &str,
    ) -> Result<PathBuf, LibraryError> {
        if !path_exists(&self.manga_path(name)).await? {
            return Err(LibraryError::MangaMissing);
        }
        let chapter_path = self.chapter_path(name, chapter);
        if path_exists(&chapter_path).await? {
            return Err(LibraryError::ChapterExists);
        }
        Ok(chapter_path)
    }
}

/// 将提交的漫画名转换为安全的单级目录名。
pub fn sanitize_manga_name(raw: &str) -> Result<String, LibraryError> {
    let name = raw.replace(['/', '\\'], " ");
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || name.contains('\0') {
        return Err(LibraryError::InvalidName);
    }
    Ok(name)
}

/// Renders a chapter number the way folder names were always written:
/// shortest round-trip digits, whole numbers keep one decimal (`1.0`), and
/// magnitudes below `1e-4` or from `1e16` up switch to exponent form
/// (`1e+16`, `1.5e-05`).
pub fn format_chapter_number(number: f64) -> Result<String, LibraryError> {
    if !number.is_finite() || number < 0.0 {
        return Err(LibraryError::InvalidChapterNumber);
    }
    // -0.0 collapses to 0.0
    let number = if number == 0.0 { 0.0 } else { number };

    let scientific = format!("{number:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .ok_or(LibraryError::InvalidChapterNumber)?;
    let exponent: i32 = exponent
        .parse()
        .map_err(|_| LibraryError::InvalidChapterNumber)?;
    if number != 0.0 && !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return Ok(format!("{mantissa}e{sign}{:02}", exponent.abs()));
    }

    let plain = format!("{number}");
    if plain.contains('.') {
        Ok(plain)
    } else {
        Ok(format!("{plain}.0"))
    }
}

/// 备份文件路径：`<backup_root>/<manga>/<file_name>`。
pub fn backup_path(backup_root: &Path, manga_name: &str, file_name: &str) -> PathBuf {
    backup_root.join(manga_name).join(file_name)
}

pub async fn path_exists(path: &Path) -> io::Result<bool> {
    fs::try_exists(path).await
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Manga already exists")]
    MangaExists,
    #[error("Manga doesn't exist")]
    MangaMissing,
    #[error("Chapter already exists")]
    ChapterExists,
    #[error("invalid manga name")]
    InvalidName,
    #[error("invalid chapter number")]
    InvalidChapterNumber,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LibraryError {
    pub fn code(&self) -> &'static str {
        match self {
            LibraryError::MangaExists => "manga_exists",
            LibraryError::MangaMissing => "manga_missing",
            LibraryError::ChapterExists => "chapter_exists",
            LibraryError::InvalidName => "invalid_name",
            LibraryError::InvalidChapterNumber => "invalid_chapter_number",
            LibraryError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn manga_name_slashes_become_spaces() {
        assert_eq!(sanitize_manga_name("a/b").unwrap(), "a b");
        assert_eq!(sanitize_manga_name("..\\x").unwrap(), ".. x");
        assert_eq!(sanitize_manga_name("One Piece").unwrap(), "One Piece");
    }

    #[test]
    fn manga_name_rejects_traversal_and_blank() {
        for raw in ["", "   ", ".", "..", "/", "a\0b"] {
            assert!(
                matches!(sanitize_manga_name(raw), Err(LibraryError::InvalidName)),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn chapter_number_formatting() {
        assert_eq!(format_chapter_number(1.0).unwrap(), "1.0");
        assert_eq!(format_chapter_number(12.0).unwrap(), "12.0");
        assert_eq!(format_chapter_number(1.5).unwrap(), "1.5");
        assert_eq!(format_chapter_number(0.25).unwrap(), "0.25");
        assert_eq!(format_chapter_number(0.0).unwrap(), "0.0");
        assert_eq!(format_chapter_number(-0.0).unwrap(), "0.0");
        assert_eq!(format_chapter_number(0.0001).unwrap(), "0.0001");
        assert_eq!(
            format_chapter_number(1e15).unwrap(),
            "1000000000000000.0"
        );
        assert!(format_chapter_number(-1.0).is_err());
        assert!(format_chapter_number(f64::NAN).is_err());
    }

    #[test]
    fn extreme_chapter_numbers_use_exponent_form() {
        assert_eq!(format_chapter_number(1e16).unwrap(), "1e+16");
        assert_eq!(format_chapter_number(1e-5).unwrap(), "1e-05");
        assert_eq!(format_chapter_number(1.5e-7).unwrap(), "1.5e-07");
        assert_eq!(
            format_chapter_number(123456789012345680.0).unwrap(),
            "1.2345678901234568e+17"
        );
        assert_eq!(format_chapter_number(1e100).unwrap(), "1e+100");
    }

    #[tokio::test]
    async fn chapter_checks_follow_layout() {
        let temp = tempdir().expect("tempdir");
        let library = Library::new(temp.path().to_path_buf());
        library.ensure_root().await.expect("ensure root");

        assert!(matches!(
            library.check_chapter_available("Test", "1.0").await,
            Err(LibraryError::MangaMissing)
        ));

        std::fs::create_dir_all(library.chapter_path("Test", "1.0")).expect("mkdir");
        assert!(matches!(
            library.check_manga_available("Test").await,
            Err(LibraryError::MangaExists)
        ));
        assert!(matches!(
            library.check_chapter_available("Test", "1.0").await,
            Err(LibraryError::ChapterExists)
        ));
        let path = library
            .check_chapter_available("Test", "2.0")
            .await
            .expect("chapter 2 available");
        assert_eq!(path, temp.path().join("mangas/Test/chapters/2.0"));
    }
}
