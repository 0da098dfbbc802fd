//! CLI arguments, environment configuration and server defaults.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const MANGAS_DIR: &str = "mangas";
pub const CHAPTERS_DIR: &str = "chapters";
pub const PAGES_DIR: &str = "pages";
pub const COVER_STEM: &str = "cover";
pub const EXTRACT_DIR: &str = "extracted";
pub const UPLOAD_DIR: &str = "upload";
pub const NORMALIZED_JPEG_QUALITY: u8 = 100;
pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_PUBLIC_PORT: u16 = 8000;
pub const DEFAULT_REGISTRY_CAPACITY: usize = 100;
pub const DEFAULT_REGISTRY_TTL_SECS: u64 = 600;
pub const DEFAULT_SUPPORTED_IMG_TYPES: &str = ".jpg,.jpeg,.png,.webp,.gif,.bmp";
pub const DEFAULT_CONVERTER: &str = "./avif_converter";
pub const DEFAULT_CONVERTER_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONVERT_JOBS: usize = 1;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const REGISTRY_PRUNE_INTERVAL_SECS: u64 = 60;

/// Fatal startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backup path missing: set BACKUPS_PATH when MAKE_BACKUP is enabled")]
    BackupRootMissing,
    #[error("registry capacity must be greater than zero")]
    ZeroRegistryCapacity,
    #[error("no supported image types configured")]
    NoImageTypes,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "manga-uploader",
    version,
    about = "Manga archive upload server"
)]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "MANGAS_ABSOLUTE_PATH",
        help = "Root directory that holds the mangas/ tree"
    )]
    pub root: PathBuf,
    #[arg(
        long,
        env = "MAKE_BACKUP",
        action = clap::ArgAction::Set,
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new(),
        help = "Copy every uploaded chapter archive into the backup tree"
    )]
    pub make_backup: bool,
    #[arg(long, env = "BACKUPS_PATH", help = "Backup root for original archives")]
    pub backup_root: Option<PathBuf>,
    #[arg(
        long,
        env = "SUPPORTED_IMG_TYPES",
        default_value = DEFAULT_SUPPORTED_IMG_TYPES,
        value_delimiter = ',',
        help = "Comma separated image suffixes kept from archives"
    )]
    pub supported_img_types: Vec<String>,
    #[arg(
        long,
        env = "AVIF_CONVERTER",
        default_value = DEFAULT_CONVERTER,
        help = "External page converter invoked as <converter> <input> <output>"
    )]
    pub converter: PathBuf,
    #[arg(
        long = "converter-arg",
        env = "AVIF_CONVERTER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        help = "Extra arguments passed to the converter before the paths"
    )]
    pub converter_args: Vec<String>,
    #[arg(
        long,
        env = "CONVERTER_TIMEOUT_SECS",
        default_value_t = DEFAULT_CONVERTER_TIMEOUT_SECS,
        help = "Converter timeout per page in seconds"
    )]
    pub converter_timeout_secs: u64,
    #[arg(
        long,
        env = "CONVERT_JOBS",
        default_value_t = DEFAULT_CONVERT_JOBS,
        help = "Pages converted in parallel (1 is sequential)"
    )]
    pub convert_jobs: usize,
    #[arg(long, env = "SCRATCH_DIR", help = "Parent directory for pipeline scratch dirs")]
    pub scratch_dir: Option<PathBuf>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "MANGA_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "MANGA_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "MANGA_PUBLIC_PORT",
        default_value_t = DEFAULT_PUBLIC_PORT,
        help = "Port written into returned upload URLs"
    )]
    pub public_port: u16,
    #[arg(
        long,
        env = "REGISTRY_CAPACITY",
        default_value_t = DEFAULT_REGISTRY_CAPACITY,
        help = "Max pending uploads kept in memory"
    )]
    pub registry_capacity: usize,
    #[arg(
        long,
        env = "REGISTRY_TTL_SECS",
        default_value_t = DEFAULT_REGISTRY_TTL_SECS,
        help = "Pending upload lifetime in seconds"
    )]
    pub registry_ttl_secs: u64,
    #[arg(
        long,
        env = "UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload body size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(long, env = "CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    /// Checks cross-field requirements that clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.make_backup && self.backup_root.is_none() {
            return Err(ConfigError::BackupRootMissing);
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::ZeroRegistryCapacity);
        }
        if normalize_suffixes(&self.supported_img_types).is_empty() {
            return Err(ConfigError::NoImageTypes);
        }
        Ok(())
    }

    /// Backup root, only when backups are enabled.
    pub fn effective_backup_root(&self) -> Option<PathBuf> {
        if self.make_backup {
            self.backup_root.clone()
        } else {
            None
        }
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    pub fn converter_timeout(&self) -> Duration {
        Duration::from_secs(self.converter_timeout_secs)
    }
}

/// Lowercases suffixes and ensures a leading dot; blanks are dropped.
pub fn normalize_suffixes(raw: &[String]) -> Vec<String> {
    let mut suffixes: Vec<String> = raw
        .iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != ".")
        .map(|value| {
            if value.starts_with('.') {
                value
            } else {
                format!(".{value}")
            }
        })
        .collect();
    suffixes.sort();
    suffixes.dedup();
    suffixes
}
