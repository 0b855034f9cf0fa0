use std::path::PathBuf;

use tokio::time::Duration;

use crate::catalog::CatalogLimits;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_TEMP_DIR: &str = "temp_downloads";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 10 * 60;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_MERGE_OUTPUT_FORMAT: &str = "mp4";
const DEFAULT_STALE_FILE_SECONDS: u64 = 2 * 60 * 60;
const DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub temp_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub engine_timeout: Duration,
    pub max_concurrent_downloads: usize,
    pub max_download_bytes: u64,
    pub merge_output_format: String,
    pub catalog_limits: CatalogLimits,
    pub relax_certificates: bool,
    pub stale_file_seconds: u64,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let number = |name: &str| text(name).and_then(|value| value.parse::<u64>().ok());
        let flag = |name: &str| text(name).and_then(|value| parse_bool(&value));

        let defaults = CatalogLimits::default();

        Self {
            bind_addr: resolve_bind_addr(text("APP_ADDR"), text("PORT")),
            temp_dir: text("TEMP_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            yt_dlp_bin: text("YT_DLP_BIN").unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            engine_timeout: Duration::from_secs(
                number("YT_DLP_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ),
            max_concurrent_downloads: number("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            max_download_bytes: number("MAX_DOWNLOAD_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES),
            merge_output_format: text("MERGE_OUTPUT_FORMAT")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_MERGE_OUTPUT_FORMAT.to_string()),
            catalog_limits: CatalogLimits {
                video: number("VIDEO_FORMAT_LIMIT").map_or(defaults.video, |value| value as usize),
                audio: number("AUDIO_FORMAT_LIMIT").map_or(defaults.audio, |value| value as usize),
            },
            relax_certificates: !flag("STRICT_CERTIFICATES").unwrap_or(false),
            stale_file_seconds: number("STALE_FILE_SECONDS").unwrap_or(DEFAULT_STALE_FILE_SECONDS),
            allowed_origins: text("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .filter(|origins| !origins.is_empty())
                .unwrap_or_else(|| DEV_ORIGINS.iter().map(ToString::to_string).collect()),
        }
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
