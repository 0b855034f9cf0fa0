use std::{io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::{
    catalog::StreamDescriptor,
    progress::{ProgressHandle, parse_progress_line},
};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    Failed { message: String },
    #[error("the extraction engine did not finish within {0} seconds")]
    TimedOut(u64),
    #[error("extraction engine {0:?} is not installed")]
    NotInstalled(String),
    #[error("could not run the extraction engine: {0}")]
    Io(#[from] std::io::Error),
    #[error("the extraction engine returned unreadable metadata: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// Options sent with every engine call to reduce upstream rejection.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub headers: Vec<(String, String)>,
    pub relax_certificates: bool,
    pub player_clients: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            headers: vec![
                ("User-Agent".to_string(), BROWSER_USER_AGENT.to_string()),
                ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ],
            relax_certificates: true,
            player_clients: ["ios", "android", "web_embedded"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessing {
    ExtractAudio { codec: String, bitrate_kbps: u32 },
    Merge { container: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub url: String,
    pub selection: String,
    pub output_template: String,
    pub post_processing: Option<PostProcessing>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub duration_label: Option<String>,
    pub platform: Option<String>,
    pub streams: Vec<StreamDescriptor>,
}

/// The external component that talks to video platforms.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_metadata(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<MediaInfo, EngineError>;

    /// Downloads the selected streams and writes the result according to the output template.
    async fn fetch_and_materialize(
        &self,
        request: &ExtractionRequest,
        options: &EngineOptions,
        progress: Option<&ProgressHandle>,
    ) -> Result<(), EngineError>;
}

/// `yt-dlp` driven as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, error: std::io::Error) -> EngineError {
        if error.kind() == ErrorKind::NotFound {
            EngineError::NotInstalled(self.binary.clone())
        } else {
            EngineError::Io(error)
        }
    }
}

#[async_trait]
impl ExtractionEngine for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<MediaInfo, EngineError> {
        let args = metadata_args(url, options);
        debug!("yt-dlp metadata args: {:?}", args);

        let output = timeout(self.timeout, self.command(args).output())
            .await
            .map_err(|_| EngineError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                message: last_error_line(&output.stderr),
            });
        }

        parse_media_info(&output.stdout)
    }

    async fn fetch_and_materialize(
        &self,
        request: &ExtractionRequest,
        options: &EngineOptions,
        progress: Option<&ProgressHandle>,
    ) -> Result<(), EngineError> {
        let args = materialize_args(request, options);
        debug!("yt-dlp download args: {:?}", args);

        let mut child = self
            .command(args)
            .spawn()
            .map_err(|error| self.spawn_error(error))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buffer).await;
            }
            buffer
        });

        let run = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    if let Some(update) = parse_progress_line(&line)
                        && let Some(progress) = progress
                    {
                        progress.apply(update);
                    }
                }
            }
            child.wait().await
        };

        let status = timeout(self.timeout, run)
            .await
            .map_err(|_| EngineError::TimedOut(self.timeout.as_secs()))??;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EngineError::Failed {
                message: last_error_line(&stderr),
            });
        }

        Ok(())
    }
}

fn common_args(options: &EngineOptions) -> Vec<String> {
    let mut args = vec!["--no-playlist".to_string(), "--no-warnings".to_string()];

    if options.relax_certificates {
        args.push("--no-check-certificates".to_string());
    }
    for (name, value) in &options.headers {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }
    if !options.player_clients.is_empty() {
        args.push("--extractor-args".to_string());
        args.push(format!(
            "youtube:player_client={}",
            options.player_clients.join(",")
        ));
    }

    args
}

pub fn metadata_args(url: &str, options: &EngineOptions) -> Vec<String> {
    let mut args = vec!["-J".to_string()];
    args.extend(common_args(options));
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

pub fn materialize_args(request: &ExtractionRequest, options: &EngineOptions) -> Vec<String> {
    let mut args = common_args(options);
    args.extend([
        "--newline".to_string(),
        "--no-mtime".to_string(),
        "-o".to_string(),
        request.output_template.clone(),
        "-f".to_string(),
        request.selection.clone(),
    ]);

    match &request.post_processing {
        Some(PostProcessing::ExtractAudio {
            codec,
            bitrate_kbps,
        }) => {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                codec.clone(),
                "--audio-quality".to_string(),
                format!("{bitrate_kbps}K"),
            ]);
        }
        Some(PostProcessing::Merge { container }) => {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        None => {}
    }

    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

fn last_error_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    duration_string: Option<String>,
    extractor_key: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    resolution: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    format_note: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    abr: Option<f64>,
}

impl From<YtDlpFormat> for StreamDescriptor {
    fn from(format: YtDlpFormat) -> Self {
        let has_video = has_codec(format.vcodec.as_deref());
        let has_audio = has_codec(format.acodec.as_deref());
        let resolution = format.resolution.or_else(|| match (format.width, format.height) {
            (Some(width), Some(height)) => Some(format!("{width}x{height}")),
            (None, Some(height)) => Some(format!("{height}p")),
            _ => None,
        });

        Self {
            id: format.format_id,
            ext: format.ext.unwrap_or_else(|| "mp4".to_string()),
            resolution,
            filesize: format.filesize,
            filesize_approx: format.filesize_approx,
            note: format.format_note.unwrap_or_default(),
            has_video,
            has_audio,
            abr: format.abr,
        }
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

pub fn parse_media_info(stdout: &[u8]) -> Result<MediaInfo, EngineError> {
    let info: YtDlpVideoInfo = serde_json::from_slice(stdout)?;

    Ok(MediaInfo {
        title: info.title.filter(|value| !value.trim().is_empty()),
        thumbnail: info.thumbnail,
        duration_seconds: info.duration,
        duration_label: info.duration_string,
        platform: info.extractor_key,
        streams: info.formats.into_iter().map(StreamDescriptor::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "title": "Sample clip",
        "thumbnail": "https://i.ytimg.com/vi/x/hq.jpg",
        "duration": 212.0,
        "duration_string": "3:32",
        "extractor_key": "Youtube",
        "formats": [
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "resolution": "48x27"},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "resolution": "audio only", "abr": 129.4, "filesize": 3437852},
            {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none", "width": 1920, "height": 1080, "filesize_approx": 80000000.5}
        ]
    }"#;

    #[test]
    fn parses_metadata_into_descriptors() {
        let info = parse_media_info(SAMPLE.as_bytes()).expect("valid metadata");

        assert_eq!(info.title.as_deref(), Some("Sample clip"));
        assert_eq!(info.duration_seconds, Some(212.0));
        assert_eq!(info.platform.as_deref(), Some("Youtube"));
        assert_eq!(info.streams.len(), 3);

        let storyboard = &info.streams[0];
        assert!(!storyboard.has_video && !storyboard.has_audio);

        let audio = &info.streams[1];
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.filesize, Some(3437852.0));

        let video = &info.streams[2];
        assert!(video.has_video && !video.has_audio);
        assert_eq!(video.resolution.as_deref(), Some("1920x1080"));
    }

    #[test]
    fn rejects_unreadable_metadata() {
        assert!(matches!(
            parse_media_info(b"not json"),
            Err(EngineError::InvalidOutput(_))
        ));
    }

    #[test]
    fn materialize_args_for_audio_conversion() {
        let request = ExtractionRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            selection: "bestaudio/best".to_string(),
            output_template: "/tmp/jobs/tok.%(ext)s".to_string(),
            post_processing: Some(PostProcessing::ExtractAudio {
                codec: "mp3".to_string(),
                bitrate_kbps: 128,
            }),
        };

        let args = materialize_args(&request, &EngineOptions::default());
        let joined = args.join(" ");

        assert!(joined.contains("-f bestaudio/best"));
        assert!(joined.contains("-x --audio-format mp3 --audio-quality 128K"));
        assert!(joined.contains("-o /tmp/jobs/tok.%(ext)s"));
        assert!(joined.contains("--no-check-certificates"));
        assert!(joined.contains("youtube:player_client=ios,android,web_embedded"));
        assert_eq!(args.last().map(String::as_str), Some(request.url.as_str()));
        assert!(!joined.contains("--merge-output-format"));
    }

    #[test]
    fn materialize_args_for_merge() {
        let request = ExtractionRequest {
            url: "https://example.com/v".to_string(),
            selection: "137+bestaudio/best".to_string(),
            output_template: "out/tok.%(ext)s".to_string(),
            post_processing: Some(PostProcessing::Merge {
                container: "mp4".to_string(),
            }),
        };
        let options = EngineOptions {
            relax_certificates: false,
            player_clients: Vec::new(),
            ..EngineOptions::default()
        };

        let args = materialize_args(&request, &options);
        let joined = args.join(" ");

        assert!(joined.contains("--merge-output-format mp4"));
        assert!(args.iter().any(|arg| arg == "--no-mtime"));
        assert!(!joined.contains("--no-check-certificates"));
        assert!(!joined.contains("--extractor-args"));
        assert!(joined.contains("--add-header Accept-Language:en-US,en;q=0.9"));
    }

    #[test]
    fn metadata_args_end_with_url() {
        let args = metadata_args("https://example.com/v", &EngineOptions::default());
        assert_eq!(args.first().map(String::as_str), Some("-J"));
        assert!(!args.iter().any(|arg| arg == "--no-mtime"));
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args[args.len() - 1], "https://example.com/v");
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let engine = YtDlp::new("vidgrab-no-such-binary", Duration::from_secs(5));
        let result = engine
            .fetch_metadata("https://example.com/v", &EngineOptions::default())
            .await;

        assert!(matches!(result, Err(EngineError::NotInstalled(_))));
    }
}
