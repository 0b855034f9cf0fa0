use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catalog::{AUDIO_CONVERSION_EXT, FormatCategory, FormatIndex, audio_conversion_bitrate},
    engine::{
        EngineError, EngineOptions, ExtractionEngine, ExtractionRequest, MediaInfo, PostProcessing,
    },
    progress::ProgressHandle,
};

const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".frag"];
const FALLBACK_EXT: &str = "bin";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("format selection {0:?} is not available")]
    InvalidSelection(String),
    #[error(transparent)]
    Extraction(#[from] EngineError),
    #[error("no output file found for job {token}")]
    ArtifactNotFound { token: String },
    #[error("artifact of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("scratch storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// One download request, from format choice to finished file.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub format_id: String,
    pub token: String,
    pub formats: FormatIndex,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, format_id: impl Into<String>, formats: FormatIndex) -> Self {
        Self {
            url: url.into(),
            format_id: format_id.into(),
            token: Uuid::new_v4().simple().to_string(),
            formats,
        }
    }

    pub fn output_template(&self, output_dir: &Path) -> String {
        format!("{}/{}.%(ext)s", output_dir.to_string_lossy(), self.token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub selection: String,
    pub post_processing: Option<PostProcessing>,
    pub expected_ext: Option<String>,
}

/// Maps a catalog identifier onto the stream selection and post-processing for the engine.
pub fn plan_extraction(
    format_id: &str,
    formats: &FormatIndex,
    merge_container: &str,
) -> Result<ExtractionPlan, DownloadError> {
    let format_id = format_id.trim();
    if format_id.is_empty() {
        return Err(DownloadError::InvalidSelection(String::new()));
    }

    if let Some(bitrate_kbps) = audio_conversion_bitrate(format_id) {
        return Ok(ExtractionPlan {
            selection: "bestaudio/best".to_string(),
            post_processing: Some(PostProcessing::ExtractAudio {
                codec: AUDIO_CONVERSION_EXT.to_string(),
                bitrate_kbps,
            }),
            expected_ext: Some(AUDIO_CONVERSION_EXT.to_string()),
        });
    }

    match formats.category(format_id) {
        Some(FormatCategory::Video) => Ok(ExtractionPlan {
            selection: format!("{format_id}+bestaudio/best"),
            post_processing: Some(PostProcessing::Merge {
                container: merge_container.to_string(),
            }),
            expected_ext: Some(merge_container.to_string()),
        }),
        Some(FormatCategory::Audio) => Ok(ExtractionPlan {
            selection: format_id.to_string(),
            post_processing: None,
            expected_ext: None,
        }),
        None => Err(DownloadError::InvalidSelection(format_id.to_string())),
    }
}

/// A finished file in scratch storage. Dropping it deletes the file.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    ext: String,
    size: u64,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        // May run outside a tokio runtime, so the unlink is synchronous.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed artifact {:?}", self.path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove artifact {:?}: {error}", self.path),
        }
    }
}

pub struct Orchestrator {
    engine: Arc<dyn ExtractionEngine>,
    options: EngineOptions,
    output_dir: PathBuf,
    merge_container: String,
    max_artifact_bytes: u64,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        options: EngineOptions,
        output_dir: impl Into<PathBuf>,
        merge_container: impl Into<String>,
        max_artifact_bytes: u64,
    ) -> Self {
        Self {
            engine,
            options,
            output_dir: output_dir.into(),
            merge_container: merge_container.into(),
            max_artifact_bytes,
        }
    }

    pub async fn fetch_metadata(&self, url: &str) -> Result<MediaInfo, EngineError> {
        self.engine.fetch_metadata(url, &self.options).await
    }

    /// Runs the engine for `job` and returns the file it produced.
    ///
    /// On failure every file carrying the job's token is removed before returning.
    pub async fn execute(
        &self,
        job: &DownloadJob,
        progress: Option<&ProgressHandle>,
    ) -> Result<Artifact, DownloadError> {
        let plan = plan_extraction(&job.format_id, &job.formats, &self.merge_container)?;
        let request = ExtractionRequest {
            url: job.url.clone(),
            selection: plan.selection,
            output_template: job.output_template(&self.output_dir),
            post_processing: plan.post_processing,
        };

        info!(
            "job {} starting with {} ({}) for {}",
            job.token,
            request.selection,
            self.engine.name(),
            job.url
        );

        let result: Result<Artifact, DownloadError> = async {
            self.engine
                .fetch_and_materialize(&request, &self.options, progress)
                .await?;

            let artifact =
                locate_artifact(&self.output_dir, &job.token, plan.expected_ext.as_deref())
                    .await?;
            if artifact.size() > self.max_artifact_bytes {
                return Err(DownloadError::TooLarge {
                    size: artifact.size(),
                    limit: self.max_artifact_bytes,
                });
            }

            Ok(artifact)
        }
        .await;

        match &result {
            Ok(artifact) => info!(
                "job {} produced {} bytes as .{}",
                job.token,
                artifact.size(),
                artifact.ext()
            ),
            Err(DownloadError::ArtifactNotFound { token }) => error!(
                "job {token} finished without an output file; selection {:?} for {}",
                request.selection, job.url
            ),
            Err(error) => info!("job {} failed: {error}", job.token),
        }

        if result.is_err() {
            purge_job_files(&self.output_dir, &job.token).await;
        }

        result
    }
}

fn is_partial(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Finds the file the engine wrote for `token`.
///
/// The extension is read from disk since post-processing may change the container. When
/// several candidates exist the one matching `expected_ext` wins and the rest are removed.
pub async fn locate_artifact(
    output_dir: &Path,
    token: &str,
    expected_ext: Option<&str>,
) -> Result<Artifact, DownloadError> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    let mut candidates: Vec<(PathBuf, u64)> = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(token) || is_partial(name) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            candidates.push((entry.path(), metadata.len()));
        }
    }

    if candidates.is_empty() {
        return Err(DownloadError::ArtifactNotFound {
            token: token.to_string(),
        });
    }

    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    let chosen = expected_ext
        .and_then(|expected| {
            candidates
                .iter()
                .position(|(path, _)| extension_of(path) == expected)
        })
        .unwrap_or(0);
    let (path, size) = candidates.swap_remove(chosen);

    for (extra, _) in candidates {
        warn!("removing extra output {:?} for job {token}", extra);
        if let Err(error) = tokio::fs::remove_file(&extra).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove {:?}: {error}", extra);
        }
    }

    Ok(Artifact {
        ext: extension_of(&path),
        path,
        size,
    })
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| FALLBACK_EXT.to_string())
}

/// Removes every file in `output_dir` whose name starts with `token`.
pub async fn purge_job_files(output_dir: &Path, token: &str) {
    let mut entries = match tokio::fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("could not open {:?} to clean job {token}: {error}", output_dir);
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not list {:?} to clean job {token}: {error}", output_dir);
                break;
            }
        };

        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(token));
        if !matches {
            continue;
        }

        let path = entry.path();
        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove {:?}: {error}", path);
        }
    }
}
