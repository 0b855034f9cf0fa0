use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

const POST_PROCESSOR_TAGS: [&str; 6] = [
    "[Merger]",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[FixupM4a]",
    "[FixupM3u8]",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Downloading,
    PostProcessing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: JobStage,
    pub percent: Option<f32>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    fn queued() -> Self {
        Self {
            stage: JobStage::Queued,
            percent: None,
            speed: None,
            eta: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Download {
        percent: f32,
        speed: Option<String>,
        eta: Option<String>,
    },
    PostProcessing,
}

/// Progress of in-flight jobs, keyed by the id the requesting client chose.
#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
    entries: Arc<Mutex<HashMap<String, ProgressSnapshot>>>,
}

impl ProgressRegistry {
    /// Returns `None` when another active job already uses `key`.
    pub fn register(&self, key: &str) -> Option<ProgressHandle> {
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return None;
        }
        entries.insert(key.to_string(), ProgressSnapshot::queued());

        Some(ProgressHandle {
            key: key.to_string(),
            registry: self.clone(),
        })
    }

    pub fn snapshot(&self, key: &str) -> Option<ProgressSnapshot> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProgressSnapshot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration of one job; the entry disappears when the handle is dropped.
#[derive(Debug)]
pub struct ProgressHandle {
    key: String,
    registry: ProgressRegistry,
}

impl ProgressHandle {
    pub fn apply(&self, update: ProgressUpdate) {
        let mut entries = self.registry.lock();
        let Some(snapshot) = entries.get_mut(&self.key) else {
            return;
        };

        match update {
            ProgressUpdate::Download {
                percent,
                speed,
                eta,
            } => {
                snapshot.stage = JobStage::Downloading;
                snapshot.percent = Some(percent);
                snapshot.speed = speed;
                snapshot.eta = eta;
            }
            ProgressUpdate::PostProcessing => {
                snapshot.stage = JobStage::PostProcessing;
                snapshot.percent = Some(100.0);
                snapshot.eta = None;
            }
        }
        snapshot.updated_at = Utc::now();
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Parses one line of yt-dlp `--newline` output.
///
/// Recognizes `[download]  42.0% of 10.00MiB at 1.00MiB/s ETA 00:05` and the banner
/// lines printed by post-processors such as `[Merger]`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let line = line.trim();

    if POST_PROCESSOR_TAGS.iter().any(|tag| line.starts_with(tag)) {
        return Some(ProgressUpdate::PostProcessing);
    }

    let rest = line.strip_prefix("[download]")?;
    let mut tokens = rest.split_whitespace();
    let percent = tokens
        .next()?
        .strip_suffix('%')?
        .parse::<f32>()
        .ok()?
        .clamp(0.0, 100.0);

    let mut speed = None;
    let mut eta = None;
    while let Some(token) = tokens.next() {
        match token {
            "at" => speed = tokens.next().map(ToString::to_string),
            "ETA" => eta = tokens.next().map(ToString::to_string),
            _ => {}
        }
    }

    Some(ProgressUpdate::Download {
        percent,
        speed: speed.filter(|value| !value.starts_with("Unknown")),
        eta: eta.filter(|value| !value.starts_with("Unknown")),
    })
}
