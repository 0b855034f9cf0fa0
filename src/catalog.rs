use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
};

use serde::{Deserialize, Serialize};

/// Synthesized "convert to MP3 at 320 kbps" choice.
pub const AUDIO_HIGH_ID: &str = "mp3-320";
/// Synthesized "convert to MP3 at 128 kbps" choice.
pub const AUDIO_STANDARD_ID: &str = "mp3-128";
pub const AUDIO_HIGH_KBPS: u32 = 320;
pub const AUDIO_STANDARD_KBPS: u32 = 128;
pub const AUDIO_CONVERSION_EXT: &str = "mp3";

const DEFAULT_VIDEO_LIMIT: usize = 15;
const DEFAULT_AUDIO_LIMIT: usize = 10;

/// One selectable stream as reported by the extraction engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDescriptor {
    pub id: String,
    pub ext: String,
    pub resolution: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub note: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub abr: Option<f64>,
}

impl StreamDescriptor {
    fn byte_size(&self) -> Option<f64> {
        self.filesize
            .filter(|size| *size > 0.0)
            .or(self.filesize_approx)
    }

    fn category(&self) -> Option<FormatCategory> {
        if self.has_video {
            Some(FormatCategory::Video)
        } else if self.has_audio {
            Some(FormatCategory::Audio)
        } else {
            None
        }
    }

    fn audio_label(&self) -> String {
        if let Some(abr) = self.abr.filter(|abr| *abr > 0.0) {
            return format!("{}kbps", abr.round() as u32);
        }
        non_empty_label(Some(self.note.as_str()))
            .or_else(|| non_empty_label(self.resolution.as_deref()))
            .unwrap_or("audio")
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatCategory {
    Video,
    Audio,
}

/// A user-facing entry of the format catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatChoice {
    pub format_id: String,
    pub ext: String,
    pub label: String,
    pub filesize: String,
    pub category: FormatCategory,
    pub note: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogLimits {
    pub video: usize,
    pub audio: usize,
}

impl Default for CatalogLimits {
    fn default() -> Self {
        Self {
            video: DEFAULT_VIDEO_LIMIT,
            audio: DEFAULT_AUDIO_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub video: Vec<FormatChoice>,
    pub audio: Vec<FormatChoice>,
}

/// Turns raw stream descriptors into the ranked video and audio choices shown to the user.
///
/// Video entries keep the first descriptor seen per resolution and are ranked by height,
/// tallest first. When the duration is known the two MP3 conversion choices lead the audio
/// list, ahead of every discovered audio stream.
pub fn build_catalog(
    descriptors: &[StreamDescriptor],
    duration_seconds: Option<f64>,
    limits: CatalogLimits,
) -> Catalog {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut seen_resolutions: HashSet<&str> = HashSet::new();
    let mut video: Vec<(u32, FormatChoice)> = Vec::new();
    let mut audio: Vec<(u32, FormatChoice)> = Vec::new();

    for descriptor in descriptors {
        if audio_conversion_bitrate(&descriptor.id).is_some() {
            continue;
        }
        let Some(category) = descriptor.category() else {
            continue;
        };

        match category {
            FormatCategory::Video => {
                let Some(resolution) = descriptor
                    .resolution
                    .as_deref()
                    .map(str::trim)
                    .filter(|label| !label.is_empty() && *label != "none")
                else {
                    continue;
                };
                if !seen_resolutions.insert(resolution) || !seen_ids.insert(&descriptor.id) {
                    continue;
                }

                video.push((
                    resolution_height(resolution),
                    FormatChoice {
                        format_id: descriptor.id.clone(),
                        ext: descriptor.ext.clone(),
                        label: resolution.to_string(),
                        filesize: format_bytes(descriptor.byte_size()),
                        category,
                        note: descriptor.note.clone(),
                    },
                ));
            }
            FormatCategory::Audio => {
                if !seen_ids.insert(&descriptor.id) {
                    continue;
                }
                let label = descriptor.audio_label();
                audio.push((
                    leading_number(&label),
                    FormatChoice {
                        format_id: descriptor.id.clone(),
                        ext: descriptor.ext.clone(),
                        label,
                        filesize: format_bytes(descriptor.byte_size()),
                        category,
                        note: descriptor.note.clone(),
                    },
                ));
            }
        }
    }

    video.sort_by_key(|(height, _)| Reverse(*height));
    audio.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.label.cmp(&a.1.label)));

    let mut audio_choices = conversion_choices(duration_seconds);
    audio_choices.extend(audio.into_iter().map(|(_, choice)| choice));
    audio_choices.truncate(limits.audio);

    let mut video_choices: Vec<FormatChoice> =
        video.into_iter().map(|(_, choice)| choice).collect();
    video_choices.truncate(limits.video);

    Catalog {
        video: video_choices,
        audio: audio_choices,
    }
}

fn conversion_choices(duration_seconds: Option<f64>) -> Vec<FormatChoice> {
    let Some(duration) = duration_seconds.filter(|value| value.is_finite() && *value > 0.0) else {
        return Vec::new();
    };

    [
        (AUDIO_HIGH_ID, AUDIO_HIGH_KBPS, "High quality MP3"),
        (AUDIO_STANDARD_ID, AUDIO_STANDARD_KBPS, "Standard MP3"),
    ]
    .into_iter()
    .map(|(id, kbps, note)| FormatChoice {
        format_id: id.to_string(),
        ext: AUDIO_CONVERSION_EXT.to_string(),
        label: format!("{kbps}kbps"),
        filesize: format_bytes(Some(estimated_size(duration, kbps))),
        category: FormatCategory::Audio,
        note: note.to_string(),
    })
    .collect()
}

fn estimated_size(duration_seconds: f64, kbps: u32) -> f64 {
    duration_seconds * f64::from(kbps) * 1000.0 / 8.0
}

/// Returns the target bitrate when `format_id` names one of the MP3 conversion choices.
pub fn audio_conversion_bitrate(format_id: &str) -> Option<u32> {
    match format_id {
        AUDIO_HIGH_ID => Some(AUDIO_HIGH_KBPS),
        AUDIO_STANDARD_ID => Some(AUDIO_STANDARD_KBPS),
        _ => None,
    }
}

/// Formats a byte count with binary multiples, e.g. `12.34MB`.
pub fn format_bytes(size: Option<f64>) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];

    let Some(mut size) = size.filter(|value| value.is_finite() && *value > 0.0) else {
        return "Unknown".to_string();
    };

    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2}{}B", UNITS[unit])
}

/// Height from a `WIDTHxHEIGHT` label; anything else ranks as zero.
fn resolution_height(label: &str) -> u32 {
    label
        .split_once('x')
        .and_then(|(width, height)| {
            width.trim().parse::<u32>().ok()?;
            height.trim().parse::<u32>().ok()
        })
        .unwrap_or(0)
}

fn leading_number(label: &str) -> u32 {
    let digits: String = label.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn non_empty_label(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Category of every real stream identifier reported for one URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatIndex {
    categories: HashMap<String, FormatCategory>,
}

impl FormatIndex {
    pub fn from_descriptors(descriptors: &[StreamDescriptor]) -> Self {
        let categories = descriptors
            .iter()
            .filter(|descriptor| audio_conversion_bitrate(&descriptor.id).is_none())
            .filter_map(|descriptor| {
                descriptor
                    .category()
                    .map(|category| (descriptor.id.clone(), category))
            })
            .collect();

        Self { categories }
    }

    pub fn category(&self, format_id: &str) -> Option<FormatCategory> {
        self.categories.get(format_id).copied()
    }

    pub fn stream_count(&self) -> usize {
        self.categories.len()
    }
}
