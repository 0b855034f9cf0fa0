use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::{error::ApiError, orchestrator::Artifact};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";
const DEFAULT_STEM: &str = "VidGrab";
const MAX_STEM_CHARS: usize = 100;
const ILLEGAL_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// File body that owns its artifact, so the file is deleted once the body is gone.
struct ArtifactStream {
    inner: ReaderStream<File>,
    artifact: Artifact,
}

impl Stream for ArtifactStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Err(error))) => {
                warn!("transmission of {:?} failed: {error}", this.artifact.path());
                Poll::Ready(Some(Err(error)))
            }
            other => other,
        }
    }
}

/// Streams `artifact` to the client under a sanitized, timestamped filename.
pub async fn deliver(artifact: Artifact, title: Option<&str>) -> Result<Response, ApiError> {
    let file = File::open(artifact.path()).await.map_err(|error| {
        ApiError::internal(format!("Could not read the processed file: {error}"))
    })?;

    let filename = download_filename(title, artifact.ext(), Utc::now());
    let content_type = content_type_for_extension(artifact.ext());
    let content_length = artifact.size();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string())
            .map_err(|_| ApiError::internal("Could not set the download size."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not set the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&filename)
            .map_err(|_| ApiError::internal("Could not set the file name."))?,
    );

    let body = Body::from_stream(ArtifactStream {
        inner: ReaderStream::new(file),
        artifact,
    });

    Ok((headers, body).into_response())
}

/// `<title>_<unix seconds>.<ext>`, ASCII only.
pub fn download_filename(title: Option<&str>, ext: &str, now: DateTime<Utc>) -> String {
    let stem = title
        .map(sanitize_filename)
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| DEFAULT_STEM.to_string());
    let stem: String = stem.chars().take(MAX_STEM_CHARS).collect();
    let ext: String = sanitize_filename(ext).replace('.', "");

    if ext.is_empty() {
        format!("{}_{}", stem.trim_end(), now.timestamp())
    } else {
        format!("{}_{}.{ext}", stem.trim_end(), now.timestamp())
    }
}

/// Transliterates to ASCII and strips characters that are unsafe in file names or headers.
pub fn sanitize_filename(value: &str) -> String {
    let ascii: String = value
        .nfkd()
        .filter(char::is_ascii)
        .filter(|character| !character.is_ascii_control() && !ILLEGAL_CHARS.contains(character))
        .collect();

    ascii
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|character: char| character == '.' || character == ' ')
        .to_string()
}

pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
