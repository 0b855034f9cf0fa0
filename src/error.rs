use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

use crate::{engine::EngineError, links::LinkError, orchestrator::DownloadError};

/// What an extraction engine failure means for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BotCheck,
    LoginRequired,
    PrivateContent,
    GeoRestricted,
    Unavailable,
    FormatUnavailable,
    UnsupportedUrl,
    Unclassified,
}

const BOT_CHECK_PHRASES: [&str; 4] = [
    "confirm you're not a bot",
    "confirm you\u{2019}re not a bot",
    "http error 429",
    "too many requests",
];
const PRIVATE_PHRASES: [&str; 2] = ["private video", "video is private"];
const GEO_PHRASES: [&str; 4] = [
    "available in your country",
    "blocked it in your country",
    "geo restrict",
    "geo-restrict",
];
const LOGIN_PHRASES: [&str; 5] = [
    "sign in to",
    "login required",
    "log in to",
    "requires authentication",
    "members-only",
];
const UNSUPPORTED_PHRASES: [&str; 1] = ["unsupported url"];
const FORMAT_PHRASES: [&str; 1] = ["requested format"];
const UNAVAILABLE_PHRASES: [&str; 3] = ["video unavailable", "has been removed", "not available"];

/// Maps raw engine error text onto a [`FailureKind`]. Rules are checked in order.
pub fn classify_engine_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();

    if contains_any(&lower, &BOT_CHECK_PHRASES) {
        FailureKind::BotCheck
    } else if contains_any(&lower, &PRIVATE_PHRASES) {
        FailureKind::PrivateContent
    } else if contains_any(&lower, &GEO_PHRASES) {
        FailureKind::GeoRestricted
    } else if contains_any(&lower, &LOGIN_PHRASES) {
        FailureKind::LoginRequired
    } else if contains_any(&lower, &UNSUPPORTED_PHRASES) {
        FailureKind::UnsupportedUrl
    } else if contains_any(&lower, &FORMAT_PHRASES) {
        FailureKind::FormatUnavailable
    } else if contains_any(&lower, &UNAVAILABLE_PHRASES) {
        FailureKind::Unavailable
    } else {
        FailureKind::Unclassified
    }
}

fn contains_any(haystack: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| haystack.contains(phrase))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
        }
    }

    fn coded(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn invalid_selection(message: impl Into<String>) -> Self {
        Self::coded(StatusCode::BAD_REQUEST, "INVALID_SELECTION", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

impl From<LinkError> for ApiError {
    fn from(error: LinkError) -> Self {
        Self::coded(StatusCode::BAD_REQUEST, "INVALID_URL", error.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Failed { message } => from_engine_message(&message),
            EngineError::TimedOut(seconds) => Self::coded(
                StatusCode::GATEWAY_TIMEOUT,
                "ENGINE_TIMEOUT",
                format!("Processing took longer than {seconds} seconds. Try a smaller format."),
            ),
            EngineError::NotInstalled(binary) => {
                error!("extraction engine {binary:?} is not installed");
                Self::coded(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ENGINE_UNAVAILABLE",
                    "The download service is not available right now.",
                )
            }
            EngineError::Io(error) => {
                error!("extraction engine could not be started: {error}");
                Self::coded(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ENGINE_UNAVAILABLE",
                    "The download service is not available right now.",
                )
            }
            EngineError::InvalidOutput(error) => {
                warn!("extraction engine returned unreadable metadata: {error}");
                Self::coded(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "UNCLASSIFIED",
                    "Could not read the details of this video.",
                )
            }
        }
    }
}

fn from_engine_message(message: &str) -> ApiError {
    let status = StatusCode::INTERNAL_SERVER_ERROR;

    match classify_engine_message(message) {
        FailureKind::BotCheck => ApiError::coded(
            status,
            "BOT_CHECK",
            "The site blocked this request as automated traffic. Try again later or try another video.",
        ),
        FailureKind::LoginRequired => ApiError::coded(
            status,
            "LOGIN_REQUIRED",
            "This video requires signing in and cannot be downloaded.",
        ),
        FailureKind::PrivateContent => {
            ApiError::coded(status, "PRIVATE_CONTENT", "This video is private.")
        }
        FailureKind::GeoRestricted => ApiError::coded(
            status,
            "GEO_RESTRICTED",
            "This video is not available in the server's region.",
        ),
        FailureKind::Unavailable => ApiError::coded(
            status,
            "CONTENT_UNAVAILABLE",
            "This video is unavailable or has been removed.",
        ),
        FailureKind::FormatUnavailable => {
            error!("engine rejected the derived stream selection: {message}");
            ApiError::coded(
                status,
                "FORMAT_UNAVAILABLE",
                "The chosen format is no longer offered for this video. Reload the formats and try again.",
            )
        }
        FailureKind::UnsupportedUrl => ApiError::coded(
            StatusCode::BAD_REQUEST,
            "UNSUPPORTED_URL",
            "This link is not supported.",
        ),
        FailureKind::Unclassified => {
            warn!("unclassified extraction failure: {message}");
            ApiError::coded(status, "UNCLASSIFIED", "The video could not be processed.")
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::InvalidSelection(_) => {
                Self::invalid_selection("Choose one of the formats listed for this video.")
            }
            DownloadError::Extraction(error) => error.into(),
            DownloadError::ArtifactNotFound { .. } => Self::coded(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ARTIFACT_MISSING",
                "Processing failed: the converted file was not produced.",
            ),
            DownloadError::TooLarge { limit, .. } => Self::coded(
                StatusCode::PAYLOAD_TOO_LARGE,
                "FILE_TOO_LARGE",
                format!(
                    "The file is larger than the {} MB limit.",
                    limit / 1_048_576
                ),
            ),
            DownloadError::Storage(error) => {
                error!("scratch storage error: {error}");
                Self::internal("Temporary storage is not available.")
            }
        }
    }
}
