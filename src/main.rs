mod cache;
mod catalog;
mod config;
mod delivery;
mod engine;
mod error;
mod links;
mod orchestrator;
mod progress;
mod sweeper;

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cache::CatalogCache,
    catalog::{CatalogLimits, FormatChoice, FormatIndex, audio_conversion_bitrate, build_catalog},
    config::{Config, non_empty},
    delivery::{DOWNLOAD_FILENAME_HEADER, deliver},
    engine::{EngineOptions, YtDlp},
    error::ApiError,
    links::normalize_url,
    orchestrator::{DownloadJob, Orchestrator},
    progress::{ProgressRegistry, ProgressSnapshot},
    sweeper::sweep_stale_files,
};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    catalogs: CatalogCache,
    progress: ProgressRegistry,
    download_semaphore: Arc<Semaphore>,
    catalog_limits: CatalogLimits,
    transfer_dir: PathBuf,
    stale_file_seconds: u64,
}

impl AppState {
    fn new(orchestrator: Orchestrator, config: &Config) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            catalogs: CatalogCache::default(),
            progress: ProgressRegistry::default(),
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            catalog_limits: config.catalog_limits,
            transfer_dir: config.temp_dir.clone(),
            stale_file_seconds: config.stale_file_seconds,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    title: String,
    thumbnail: Option<String>,
    duration: Option<String>,
    duration_seconds: Option<f64>,
    platform: Option<String>,
    video_formats: Vec<FormatChoice>,
    audio_formats: Vec<FormatChoice>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    format_id: Option<String>,
    title: Option<String>,
    progress_id: Option<Uuid>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create the temporary download directory {:?}: {error}",
                config.temp_dir
            ))
        })?;

    if config.relax_certificates {
        warn!(
            "Certificate validation is relaxed for extraction requests. Set STRICT_CERTIFICATES=true to enforce it."
        );
    }

    let engine = Arc::new(YtDlp::new(config.yt_dlp_bin.clone(), config.engine_timeout));
    let options = EngineOptions {
        relax_certificates: config.relax_certificates,
        ..EngineOptions::default()
    };
    let orchestrator = Orchestrator::new(
        engine,
        options,
        config.temp_dir.clone(),
        config.merge_output_format.clone(),
        config.max_download_bytes,
    );

    let state = AppState::new(orchestrator, &config);

    sweep_stale_files(&state.transfer_dir, state.stale_file_seconds).await;

    let cors = build_cors_layer(&config.allowed_origins)?;

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(get_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/{progress_id}", get(get_progress))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("Backend ready on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_info(
    State(state): State<AppState>,
    Json(payload): Json<InfoRequest>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = normalize_url(&payload.url)?;
    let info = state.orchestrator.fetch_metadata(url.as_str()).await?;

    let catalog = build_catalog(&info.streams, info.duration_seconds, state.catalog_limits);
    state
        .catalogs
        .insert(url.as_str(), FormatIndex::from_descriptors(&info.streams))
        .await;

    debug!(
        "catalog for {} has {} video and {} audio choice(s) from {} stream(s)",
        url,
        catalog.video.len(),
        catalog.audio.len(),
        info.streams.len()
    );

    Ok(Json(InfoResponse {
        title: info.title.unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: info.thumbnail,
        duration: info.duration_label,
        duration_seconds: info.duration_seconds,
        platform: info.platform,
        video_formats: catalog.video,
        audio_formats: catalog.audio,
    }))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = normalize_url(&payload.url)?;
    let format_id = payload
        .format_id
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::invalid_selection("Choose a format before downloading."))?
        .to_string();

    let progress = payload
        .progress_id
        .map(|id| {
            state.progress.register(&id.to_string()).ok_or_else(|| {
                ApiError::bad_request("Another download is already using this progress id.")
            })
        })
        .transpose()?;

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;
    sweep_stale_files(&state.transfer_dir, state.stale_file_seconds).await;

    let formats = if audio_conversion_bitrate(&format_id).is_some() {
        FormatIndex::default()
    } else {
        resolve_formats(&state, &url).await?
    };

    let job = DownloadJob::new(url.as_str(), format_id, formats);
    let artifact = state.orchestrator.execute(&job, progress.as_ref()).await?;

    deliver(artifact, payload.title.as_deref().and_then(non_empty)).await
}

async fn resolve_formats(state: &AppState, url: &Url) -> Result<FormatIndex, ApiError> {
    if let Some(formats) = state.catalogs.get(url.as_str()).await {
        return Ok(formats);
    }

    debug!("no cached catalog for {url}, querying metadata again");
    let info = state.orchestrator.fetch_metadata(url.as_str()).await?;
    let formats = FormatIndex::from_descriptors(&info.streams);
    debug!("{url} reports {} selectable stream(s)", formats.stream_count());
    state.catalogs.insert(url.as_str(), formats.clone()).await;
    Ok(formats)
}

async fn get_progress(
    State(state): State<AppState>,
    Path(progress_id): Path<Uuid>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    state
        .progress
        .snapshot(&progress_id.to_string())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No active download with this progress id."))
}

fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list has {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|explicit| *explicit != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::{StatusCode, header::CONTENT_TYPE};

    use super::*;
    use crate::{
        catalog::{AUDIO_HIGH_ID, AUDIO_STANDARD_ID, StreamDescriptor},
        engine::{EngineError, ExtractionEngine, ExtractionRequest, MediaInfo, PostProcessing},
        progress::{JobStage, ProgressHandle},
    };

    const VIDEO_URL: &str = "https://example.com/watch?v=1&utm_source=feed";

    struct FakeEngine {
        metadata_calls: AtomicUsize,
        download_calls: AtomicUsize,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                metadata_calls: AtomicUsize::new(0),
                download_calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> (usize, usize) {
            (
                self.metadata_calls.load(Ordering::SeqCst),
                self.download_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl ExtractionEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_metadata(
            &self,
            _url: &str,
            _options: &EngineOptions,
        ) -> Result<MediaInfo, EngineError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(MediaInfo {
                title: Some("Clip".to_string()),
                duration_seconds: Some(200.0),
                streams: vec![
                    StreamDescriptor {
                        id: "137".to_string(),
                        ext: "mp4".to_string(),
                        resolution: Some("1920x1080".to_string()),
                        has_video: true,
                        ..StreamDescriptor::default()
                    },
                    StreamDescriptor {
                        id: "251".to_string(),
                        ext: "webm".to_string(),
                        has_audio: true,
                        abr: Some(160.0),
                        ..StreamDescriptor::default()
                    },
                ],
                ..MediaInfo::default()
            })
        }

        async fn fetch_and_materialize(
            &self,
            request: &ExtractionRequest,
            _options: &EngineOptions,
            _progress: Option<&ProgressHandle>,
        ) -> Result<(), EngineError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            let ext = match &request.post_processing {
                Some(PostProcessing::ExtractAudio { codec, .. }) => codec.as_str(),
                Some(PostProcessing::Merge { container }) => container.as_str(),
                None => "webm",
            };
            tokio::fs::write(request.output_template.replace("%(ext)s", ext), b"media bytes")
                .await?;
            Ok(())
        }
    }

    fn test_state(engine: Arc<FakeEngine>, dir: &std::path::Path) -> AppState {
        let temp_dir = dir.to_string_lossy().into_owned();
        let config = Config::from_lookup(|name| {
            (name == "TEMP_DOWNLOAD_DIR").then(|| temp_dir.clone())
        });
        let orchestrator = Orchestrator::new(
            engine,
            EngineOptions::default(),
            dir,
            config.merge_output_format.clone(),
            config.max_download_bytes,
        );
        AppState::new(orchestrator, &config)
    }

    fn download_request(
        format_id: Option<&str>,
        progress_id: Option<Uuid>,
    ) -> Json<DownloadRequest> {
        Json(DownloadRequest {
            url: VIDEO_URL.to_string(),
            format_id: format_id.map(ToString::to_string),
            title: Some("Clip".to_string()),
            progress_id,
        })
    }

    async fn download_body(state: &AppState, format_id: &str) -> (String, Vec<u8>) {
        let response =
            start_download(State(state.clone()), download_request(Some(format_id), None))
                .await
                .expect("download response");
        let content_type = response.headers()[CONTENT_TYPE]
            .to_str()
            .expect("ascii")
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (content_type, body.to_vec())
    }

    fn scratch_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).expect("dir").count()
    }

    #[tokio::test]
    async fn missing_format_is_rejected_before_any_engine_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());

        for format_id in [None, Some(""), Some("   ")] {
            let error = start_download(State(state.clone()), download_request(format_id, None))
                .await
                .err()
                .expect("rejected");
            assert_eq!(error.status, StatusCode::BAD_REQUEST);
            assert_eq!(error.code, Some("INVALID_SELECTION"));
        }

        assert_eq!(engine.calls(), (0, 0));
    }

    #[tokio::test]
    async fn conversion_choice_skips_metadata_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());

        let (content_type, body) = download_body(&state, AUDIO_STANDARD_ID).await;

        assert_eq!(content_type, "audio/mpeg");
        assert_eq!(body, b"media bytes");
        assert_eq!(engine.calls(), (0, 1));
        assert_eq!(scratch_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn cache_miss_queries_metadata_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());

        let (content_type, _) = download_body(&state, "137").await;
        assert_eq!(content_type, "video/mp4");
        assert_eq!(engine.calls(), (1, 1));

        download_body(&state, "137").await;
        assert_eq!(engine.calls(), (1, 2));
        assert_eq!(scratch_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn info_populates_the_catalog_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());

        let Json(info) = get_info(
            State(state.clone()),
            Json(InfoRequest {
                url: VIDEO_URL.to_string(),
            }),
        )
        .await
        .expect("info");

        assert_eq!(info.title, "Clip");
        assert_eq!(info.video_formats.len(), 1);
        assert_eq!(info.audio_formats[0].format_id, AUDIO_HIGH_ID);
        assert_eq!(info.audio_formats.last().map(|f| f.format_id.as_str()), Some("251"));

        download_body(&state, "251").await;
        assert_eq!(engine.calls(), (1, 1));
        assert_eq!(scratch_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn unknown_format_never_reaches_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());

        let error = start_download(State(state.clone()), download_request(Some("999"), None))
            .await
            .err()
            .expect("rejected");

        assert_eq!(error.code, Some("INVALID_SELECTION"));
        assert_eq!(engine.calls(), (1, 0));
        assert_eq!(scratch_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn duplicate_progress_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());
        let progress_id = Uuid::new_v4();
        let _active = state
            .progress
            .register(&progress_id.to_string())
            .expect("registered");

        let error = start_download(
            State(state.clone()),
            download_request(Some(AUDIO_STANDARD_ID), Some(progress_id)),
        )
        .await
        .err()
        .expect("rejected");

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(engine.calls(), (0, 0));

        let Json(snapshot) = get_progress(State(state.clone()), Path(progress_id))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.stage, JobStage::Queued);
    }

    #[tokio::test]
    async fn progress_entry_is_released_after_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(FakeEngine::new());
        let state = test_state(engine.clone(), dir.path());
        let progress_id = Uuid::new_v4();

        let response = start_download(
            State(state.clone()),
            download_request(Some(AUDIO_STANDARD_ID), Some(progress_id)),
        )
        .await
        .expect("download response");
        drop(response);

        let error = get_progress(State(state.clone()), Path(progress_id))
            .await
            .err()
            .expect("released");
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(scratch_files(dir.path()), 0);
    }

    #[test]
    fn normalizes_origins() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn rejects_invalid_allow_list() {
        assert!(build_cors_layer(&["https://ok.example".to_string()]).is_ok());
        assert!(build_cors_layer(&["not an origin".to_string()]).is_err());
    }
}
