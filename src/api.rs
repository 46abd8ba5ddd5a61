use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::{io::AsyncWriteExt, sync::watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::broadcast::{BuildLogBroadcaster, BuildLogEvent};
use crate::intake::{IntakeError, UploadedArchive};
use crate::lifecycle::{ContainerProvisioner, LifecycleController, LifecycleError};
use crate::pipeline::{BuildError, ImageBuildPipeline};
use crate::registry::{
    ContainerIntent, ContainerRecord, ContainerRegistry, RegistryError, is_valid_build_id,
};
use crate::runtime::{RuntimeContainer, RuntimeStatus};
use crate::signals::wait_for_shutdown;

const UPLOAD_FIELD: &str = "file";

/// State shared across axum handlers.
pub struct AppState {
    pub registry: Arc<ContainerRegistry>,
    pub lifecycle: Arc<LifecycleController>,
    pub pipeline: Arc<ImageBuildPipeline>,
    pub broadcaster: Arc<BuildLogBroadcaster>,
    /// Uploads are written here before the pipeline picks them up.
    pub staging_dir: PathBuf,
    /// How long a build log channel outlives its last subscriber.
    pub log_grace: Duration,
    /// Ends open build log streams when the server shuts down.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Registry(e) => match e {
                RegistryError::Invalid(_) | RegistryError::PortAllocated(_) => {
                    StatusCode::BAD_REQUEST
                }
                RegistryError::UnknownBuild(_) | RegistryError::NotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::DuplicateBuild(_) | RegistryError::AlreadyBuilt(_) => {
                    StatusCode::CONFLICT
                }
                RegistryError::Runtime(_) | RegistryError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Lifecycle(LifecycleError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Lifecycle(LifecycleError::Failed { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Build(e) => match e {
                BuildError::Rejected(IntakeError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
                BuildError::Rejected(_) => StatusCode::BAD_REQUEST,
                BuildError::UnknownBuild(_) => StatusCode::NOT_FOUND,
                BuildError::InProgress(_) | BuildError::AlreadyBuilt(_) => StatusCode::CONFLICT,
                BuildError::Failed => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {self:?}");
        } else {
            debug!("Request rejected: {self}");
        }
        let body = match &self {
            Self::Lifecycle(LifecycleError::Failed { source, .. }) => {
                json!({ "error": self.to_string(), "detail": source.to_string() })
            }
            Self::Registry(RegistryError::Runtime(_) | RegistryError::Store(_)) => {
                json!({ "error": "Internal error" })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IntentCreated {
    build_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildFinished {
    build_id: String,
    container_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    id: String,
    state: RuntimeStatus,
}

#[derive(Serialize)]
struct Confirmation {
    message: String,
}

pub fn router(state: Arc<AppState>, upload_limit_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/docker/container/ls", get(list_records))
        .route("/docker/container/ls/{record_id}", get(get_record))
        .route("/docker/container/runtime", get(list_runtime))
        .route("/docker/container/new", post(create_intent))
        .route("/docker/container/new/build/{build_id}", post(upload_build))
        .route("/docker/container/build-logs/{build_id}", get(build_logs))
        .route("/docker/container/state/{id}", get(container_state))
        .route("/docker/container/start/{id}", get(start_container))
        .route("/docker/container/stop/{id}", get(stop_container))
        .route("/docker/container/restart/{id}", get(restart_container))
        .route("/docker/container/remove/{id}", get(remove_container))
        .layer(DefaultBodyLimit::max(upload_limit_bytes))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn list_records(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ContainerRecord>>, ApiError> {
    Ok(Json(state.registry.list().await?))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<ContainerRecord>, ApiError> {
    Ok(Json(state.registry.get(record_id).await?))
}

async fn list_runtime(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RuntimeContainer>>, ApiError> {
    Ok(Json(state.lifecycle.list_runtime().await?))
}

async fn create_intent(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContainerIntent>, JsonRejection>,
) -> Result<Json<IntentCreated>, ApiError> {
    let Json(intent) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let build_id = state.registry.create_intent(intent).await?;
    Ok(Json(IntentCreated { build_id }))
}

/// Stream the `file` field of a multipart upload to the staging directory.
async fn stage_upload(
    staging_dir: &std::path::Path,
    build_id: &str,
    multipart: &mut Multipart,
) -> Result<UploadedArchive, ApiError> {
    let bad_upload = |e: axum::extract::multipart::MultipartError| {
        ApiError::BadRequest(format!("Invalid upload: {}", e.body_text()))
    };
    let io_error = |e: std::io::Error| ApiError::Internal(format!("Unable to stage upload: {e}"));

    while let Some(mut field) = multipart.next_field().await.map_err(bad_upload)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.zip").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        tokio::fs::create_dir_all(staging_dir).await.map_err(io_error)?;
        let path = staging_dir.join(format!("{build_id}-{}.zip", Uuid::now_v7()));
        let mut file = tokio::fs::File::create(&path).await.map_err(io_error)?;
        let mut written = 0usize;
        let res = async {
            while let Some(chunk) = field.chunk().await.map_err(bad_upload)? {
                written += chunk.len();
                file.write_all(&chunk).await.map_err(io_error)?;
            }
            file.flush().await.map_err(io_error)
        }
        .await;
        drop(file);
        if let Err(e) = res {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        info!("Staged {file_name} ({written} bytes, {mime_type}) for build {build_id}");
        return Ok(UploadedArchive {
            path,
            file_name,
            mime_type,
        });
    }
    Err(ApiError::BadRequest(format!(
        "Missing multipart field {UPLOAD_FIELD:?}"
    )))
}

async fn upload_build(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<BuildFinished>, ApiError> {
    if !is_valid_build_id(&build_id) {
        return Err(BuildError::Rejected(IntakeError::InvalidBuildId(build_id)).into());
    }
    let upload = stage_upload(&state.staging_dir, &build_id, &mut multipart).await?;

    // The build keeps running if the client goes away.
    let pipeline = Arc::clone(&state.pipeline);
    let id = build_id.clone();
    let build = tokio::spawn(async move {
        let staged = upload.path.clone();
        let res = pipeline.run(&id, upload).await;
        match tokio::fs::remove_file(&staged).await {
            Ok(()) => debug!("Removed staged upload {staged:?}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Unable to remove staged upload {staged:?}: {e}"),
        }
        res
    });
    let container_id = build
        .await
        .map_err(|e| ApiError::Internal(format!("Build task failed: {e}")))??;

    Ok(Json(BuildFinished {
        build_id,
        container_id,
    }))
}

async fn build_logs(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !is_valid_build_id(&build_id) {
        return Err(ApiError::BadRequest(format!("Invalid build id {build_id:?}")));
    }
    let events = state.broadcaster.stream(&build_id, state.log_grace);
    debug!(
        "New build log subscriber for {build_id} ({} watching)",
        state.broadcaster.subscriber_count(&build_id)
    );
    let stream = events
        .filter_map(move |event| std::future::ready(sse_event(&build_id, event)))
        .take_until(wait_for_shutdown(state.shutdown.clone()));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Render one broadcast event as an SSE `data:` frame. Skipped events are
/// logged and dropped.
fn sse_event(
    build_id: &str,
    event: Result<BuildLogEvent, BroadcastStreamRecvError>,
) -> Option<Result<Event, Infallible>> {
    match event {
        Ok(event) => Some(Ok(Event::default().data(event.to_string()))),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!("Build log subscriber for {build_id} skipped {missed} events");
            None
        }
    }
}

async fn container_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerStatus>, ApiError> {
    let status = state.lifecycle.state(&id).await?;
    Ok(Json(ContainerStatus { id, state: status }))
}

async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Confirmation>, ApiError> {
    let message = state.lifecycle.start(&id).await?;
    Ok(Json(Confirmation { message }))
}

async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Confirmation>, ApiError> {
    let message = state.lifecycle.stop(&id).await?;
    Ok(Json(Confirmation { message }))
}

async fn restart_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Confirmation>, ApiError> {
    let message = state.lifecycle.restart(&id).await?;
    Ok(Json(Confirmation { message }))
}

async fn remove_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Confirmation>, ApiError> {
    let message = state.lifecycle.remove(&id).await?;
    Ok(Json(Confirmation { message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::ArchiveIntake;
    use crate::pipeline::PipelineSettings;
    use crate::registry::RecordStore;
    use crate::runtime::{RuntimeError, fake::FakeRuntime};
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        broadcaster: Arc<BuildLogBroadcaster>,
        shutdown: watch::Sender<bool>,
        router: Router,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let registry = Arc::new(ContainerRegistry::new(
            Arc::new(RecordStore::in_memory()),
            runtime.clone(),
        ));
        let broadcaster = Arc::new(BuildLogBroadcaster::new(64));
        let lifecycle = Arc::new(LifecycleController::new(registry.clone(), runtime.clone()));
        let pipeline = Arc::new(ImageBuildPipeline::new(
            registry.clone(),
            lifecycle.clone(),
            runtime.clone(),
            ArchiveIntake::new(dir.path().join("work"), "Dockerfile", broadcaster.clone()),
            broadcaster.clone(),
            PipelineSettings {
                network_mode: "bridge".into(),
                start_after_build: false,
                log_grace: Duration::from_secs(60),
            },
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState {
            registry,
            lifecycle,
            pipeline,
            broadcaster: broadcaster.clone(),
            staging_dir: dir.path().join("uploads"),
            log_grace: Duration::from_millis(20),
            shutdown: shutdown_rx,
        });
        TestApp {
            router: router(state, 16 * 1024 * 1024),
            runtime,
            broadcaster,
            shutdown,
            dir,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_zip(uri: &str, file_name: &str, mime_type: &str, zip: Vec<u8>) -> Request<Body> {
        let boundary = "shipwright-test-boundary";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&zip);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    /// Read SSE frames from `body` until `until` shows up or the stream ends.
    async fn read_sse(body: &mut Body, until: &str) -> String {
        let mut text = String::new();
        while !text.contains(until) {
            let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
                .await
                .expect("timed out waiting for build log frames");
            let Some(frame) = frame else {
                break;
            };
            if let Ok(data) = frame.unwrap().into_data() {
                text.push_str(&String::from_utf8_lossy(&data));
            }
        }
        text
    }

    fn web_zip(dir: &std::path::Path) -> Vec<u8> {
        let staged =
            crate::intake::tests::write_zip(dir, "web.zip", &[("web/Dockerfile", "FROM nginx")]);
        std::fs::read(staged).unwrap()
    }

    fn intent_json(build_id: &str, port: &str) -> Value {
        json!({
            "buildId": build_id,
            "projectId": "p1",
            "name": "web",
            "hostPort": port,
            "environmentVariables": ["MODE=prod"]
        })
    }

    #[test]
    fn test_error_status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (RegistryError::PortAllocated(80).into(), StatusCode::BAD_REQUEST),
            (RegistryError::Invalid("x".into()).into(), StatusCode::BAD_REQUEST),
            (RegistryError::UnknownBuild("b".into()).into(), StatusCode::NOT_FOUND),
            (RegistryError::DuplicateBuild("b".into()).into(), StatusCode::CONFLICT),
            (
                BuildError::Rejected(IntakeError::UnsupportedType("text/plain".into())).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                BuildError::Rejected(IntakeError::Io(std::io::Error::other("disk full"))).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (BuildError::InProgress("b".into()).into(), StatusCode::CONFLICT),
            (BuildError::Failed.into(), StatusCode::INTERNAL_SERVER_ERROR),
            (LifecycleError::NotFound("c".into()).into(), StatusCode::NOT_FOUND),
            (
                LifecycleError::Failed {
                    operation: "stop",
                    source: RuntimeError::Build("daemon went away".into()),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error}");
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let response = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_intent_and_list() {
        let app = app();
        let (status, body) = send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["buildId"], "b1");

        let (status, body) = send(&app.router, get("/docker/container/ls")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["buildId"], "b1");
        assert_eq!(body[0]["state"], "building");

        let record_id = body[0]["id"].as_str().unwrap().to_string();
        let (status, body) =
            send(&app.router, get(&format!("/docker/container/ls/{record_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "web");

        let (status, _) = send(
            &app.router,
            get(&format!("/docker/container/ls/{}", Uuid::now_v7())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_intent_rejections() {
        let app = app();
        app.runtime.add_container("busy", RuntimeStatus::Running, vec![8080]);

        let (status, body) = send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("8080"));

        let (status, _) = send(
            &app.router,
            post_json("/docker/container/new", json!({ "buildId": "b1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(
            &app.router,
            post_json("/docker/container/new", intent_json("b2", "9090")),
        )
        .await;
        let (status, _) = send(
            &app.router,
            post_json("/docker/container/new", intent_json("b2", "9091")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_upload_builds_container() {
        let app = app();
        send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;

        let zip = web_zip(app.dir.path());
        let (status, body) = send(
            &app.router,
            multipart_zip(
                "/docker/container/new/build/b1",
                "web.zip",
                "application/zip",
                zip,
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["containerId"], "c0001");
        assert_eq!(app.runtime.created().len(), 1);

        let staging = app.dir.path().join("uploads");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);

        let (status, body) = send(&app.router, get("/docker/container/state/c0001")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "created");
    }

    #[tokio::test]
    async fn test_rejected_upload_removes_staged_file() {
        let app = app();
        send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;

        let (status, _) = send(
            &app.router,
            multipart_zip(
                "/docker/container/new/build/b1",
                "notes.txt",
                "text/plain",
                b"hello".to_vec(),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!app.dir.path().join("work").exists());
        let staging = app.dir.path().join("uploads");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_truncated_upload_removes_partial_file() {
        let app = app();
        send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;

        let boundary = "shipwright-test-boundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"web.zip\"\r\nContent-Type: application/zip\r\n\r\npartial bytes"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/docker/container/new/build/b1")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, _) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let staging = app.dir.path().join("uploads");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
        assert!(app.runtime.builds().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_routes() {
        let app = app();
        app.runtime.add_container("c9", RuntimeStatus::Exited, vec![]);

        let (status, body) = send(&app.router, get("/docker/container/start/c9")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Container c9 started!");

        let (status, body) = send(&app.router, get("/docker/container/runtime")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "c9");

        let (status, _) = send(&app.router, get("/docker/container/stop/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.runtime.fail_calls_for("c9");
        let (status, body) = send(&app.router, get("/docker/container/restart/c9")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to restart container");
    }

    #[tokio::test]
    async fn test_build_logs_stream_upload_markers() {
        let app = app();
        send(
            &app.router,
            post_json("/docker/container/new", intent_json("b1", "8080")),
        )
        .await;

        let response = app
            .router
            .clone()
            .oneshot(get("/docker/container/build-logs/b1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.broadcaster.subscriber_count("b1"), 1);
        let mut body = response.into_body();

        let zip = web_zip(app.dir.path());
        let (status, _) = send(
            &app.router,
            multipart_zip(
                "/docker/container/new/build/b1",
                "web.zip",
                "application/zip",
                zip,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let text = read_sse(&mut body, "data: ContainerId-c0001").await;
        let start = text.find("data: [BUILD_START]").unwrap();
        let complete = text.find("data: [BUILD_COMPLETE]").unwrap();
        let container = text.find("data: ContainerId-c0001").unwrap();
        assert!(start < complete && complete < container, "{text}");
        assert!(!text.contains("[BUILD_ERROR]"), "{text}");
    }

    #[tokio::test]
    async fn test_build_logs_rejects_invalid_build_id() {
        let app = app();
        let (status, body) = send(&app.router, get("/docker/container/build-logs/bad.id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bad.id"));
        assert_eq!(app.broadcaster.subscriber_count("bad.id"), 0);
    }

    #[tokio::test]
    async fn test_build_logs_end_on_shutdown() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(get("/docker/container/build-logs/b1"))
            .await
            .unwrap();
        let mut body = response.into_body();

        app.shutdown.send(true).unwrap();
        let text = read_sse(&mut body, "never sent").await;
        assert!(text.is_empty(), "{text}");
    }

    #[tokio::test]
    async fn test_dropped_build_log_subscriber_releases_channel() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(get("/docker/container/build-logs/never-built"))
            .await
            .unwrap();
        assert_eq!(app.broadcaster.channel_count(), 1);

        drop(response);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(app.broadcaster.channel_count(), 0);
    }

    #[test]
    fn test_lagged_subscriber_skips_frame() {
        assert!(sse_event("b1", Err(BroadcastStreamRecvError::Lagged(3))).is_none());
        assert!(sse_event("b1", Ok(BuildLogEvent::Start)).is_some());
    }
}
