//! HTTP surface of the enrichment service
//!
//! - `POST /api/processing/upload` accepts a workbook and starts a task
//! - `GET /api/processing/ws/{task_id}` streams that task's progress events
//! - `GET /api/processing/download/{task_id}` serves the finished report
//! - `GET /health` liveness probe

use crate::artifacts::TaskArtifacts;
use crate::cache::LookupCache;
use crate::config::AppConfig;
use crate::gateway::RegistryGateway;
use crate::pipeline::EnrichmentPipeline;
use crate::progress::ProgressHub;
use bytes::Buf;
use futures_util::{SinkExt, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::reply::Response;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

const UPLOAD_FIELD: &str = "file";
const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Public download location of a task's report
pub fn download_url(task_id: &str) -> String {
    format!("/api/processing/download/{task_id}")
}

/// Shared state behind every route
pub struct AppState {
    pipeline: EnrichmentPipeline,
    hub: Arc<ProgressHub>,
    uploads_dir: PathBuf,
    max_upload_bytes: u64,
}

impl AppState {
    /// One pipeline, one lookup cache and one progress hub for all tasks
    pub fn new(config: &AppConfig, gateway: Arc<dyn RegistryGateway>) -> Self {
        let hub = Arc::new(ProgressHub::new());
        let cache = Arc::new(LookupCache::new(&config.cache));
        let pipeline = EnrichmentPipeline::new(gateway, cache, hub.clone(), config);

        Self {
            pipeline,
            hub,
            uploads_dir: config.server.uploads_dir.clone(),
            max_upload_bytes: config.server.max_upload_bytes,
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn pipeline(&self) -> &EnrichmentPipeline {
        &self.pipeline
    }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    task_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: message.into(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All service routes
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&json!({"ping": "pong"})));

    let upload_route = warp::path!("api" / "processing" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(state.max_upload_bytes))
        .and(with_state(state.clone()))
        .and_then(handle_upload);

    let ws_route = warp::path!("api" / "processing" / "ws" / String)
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|task_id: String, ws: Ws, state: Arc<AppState>| {
            ws.on_upgrade(move |socket| observe_task(socket, task_id, state))
        });

    let download_route = warp::path!("api" / "processing" / "download" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_download);

    health_route
        .or(upload_route)
        .or(ws_route)
        .or(download_route)
        .with(warp::cors().allow_any_origin())
}

/// Accepts `name` when it is a plain `.xlsx` file name; returns the bare file name
pub fn accepted_file_name(name: &str) -> Option<String> {
    let file_name = Path::new(name).file_name()?.to_str()?.trim();
    let is_xlsx = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx"));
    is_xlsx.then(|| file_name.to_string())
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    part.stream()
        .try_fold(Vec::new(), |mut data, chunk| async move {
            data.extend_from_slice(chunk.chunk());
            Ok(data)
        })
        .await
}

async fn handle_upload(form: FormData, state: Arc<AppState>) -> Result<Response, Infallible> {
    let mut parts = std::pin::pin!(form);
    let mut upload = None;

    loop {
        match parts.try_next().await {
            Ok(Some(part)) if part.name() == UPLOAD_FIELD => {
                let file_name = part.filename().map(str::to_string);
                match read_part(part).await {
                    Ok(data) => upload = Some((file_name, data)),
                    Err(e) => {
                        warn!("Failed to read upload body: {}", e);
                        return Ok(error_reply(StatusCode::BAD_REQUEST, "Malformed upload"));
                    }
                }
                break;
            }
            Ok(Some(part)) => debug!("Ignoring form field {}", part.name()),
            Ok(None) => break,
            Err(e) => {
                warn!("Malformed multipart form: {}", e);
                return Ok(error_reply(StatusCode::BAD_REQUEST, "Malformed upload"));
            }
        }
    }

    let Some((file_name, data)) = upload else {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            format!("Missing form field '{UPLOAD_FIELD}'"),
        ));
    };
    let Some(file_name) = file_name.as_deref().and_then(accepted_file_name) else {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "Only .xlsx files are supported",
        ));
    };

    let task_id = Uuid::new_v4().to_string();
    let input = state.uploads_dir.join(format!("{task_id}_{file_name}"));

    if let Err(e) = store_upload(&input, &data).await {
        error!("Failed to store upload {}: {}", input.display(), e);
        return Ok(error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to store upload",
        ));
    }

    info!(
        "Accepted upload {} ({} bytes) as task {}",
        file_name,
        data.len(),
        task_id
    );

    let response = UploadResponse {
        task_id: task_id.clone(),
    };
    tokio::spawn(async move {
        let url = download_url(&task_id);
        state.pipeline.run(&task_id, &input, Some(url)).await;
    });

    Ok(warp::reply::json(&response).into_response())
}

async fn store_upload(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

async fn handle_download(task_id: String, state: Arc<AppState>) -> Result<Response, Infallible> {
    if Uuid::parse_str(&task_id).is_err() {
        return Ok(error_reply(StatusCode::NOT_FOUND, "Unknown task"));
    }

    let path = TaskArtifacts::report_path_for(state.pipeline.results_dir(), &task_id);
    match tokio::fs::read(&path).await {
        Ok(data) => {
            let disposition = format!("attachment; filename=\"report_{task_id}.xlsx\"");
            let reply = warp::reply::with_header(data, "content-type", XLSX_CONTENT_TYPE);
            Ok(warp::reply::with_header(reply, "content-disposition", disposition).into_response())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(error_reply(StatusCode::NOT_FOUND, "Report not found"))
        }
        Err(e) => {
            error!("Failed to read report {}: {}", path.display(), e);
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read report",
            ))
        }
    }
}

/// Forward a task's progress events until a terminal event or disconnect
async fn observe_task(socket: WebSocket, task_id: String, state: Arc<AppState>) {
    let (mut outgoing, mut incoming) = socket.split();
    let mut subscription = state.hub.subscribe(&task_id);
    debug!("Observer attached to task {}", task_id);

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode progress event: {}", e);
                        continue;
                    }
                };
                if outgoing.send(Message::text(text)).await.is_err() || terminal {
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer of task {} errored: {}", task_id, e);
                    break;
                }
                None => break,
            },
        }
    }

    state.hub.unsubscribe(&task_id, subscription.id);
    if let Err(e) = outgoing.close().await {
        debug!("Closing observer socket for task {}: {}", task_id, e);
    }
}

/// Run the service until Ctrl-C
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (bound, server) =
        warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, stopping server");
        })?;

    info!("Listening on {}", bound);
    server.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_file_name() {
        assert_eq!(accepted_file_name("march.xlsx"), Some("march.xlsx".to_string()));
        assert_eq!(accepted_file_name("MARCH.XLSX"), Some("MARCH.XLSX".to_string()));
        assert_eq!(
            accepted_file_name("../../etc/report.xlsx"),
            Some("report.xlsx".to_string())
        );
        assert_eq!(accepted_file_name("march.xls"), None);
        assert_eq!(accepted_file_name("march.csv"), None);
        assert_eq!(accepted_file_name("xlsx"), None);
        assert_eq!(accepted_file_name(""), None);
    }

    #[test]
    fn test_download_url() {
        assert_eq!(download_url("abc"), "/api/processing/download/abc");
    }
}
