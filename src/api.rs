//! Loopback management API
//!
//! Serves status, logs (including an SSE stream) and a stop operation for
//! out-of-process control clients on `127.0.0.1:{http_port + 1000}`.

use crate::health::HealthProber;
use crate::logring::{LogRecord, LogRing};
use crate::supervisor::Supervisor;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

/// Default number of log lines returned when the client does not ask
const DEFAULT_LOG_LINES: usize = 100;

/// SSE poll cadence
const STREAM_TICK: Duration = Duration::from_secs(1);

type ApiBody = BoxBody<Bytes, Infallible>;

struct ApiState {
    supervisor: Arc<Supervisor>,
    prober: Arc<HealthProber>,
    ring: LogRing,
    shutdown: watch::Receiver<bool>,
}

/// Management API server
pub struct ManagementApi {
    state: Arc<ApiState>,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
}

impl ManagementApi {
    pub fn new(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        prober: Arc<HealthProber>,
        ring: LogRing,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: Arc::new(ApiState {
                supervisor,
                prober,
                ring,
                shutdown: shutdown.clone(),
            }),
            addr,
            shutdown,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Management API listening");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { Ok::<_, Infallible>(handle(req, state).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %peer, error = %e, "Management API connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept management API connection"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle<B>(req: Request<B>, state: Arc<ApiState>) -> Response<ApiBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Management API request");

    // CORS preflight short-circuits
    if method == Method::OPTIONS {
        return with_cors(text(StatusCode::OK, ""));
    }

    let response = match path.as_str() {
        "/api/ping" => require_get(&method, || handle_ping()),
        "/api/status" => require_get(&method, || handle_status(&state)),
        "/api/logs" => require_get(&method, || handle_logs(req.uri(), &state, None)),
        "/api/logs/stream" => {
            if method == Method::GET {
                handle_logs_stream(req.uri(), &state)
            } else {
                method_not_allowed()
            }
        }
        "/api/stop" => {
            if method == Method::POST {
                handle_stop(&state).await
            } else {
                method_not_allowed()
            }
        }
        p if p.starts_with("/api/logs/") => {
            let process = p.trim_start_matches("/api/logs/").to_string();
            if process.is_empty() {
                text(StatusCode::BAD_REQUEST, "Process name required")
            } else {
                require_get(&method, || handle_logs(req.uri(), &state, Some(process)))
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };

    with_cors(response)
}

fn require_get(method: &Method, f: impl FnOnce() -> Response<ApiBody>) -> Response<ApiBody> {
    if method == Method::GET {
        f()
    } else {
        method_not_allowed()
    }
}

fn method_not_allowed() -> Response<ApiBody> {
    text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn handle_ping() -> Response<ApiBody> {
    json(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "time": Utc::now().to_rfc3339(),
        }),
    )
}

fn handle_status(state: &ApiState) -> Response<ApiBody> {
    let processes = state.supervisor.running_info();
    json(
        StatusCode::OK,
        serde_json::json!({
            "processes": processes,
            "count": processes.len(),
            "health": state.prober.results(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn handle_logs(
    uri: &hyper::Uri,
    state: &ApiState,
    path_process: Option<String>,
) -> Response<ApiBody> {
    let lines = query_param(uri, "lines")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_LINES);
    let process = path_process
        .or_else(|| query_param(uri, "process"))
        .unwrap_or_default();

    let entries = if process.is_empty() {
        state.ring.merged(lines)
    } else {
        state.ring.tail_by_tag(&process, lines)
    };

    json(
        StatusCode::OK,
        serde_json::json!({
            "logs": entries,
            "count": entries.len(),
            "process": process,
            "lines": lines,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// Server-Sent Events: push records produced since the previous tick.
/// The loop ends as soon as the client disconnects.
fn handle_logs_stream(uri: &hyper::Uri, state: &ApiState) -> Response<ApiBody> {
    let process = query_param(uri, "process").unwrap_or_default();
    let ring = state.ring.clone();
    let mut shutdown = state.shutdown.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);

    tokio::spawn(async move {
        let connected = format!(
            "data: {}\n\n",
            serde_json::json!({"type": "connected", "timestamp": Utc::now().to_rfc3339()})
        );
        if tx.send(Ok(Frame::data(Bytes::from(connected)))).await.is_err() {
            return;
        }

        let mut cursor = ring.cursor();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STREAM_TICK) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            let fresh = ring.since(cursor);
            if let Some(last) = fresh.last() {
                cursor = last.seq + 1;
            }
            let fresh: Vec<LogRecord> = fresh
                .into_iter()
                .filter(|r| process.is_empty() || r.tag == process)
                .collect();
            if fresh.is_empty() {
                continue;
            }

            let payload = serde_json::json!({
                "type": "logs",
                "logs": fresh,
                "count": fresh.len(),
                "timestamp": Utc::now().to_rfc3339(),
            });
            let event = format!("data: {payload}\n\n");
            if tx.send(Ok(Frame::data(Bytes::from(event)))).await.is_err() {
                // Client disconnected
                return;
            }
        }
    });

    let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream")
        .header(hyper::header::CACHE_CONTROL, "no-cache")
        .header(hyper::header::CONNECTION, "keep-alive")
        .body(body)
        .expect("valid response with static headers")
}

async fn handle_stop(state: &ApiState) -> Response<ApiBody> {
    let results = state.supervisor.stop_all().await;
    let success = results.iter().all(|r| r.status != "error");

    json(
        StatusCode::OK,
        serde_json::json!({
            "results": results,
            "success": success,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn query_param(uri: &hyper::Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

fn json(status: StatusCode, value: serde_json::Value) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())).boxed())
        .expect("valid response with static headers")
}

fn text(status: StatusCode, body: &'static str) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("valid response with StatusCode enum")
}

fn with_cors(mut response: Response<ApiBody>) -> Response<ApiBody> {
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        hyper::header::HeaderValue::from_static("http://localhost:*"),
    );
    headers.insert(
        "access-control-allow-methods",
        hyper::header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        hyper::header::HeaderValue::from_static("Content-Type"),
    );
    response
}
