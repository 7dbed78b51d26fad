use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tokio::{
    sync::{oneshot, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    connector::{Connect, TcpConnector},
    metrics::Metrics,
    port::TargetPort,
    session, RelayConfig,
};

pub const WEBSOCKET_REQUIRED: &str = "WebSocket request required";
pub const INVALID_SUBDOMAIN: &str = "Invalid subdomain format";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<RelayConfig>,
    pub(crate) metrics: Metrics,
    pub(crate) connector: Arc<dyn Connect>,
    pub(crate) connections: Option<Arc<Semaphore>>,
    pub(crate) sessions: TaskTracker,
    /// Parent of every session's cancellation scope.
    pub(crate) shutdown: CancellationToken,
    pub(crate) shutting_down: Arc<AtomicBool>,
}

pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Fail readiness checks and refuse new sessions while existing ones keep running.
    pub fn mark_shutting_down(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Close every live session, stop accepting connections and wait for both to finish, bounded
    /// by the configured shutdown grace.
    pub async fn shutdown(mut self) {
        let grace = self.state.cfg.shutdown_grace;

        self.mark_shutting_down();
        self.state.shutdown.cancel();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        self.state.sessions.close();
        if tokio::time::timeout(grace, self.state.sessions.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                sessions = self.state.sessions.len(),
                "sessions still running after shutdown grace"
            );
        }

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("http server did not stop within shutdown grace; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn start_server(cfg: RelayConfig) -> std::io::Result<ServerHandle> {
    start_server_with_connector(cfg, Arc::new(TcpConnector)).await
}

pub(crate) async fn start_server_with_connector(
    cfg: RelayConfig,
    connector: Arc<dyn Connect>,
) -> std::io::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let addr = listener.local_addr()?;

    let connections = (cfg.max_connections != 0)
        .then(|| Arc::new(Semaphore::new(cfg.max_connections)));

    let state = AppState {
        cfg: Arc::new(cfg),
        metrics: Metrics::new(),
        connector,
        connections,
        sessions: TaskTracker::new(),
        shutdown: CancellationToken::new(),
        shutting_down: Arc::new(AtomicBool::new(false)),
    };
    let app = build_app(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    Ok(ServerHandle {
        addr,
        state,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", any(relay_ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutting_down.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render_prometheus();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn relay_ws_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, WEBSOCKET_REQUIRED).into_response();
    };

    let host = request_host(&headers, &uri).to_string();
    let Some(port) = TargetPort::from_host(&host) else {
        tracing::warn!(%host, "invalid host format");
        state.metrics.host_rejected();
        return (StatusCode::BAD_REQUEST, INVALID_SUBDOMAIN).into_response();
    };

    if state.shutting_down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let permit = match &state.connections {
        None => None,
        Some(semaphore) => match semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    "max connections exceeded".to_string(),
                )
                    .into_response();
            }
        },
    };

    tracing::info!(
        target_host = %state.cfg.target_host,
        %port,
        "proxying websocket connection"
    );

    // Client messages are held whole by the WebSocket layer; cap them before anything is read.
    let max_message_size = state.cfg.max_message_size;
    let ws = ws
        .max_frame_size(max_message_size)
        .max_message_size(max_message_size);

    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| {
        sessions.track_future(async move {
            let _permit = permit;
            let session_id = state.metrics.next_session_id();
            let outcome = session::run_session(socket, state.clone(), session_id, port).await;
            tracing::info!(
                session_id,
                %host,
                target_host = %state.cfg.target_host,
                %port,
                %outcome,
                "websocket proxy session ended"
            );
        })
    })
}

/// The host the client asked for, without any `:port` suffix.
fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> &'a str {
    let authority = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("");
    strip_port(authority)
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, Message},
    };

    use super::*;
    use crate::{connector::StalledConnector, session::REASON_CONNECT_TIMEOUT};

    #[test]
    fn strip_port_handles_names_and_literals() {
        assert_eq!(strip_port("23456.example.com:8443"), "23456.example.com");
        assert_eq!(strip_port("23456.example.com"), "23456.example.com");
        assert_eq!(strip_port("[::1]:8443"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(strip_port("host:abc"), "host:abc");
        assert_eq!(strip_port(""), "");
    }

    #[test]
    fn request_host_prefers_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "23456.example.com:8443".parse().unwrap());
        let uri: Uri = "http://12345.other.test/".parse().unwrap();
        assert_eq!(request_host(&headers, &uri), "23456.example.com");

        let empty = HeaderMap::new();
        assert_eq!(request_host(&empty, &uri), "12345.other.test");

        let relative: Uri = "/".parse().unwrap();
        assert_eq!(request_host(&empty, &relative), "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_backend_connect_closes_with_connection_timeout() {
        let cfg = RelayConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            target_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_millis(200),
            ping_interval: None,
            shutdown_grace: Duration::from_millis(1_000),
            ..RelayConfig::default()
        };
        let handle = start_server_with_connector(cfg, Arc::new(StalledConnector))
            .await
            .unwrap();

        let mut req = format!("ws://{}/", handle.local_addr())
            .into_client_request()
            .unwrap();
        req.headers_mut()
            .insert("host", HeaderValue::from_static("23456.example.com"));
        let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

        let started = tokio::time::Instant::now();
        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(other)) => panic!("no payload expected before bridging, got {other:?}"),
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for close frame")
        .expect("expected a close frame");
        assert_eq!(frame.code, CloseCode::Error);
        assert_eq!(frame.reason.as_str(), REASON_CONNECT_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(2));

        let body = handle.state.metrics.render_prometheus();
        assert!(body.contains("relay_connect_attempts_total 1\n"), "{body}");
        assert!(body.contains("relay_connect_timeout_total 1\n"), "{body}");
        assert!(body.contains("relay_connect_fail_total 0\n"), "{body}");
        assert!(body.contains("relay_bridge_errors_total 0\n"), "{body}");

        handle.shutdown().await;
    }
}
