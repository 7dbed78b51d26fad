use std::{fmt, sync::Arc, time::Duration};

use axum::extract::ws::{close_code, WebSocket};
use futures_util::StreamExt;
use tokio::{
    task::JoinSet,
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::{
    bridge::{self, BridgeError, ClientChannel, PumpExit},
    connector::ConnectError,
    port::TargetPort,
    server::AppState,
};

pub const REASON_CONNECT_TIMEOUT: &str = "Connection timeout";
pub const REASON_PROXY_ERROR: &str = "Proxy error";
pub const REASON_IDLE_TIMEOUT: &str = "Idle timeout";
pub const REASON_SHUTTING_DOWN: &str = "shutting down";

/// Time the sibling loop gets to observe cancellation before it is aborted.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// How a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    ConnectTimeout,
    ConnectFailed,
    ClientClosed,
    ClientGone,
    TargetClosed,
    IdleTimeout,
    ShuttingDown,
    Failed,
}

impl SessionOutcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectFailed => "connect_failed",
            Self::ClientClosed => "client_closed",
            Self::ClientGone => "client_gone",
            Self::TargetClosed => "target_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::ShuttingDown => "shutting_down",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What ended the bridging phase.
enum BridgeEnd {
    Pump(Result<PumpExit, BridgeError>),
    Panicked(tokio::task::JoinError),
    IdleExpired,
    Shutdown,
}

struct ActiveSession<'a> {
    state: &'a AppState,
}

impl<'a> ActiveSession<'a> {
    fn open(state: &'a AppState) -> Self {
        state.metrics.session_opened();
        Self { state }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.state.metrics.session_closed();
    }
}

/// Runs one upgraded connection to completion: connect the backend, bridge, tear down.
///
/// The idle deadline is absolute and starts here, so it also covers the connect attempt.
pub(crate) async fn run_session(
    socket: WebSocket,
    state: AppState,
    session_id: u64,
    port: TargetPort,
) -> SessionOutcome {
    let _active = ActiveSession::open(&state);
    let deadline = Instant::now() + state.cfg.idle_timeout;
    let cancel = state.shutdown.child_token();
    let target_host = state.cfg.target_host.as_str();

    let (client_tx, client_rx) = socket.split();
    let client = Arc::new(ClientChannel::new(client_tx));

    state.metrics.connect_attempt();
    let connect = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            client.close(close_code::AWAY, REASON_SHUTTING_DOWN).await;
            return SessionOutcome::ShuttingDown;
        }
        _ = tokio::time::sleep_until(deadline) => {
            state.metrics.idle_timeout();
            client.close(close_code::AWAY, REASON_IDLE_TIMEOUT).await;
            return SessionOutcome::IdleTimeout;
        }
        res = state.connector.connect(target_host, port, state.cfg.connect_timeout) => res,
    };

    let target = match connect {
        Ok(target) => target,
        Err(err @ ConnectError::Timeout { .. }) => {
            tracing::error!(session_id, %target_host, %port, "{err}");
            state.metrics.connect_timed_out();
            client
                .close(close_code::ERROR, REASON_CONNECT_TIMEOUT)
                .await;
            return SessionOutcome::ConnectTimeout;
        }
        Err(err @ ConnectError::Io { .. }) => {
            tracing::error!(session_id, %target_host, %port, "{err}");
            state.metrics.connect_failed();
            client.close(close_code::ERROR, REASON_PROXY_ERROR).await;
            return SessionOutcome::ConnectFailed;
        }
    };
    tracing::debug!(session_id, %target_host, %port, "backend connected, bridging");

    let (target_rx, target_tx) = target.into_split();
    let mut pumps = JoinSet::new();
    {
        let client = client.clone();
        let cancel = cancel.clone();
        let metrics = state.metrics.clone();
        let chunk_size = state.cfg.chunk_size;
        pumps.spawn(async move {
            bridge::client_to_target(client_rx, &client, target_tx, chunk_size, cancel, metrics)
                .await
        });
    }
    {
        let client = client.clone();
        let cancel = cancel.clone();
        let metrics = state.metrics.clone();
        let chunk_size = state.cfg.chunk_size;
        pumps.spawn(async move {
            bridge::target_to_client(target_rx, &client, chunk_size, cancel, metrics).await
        });
    }

    let mut ping = state.cfg.ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let idle = tokio::time::sleep_until(deadline);
    tokio::pin!(idle);

    let end = loop {
        tokio::select! {
            biased;
            Some(joined) = pumps.join_next() => {
                break match joined {
                    Ok(res) => BridgeEnd::Pump(res),
                    Err(err) => BridgeEnd::Panicked(err),
                };
            }
            _ = cancel.cancelled() => break BridgeEnd::Shutdown,
            _ = &mut idle => break BridgeEnd::IdleExpired,
            _ = next_tick(&mut ping) => client.ping().await,
        }
    };

    // Stop the sibling loop. Both loops race every read and write against this token.
    cancel.cancel();
    if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, drain(&mut pumps))
        .await
        .is_err()
    {
        tracing::warn!(session_id, "copy loop did not stop after cancellation; aborting");
        pumps.abort_all();
    }

    match end {
        BridgeEnd::Pump(Ok(exit)) => match exit {
            PumpExit::ClientClosed => SessionOutcome::ClientClosed,
            PumpExit::TargetClosed => SessionOutcome::TargetClosed,
            PumpExit::ClientGone | PumpExit::ClientNotOpen => SessionOutcome::ClientGone,
            PumpExit::Cancelled => {
                client.close(close_code::AWAY, REASON_SHUTTING_DOWN).await;
                SessionOutcome::ShuttingDown
            }
        },
        BridgeEnd::Pump(Err(err)) => {
            tracing::warn!(session_id, %target_host, %port, "relay error: {err}");
            state.metrics.bridge_error();
            client.close(close_code::ERROR, REASON_PROXY_ERROR).await;
            SessionOutcome::Failed
        }
        BridgeEnd::Panicked(err) => {
            tracing::error!(session_id, %target_host, %port, "copy loop panicked: {err}");
            state.metrics.bridge_error();
            client.close(close_code::ERROR, REASON_PROXY_ERROR).await;
            SessionOutcome::Failed
        }
        BridgeEnd::IdleExpired => {
            tracing::info!(session_id, %target_host, %port, "session reached idle timeout");
            state.metrics.idle_timeout();
            client.close(close_code::AWAY, REASON_IDLE_TIMEOUT).await;
            SessionOutcome::IdleTimeout
        }
        BridgeEnd::Shutdown => {
            client.close(close_code::AWAY, REASON_SHUTTING_DOWN).await;
            SessionOutcome::ShuttingDown
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drain(pumps: &mut JoinSet<Result<PumpExit, BridgeError>>) {
    while let Some(joined) = pumps.join_next().await {
        if let Ok(Err(err)) = joined {
            tracing::debug!("copy loop ended after cancellation: {err}");
        }
    }
}
