#![forbid(unsafe_code)]

mod bridge;
mod config;
mod connector;
mod metrics;
mod port;
mod server;
mod session;

pub use config::{
    RelayConfig, CONNECT_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE, IDLE_TIMEOUT, TRANSFER_CHUNK_SIZE,
};
pub use connector::{connect_backend, ConnectError};
pub use port::{TargetPort, PORT_RANGE};
pub use server::{start_server, ServerHandle, INVALID_SUBDOMAIN, WEBSOCKET_REQUIRED};
pub use session::{
    REASON_CONNECT_TIMEOUT, REASON_IDLE_TIMEOUT, REASON_PROXY_ERROR, REASON_SHUTTING_DOWN,
};
