use std::{future::Future, io, time::Duration};

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use crate::port::TargetPort;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        host: String,
        port: TargetPort,
        timeout: Duration,
    },
    #[error("connect to {host}:{port} failed: {source}")]
    Io {
        host: String,
        port: TargetPort,
        #[source]
        source: io::Error,
    },
}

/// Open the backend TCP connection for a session.
///
/// A single attempt is made. If `timeout` elapses first the pending connect is dropped, which
/// aborts any in-flight DNS lookup or handshake.
pub async fn connect_backend(
    host: &str,
    port: TargetPort,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let stream = race_connect(timeout, TcpStream::connect((host, port.get())))
        .await
        .map_err(|err| match err {
            Raced::Elapsed => ConnectError::Timeout {
                host: host.to_string(),
                port,
                timeout,
            },
            Raced::Failed(source) => ConnectError::Io {
                host: host.to_string(),
                port,
                source,
            },
        })?;

    // Every forwarded chunk is flushed on its own; don't let Nagle hold it back.
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%host, %port, "failed to set TCP_NODELAY: {err}");
    }
    Ok(stream)
}

/// Opens the backend stream for a session.
pub(crate) trait Connect: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: TargetPort,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<TcpStream, ConnectError>>;
}

/// One plain TCP connect attempt per session.
pub(crate) struct TcpConnector;

impl Connect for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: TargetPort,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<TcpStream, ConnectError>> {
        Box::pin(connect_backend(host, port, timeout))
    }
}

/// Never completes the handshake; every attempt runs into the connect timeout.
#[cfg(test)]
pub(crate) struct StalledConnector;

#[cfg(test)]
impl Connect for StalledConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: TargetPort,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<TcpStream, ConnectError>> {
        Box::pin(async move {
            race_connect(timeout, std::future::pending::<io::Result<TcpStream>>())
                .await
                .map_err(|_| ConnectError::Timeout {
                    host: host.to_string(),
                    port,
                    timeout,
                })
        })
    }
}

#[derive(Debug)]
enum Raced {
    Elapsed,
    Failed(io::Error),
}

async fn race_connect<T, F>(timeout: Duration, connect: F) -> Result<T, Raced>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(Raced::Failed(err)),
        Err(_) => Err(Raced::Elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stalled_connect_is_abandoned_at_the_deadline() {
        tokio::time::pause();

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let stalled = async move {
            let _flag = flag;
            std::future::pending::<io::Result<()>>().await
        };

        let handle = tokio::spawn(race_connect(Duration::from_millis(5_000), stalled));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!handle.is_finished());

        tokio::time::advance(Duration::from_millis(2)).await;
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(Raced::Elapsed)));
        assert!(dropped.load(Ordering::SeqCst), "pending connect must be dropped");
    }

    #[tokio::test]
    async fn connect_errors_are_not_reported_as_timeouts() {
        let res = race_connect(Duration::from_secs(5), async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await;
        match res {
            Err(Raced::Failed(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("expected connect failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connects_to_a_listening_backend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = race_connect(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }
}
