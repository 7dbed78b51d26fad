use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

pub const DEFAULT_LISTEN_PORT: u16 = 8443;
pub const DEFAULT_TARGET_HOST: &str = "localhost";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const TRANSFER_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

const DEFAULT_PING_INTERVAL_SECS: u64 = 120;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

const ENV_LISTEN_ADDR: &str = "RELAY_LISTEN_ADDR";
const ENV_TARGET_HOST: &str = "TARGET_HOST";
const ENV_MAX_CONNECTIONS: &str = "RELAY_MAX_CONNECTIONS";
const ENV_PING_INTERVAL_SECS: &str = "RELAY_PING_INTERVAL_SECS";
const ENV_SHUTDOWN_GRACE_MS: &str = "RELAY_SHUTDOWN_GRACE_MS";
const ENV_MAX_MESSAGE_BYTES: &str = "RELAY_MAX_MESSAGE_BYTES";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Backend host every session connects to; only the port varies per request.
    pub target_host: String,
    pub connect_timeout: Duration,
    /// Absolute lifetime of a session, measured from the upgrade.
    pub idle_timeout: Duration,
    pub chunk_size: usize,
    /// Largest client frame or message accepted; bigger ones end the session.
    pub max_message_size: usize,
    pub ping_interval: Option<Duration>,
    /// Maximum number of concurrently upgraded sessions. `0` disables the limit.
    pub max_connections: usize,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            target_host: DEFAULT_TARGET_HOST.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            chunk_size: TRANSFER_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = env_parse(ENV_LISTEN_ADDR)?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)));

        let target_host = match std::env::var(ENV_TARGET_HOST) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(anyhow!("{ENV_TARGET_HOST} must not be empty"));
                }
                trimmed.to_string()
            }
            Err(std::env::VarError::NotPresent) => DEFAULT_TARGET_HOST.to_string(),
            Err(err) => return Err(err).context(ENV_TARGET_HOST),
        };

        let max_connections =
            env_parse::<usize>(ENV_MAX_CONNECTIONS)?.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let ping_interval_secs =
            env_parse::<u64>(ENV_PING_INTERVAL_SECS)?.unwrap_or(DEFAULT_PING_INTERVAL_SECS);
        let ping_interval = match ping_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let max_message_size =
            env_parse::<usize>(ENV_MAX_MESSAGE_BYTES)?.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if max_message_size == 0 {
            return Err(anyhow!("{ENV_MAX_MESSAGE_BYTES} must be at least 1"));
        }

        let shutdown_grace = Duration::from_millis(
            env_parse::<u64>(ENV_SHUTDOWN_GRACE_MS)?.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        );

        Ok(Self {
            bind_addr,
            target_host,
            max_connections,
            max_message_size,
            ping_interval,
            shutdown_grace,
            ..Self::default()
        })
    }
}

/// Reads and parses an optional environment variable. Unset or blank values yield `None`.
fn env_parse<T>(key: &'static str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = match std::env::var(key) {
        Ok(raw) => raw,
        Err(std::env::VarError::NotPresent) => return Ok(None),
        Err(err) => return Err(err).context(key),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .with_context(|| format!("invalid {key}: {trimmed:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }

        fn unset(key: &'static str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prior }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.prior.take() {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    fn unset_all() -> Vec<EnvVarGuard> {
        [
            ENV_LISTEN_ADDR,
            ENV_TARGET_HOST,
            ENV_MAX_CONNECTIONS,
            ENV_PING_INTERVAL_SECS,
            ENV_SHUTDOWN_GRACE_MS,
            ENV_MAX_MESSAGE_BYTES,
        ]
        .into_iter()
        .map(EnvVarGuard::unset)
        .collect()
    }

    #[test]
    fn defaults_match_fixed_limits() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = unset_all();

        let cfg = RelayConfig::from_env().unwrap();
        assert_eq!(cfg.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8443)));
        assert_eq!(cfg.target_host, "localhost");
        assert_eq!(cfg.connect_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.idle_timeout, Duration::from_millis(300_000));
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.max_message_size, 64 * 1024);
        assert_eq!(cfg.ping_interval, Some(Duration::from_secs(120)));
        assert_eq!(cfg.max_connections, 1000);
    }

    #[test]
    fn reads_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = unset_all();
        let _listen = EnvVarGuard::set(ENV_LISTEN_ADDR, "127.0.0.1:9000");
        let _host = EnvVarGuard::set(ENV_TARGET_HOST, " vnc-backend ");
        let _max = EnvVarGuard::set(ENV_MAX_CONNECTIONS, "0");
        let _ping = EnvVarGuard::set(ENV_PING_INTERVAL_SECS, "0");
        let _grace = EnvVarGuard::set(ENV_SHUTDOWN_GRACE_MS, "250");
        let _message = EnvVarGuard::set(ENV_MAX_MESSAGE_BYTES, "16384");

        let cfg = RelayConfig::from_env().unwrap();
        assert_eq!(cfg.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(cfg.target_host, "vnc-backend");
        assert_eq!(cfg.max_connections, 0);
        assert_eq!(cfg.ping_interval, None);
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(250));
        assert_eq!(cfg.max_message_size, 16_384);
        assert_eq!(cfg.connect_timeout, CONNECT_TIMEOUT);
    }

    #[test]
    fn rejects_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guards = unset_all();

        {
            let _listen = EnvVarGuard::set(ENV_LISTEN_ADDR, "not-an-addr");
            let err = RelayConfig::from_env().unwrap_err();
            assert!(format!("{err:#}").contains(ENV_LISTEN_ADDR), "{err:#}");
        }

        {
            let _host = EnvVarGuard::set(ENV_TARGET_HOST, "   ");
            let err = RelayConfig::from_env().unwrap_err();
            assert!(format!("{err:#}").contains(ENV_TARGET_HOST), "{err:#}");
        }

        {
            let _max = EnvVarGuard::set(ENV_MAX_CONNECTIONS, "-1");
            assert!(RelayConfig::from_env().is_err());
        }

        {
            let _message = EnvVarGuard::set(ENV_MAX_MESSAGE_BYTES, "0");
            let err = RelayConfig::from_env().unwrap_err();
            assert!(format!("{err:#}").contains(ENV_MAX_MESSAGE_BYTES), "{err:#}");
        }
    }
}
