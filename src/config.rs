use std::{env, net::SocketAddr, time::Duration};

use anyhow::Result;

pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;
pub const DEFAULT_SESSION_TIMEOUT_SECONDS: u64 = 30 * 60;
pub const DEFAULT_REAPER_PERIOD_SECONDS: u64 = 5 * 60;
pub const DEFAULT_TEARDOWN_GRACE_SECONDS: u64 = 5;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub reaper_period: Duration,
    pub teardown_grace: Duration,
    pub chunked_upload_threshold: u64,
    pub chunk_size: usize,
    pub subscriber_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECONDS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECONDS),
            reaper_period: Duration::from_secs(DEFAULT_REAPER_PERIOD_SECONDS),
            teardown_grace: Duration::from_secs(DEFAULT_TEARDOWN_GRACE_SECONDS),
            chunked_upload_threshold: crate::codec::CHUNKED_UPLOAD_THRESHOLD,
            chunk_size: crate::codec::DEFAULT_CHUNK_SIZE,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl Config {
    /// Same decision as [`crate::codec::should_use_chunked_upload`], against
    /// the configured threshold.
    pub fn should_use_chunked_upload(&self, file_size: u64) -> bool {
        crate::codec::exceeds_threshold(file_size, self.chunked_upload_threshold)
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_raw =
            env::var("EXPORT_PROGRESS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = normalize(&bind_raw)
            .parse::<SocketAddr>()
            .unwrap_or(defaults.bind_addr);

        let heartbeat_interval = env_seconds("EXPORT_PROGRESS_HEARTBEAT_SECONDS")
            .unwrap_or(defaults.heartbeat_interval);
        let session_timeout = env_seconds("EXPORT_PROGRESS_SESSION_TIMEOUT_SECONDS")
            .unwrap_or(defaults.session_timeout);
        let reaper_period = env_seconds("EXPORT_PROGRESS_REAPER_PERIOD_SECONDS")
            .unwrap_or(defaults.reaper_period);
        let teardown_grace = env_seconds("EXPORT_PROGRESS_TEARDOWN_GRACE_SECONDS")
            .unwrap_or(defaults.teardown_grace);

        let chunked_upload_threshold = env_parse::<u64>("EXPORT_PROGRESS_CHUNKED_UPLOAD_THRESHOLD_BYTES")
            .unwrap_or(defaults.chunked_upload_threshold);

        let chunk_size = env_parse::<usize>("EXPORT_PROGRESS_CHUNK_SIZE_BYTES")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.chunk_size);

        let subscriber_buffer = env_parse::<usize>("EXPORT_PROGRESS_SUBSCRIBER_BUFFER")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.subscriber_buffer);

        Ok(Self {
            bind_addr,
            heartbeat_interval,
            session_timeout,
            reaper_period,
            teardown_grace,
            chunked_upload_threshold,
            chunk_size,
            subscriber_buffer,
        })
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().trim_matches('"').trim_matches('\'').to_string()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| normalize(&v).parse::<T>().ok())
}

// Zero-length periods would make tokio intervals panic.
fn env_seconds(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
}
