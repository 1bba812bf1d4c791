//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_shared::constants::{MAX_FRAME_SIZE, MAX_UPLOAD_SIZE};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./murmur.db`
    pub database_path: PathBuf,

    /// Directory uploads are written to.
    /// Env: `UPLOAD_DIR`
    /// Default: `./uploads`
    pub upload_dir: PathBuf,

    /// Env: `MAX_UPLOAD_SIZE` (bytes)
    pub max_upload_size: usize,

    /// Largest accepted socket frame.
    /// Env: `MAX_FRAME_SIZE` (bytes)
    pub max_frame_size: usize,

    /// Close connections with no traffic for this long.
    /// Env: `IDLE_TIMEOUT_SECS` (0 disables)
    /// Default: disabled
    pub idle_timeout: Option<Duration>,

    /// Env: `INSTANCE_NAME`
    /// Default: `"Murmur Relay"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8000).into(),
            database_path: PathBuf::from("./murmur.db"),
            upload_dir: PathBuf::from("./uploads"),
            max_upload_size: MAX_UPLOAD_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            idle_timeout: None,
            instance_name: "Murmur Relay".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(path);
        }

        if let Some(size) = parsed(&lookup, "MAX_UPLOAD_SIZE") {
            config.max_upload_size = size;
        }

        if let Some(size) = parsed(&lookup, "MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }

        if let Some(secs) = parsed::<u64>(&lookup, "IDLE_TIMEOUT_SECS") {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            if !name.is_empty() {
                config.instance_name = name;
            }
        }

        if config.max_frame_size < config.max_upload_size {
            tracing::warn!(
                max_frame_size = config.max_frame_size,
                max_upload_size = config.max_upload_size,
                "MAX_FRAME_SIZE is below MAX_UPLOAD_SIZE; large uploads will be cut off"
            );
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
