//! Gateway configuration
//!
//! All values can be overridden via `TESSERA_*` environment variables; the
//! binary layers command-line flags on top.

use crate::cursors::CursorConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tessera_common::codec::DEFAULT_MAX_MESSAGE_SIZE;
use tessera_common::descriptor::DEFAULT_PORT;
use tessera_common::ProtocolSettings;
use tracing::info;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the TCP listener binds to
    pub listen_addr: String,
    /// TCP port (0 picks an ephemeral port)
    pub port: u16,
    /// Directory holding one `<NAME>.db` file per database
    pub data_dir: PathBuf,
    /// Catalog file (logins, databases, grants)
    pub catalog_path: PathBuf,
    /// Sessions served concurrently; further connections wait
    pub max_connections: usize,
    /// Largest request or response payload in bytes
    pub max_message_size: usize,
    /// Whole-message deflate compression
    pub compression: bool,
    /// Deadline for reading one request frame
    pub read_timeout_secs: u64,
    /// Deadline for writing one response frame
    pub write_timeout_secs: u64,
    /// Execution deadline; per-command overrides are capped to this
    pub exec_timeout_secs: u64,
    /// Deadline for acquiring a database lock
    pub lock_timeout_secs: u64,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Close cursors idle for longer than this
    pub cursor_idle_timeout_secs: u64,
    /// How often idle cursors are swept
    pub cursor_sweep_interval_secs: u64,
    /// Maximum number of open cursors
    pub max_cursors: usize,
    /// Cursor page size when the client gives none
    pub default_fetch_size: usize,
    /// Row cap for snapshot results
    pub max_snapshot_rows: usize,
    /// TCP keepalive time in seconds (detects dead connections)
    pub tcp_keepalive_secs: u64,
    /// Follow files added to or removed from the data directory
    pub watch_data_dir: bool,
    /// Debounce window for data directory events
    pub watch_debounce_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: env_or("TESSERA_LISTEN_ADDR", "0.0.0.0".to_string()),
            port: env_or("TESSERA_PORT", DEFAULT_PORT),
            data_dir: env_or("TESSERA_DATA_DIR", PathBuf::from("./data")),
            catalog_path: env_or("TESSERA_CATALOG_PATH", PathBuf::from("./catalog.sqlite")),
            max_connections: env_or("TESSERA_MAX_CONNECTIONS", 256),
            max_message_size: env_or("TESSERA_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE),
            compression: env_or("TESSERA_COMPRESSION", false),
            read_timeout_secs: env_or("TESSERA_READ_TIMEOUT_SECS", 30),
            write_timeout_secs: env_or("TESSERA_WRITE_TIMEOUT_SECS", 30),
            exec_timeout_secs: env_or("TESSERA_EXEC_TIMEOUT_SECS", 300),
            lock_timeout_secs: env_or("TESSERA_LOCK_TIMEOUT_SECS", 60),
            busy_timeout_ms: env_or("TESSERA_BUSY_TIMEOUT_MS", 5_000),
            cursor_idle_timeout_secs: env_or("TESSERA_CURSOR_IDLE_TIMEOUT_SECS", 300), // 5 minutes
            cursor_sweep_interval_secs: env_or("TESSERA_CURSOR_SWEEP_INTERVAL_SECS", 30),
            max_cursors: env_or("TESSERA_MAX_CURSORS", 1000),
            default_fetch_size: env_or("TESSERA_DEFAULT_FETCH_SIZE", 1000),
            max_snapshot_rows: env_or("TESSERA_MAX_SNAPSHOT_ROWS", 100_000),
            tcp_keepalive_secs: env_or("TESSERA_TCP_KEEPALIVE_SECS", 10),
            watch_data_dir: env_or("TESSERA_WATCH_DATA_DIR", true),
            watch_debounce_ms: env_or("TESSERA_WATCH_DEBOUNCE_MS", 200),
        }
    }
}

impl GatewayConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            max_message_size: self.max_message_size,
            compression: self.compression,
        }
    }

    pub fn cursor_config(&self) -> CursorConfig {
        CursorConfig {
            max_cursors: self.max_cursors,
            idle_timeout: Duration::from_secs(self.cursor_idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.cursor_sweep_interval_secs.max(1)),
            default_fetch_size: self.default_fetch_size.max(1),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Execution deadline for one command, honouring a shorter client override
    pub fn exec_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = match requested_secs {
            Some(requested) if requested > 0 => requested.min(self.exec_timeout_secs),
            _ => self.exec_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Log configuration on startup
    pub fn log_config(&self) {
        info!(
            "Gateway config: bind={}, data_dir={}, catalog={}, max_connections={}, max_message={}KB, compression={}",
            self.bind_address(),
            self.data_dir.display(),
            self.catalog_path.display(),
            self.max_connections,
            self.max_message_size / 1024,
            self.compression
        );
        info!(
            "Gateway timeouts: read={}s, write={}s, exec={}s, lock={}s, cursor_idle={}s, sweep={}s",
            self.read_timeout_secs,
            self.write_timeout_secs,
            self.exec_timeout_secs,
            self.lock_timeout_secs,
            self.cursor_idle_timeout_secs,
            self.cursor_sweep_interval_secs
        );
    }
}
