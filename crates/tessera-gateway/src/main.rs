//! Tessera Gateway binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_gateway::http_api::{self, AppState};
use tessera_gateway::{metrics, telemetry, watcher};
use tessera_gateway::{CommandRegistry, GatewayConfig, GatewayServer, GatewayServices};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tessera-gateway")]
#[command(about = "Tessera Gateway - multi-tenant SQL over a framed TCP protocol")]
struct Args {
    /// Address the gateway listens on
    #[arg(long, env = "TESSERA_LISTEN_ADDR", default_value = "0.0.0.0")]
    listen_addr: String,

    /// Gateway TCP port
    #[arg(long, env = "TESSERA_PORT", default_value = "1549")]
    port: u16,

    /// Directory holding the database files
    #[arg(long, env = "TESSERA_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Catalog file with logins, databases and grants
    #[arg(long, env = "TESSERA_CATALOG_PATH", default_value = "./catalog.sqlite")]
    catalog_path: PathBuf,

    /// Concurrent sessions; further connections wait
    #[arg(long, env = "TESSERA_MAX_CONNECTIONS", default_value = "256")]
    max_connections: usize,

    /// Largest request or response payload in bytes
    #[arg(long, env = "TESSERA_MAX_MESSAGE_SIZE", default_value = "16777216")]
    max_message_size: usize,

    /// Deflate whole messages (clients must agree)
    #[arg(long, env = "TESSERA_COMPRESSION", default_value = "false")]
    compression: bool,

    /// Request read deadline in seconds
    #[arg(long, env = "TESSERA_READ_TIMEOUT_SECS", default_value = "30")]
    read_timeout_secs: u64,

    /// Response write deadline in seconds
    #[arg(long, env = "TESSERA_WRITE_TIMEOUT_SECS", default_value = "30")]
    write_timeout_secs: u64,

    /// Execution deadline in seconds
    #[arg(long, env = "TESSERA_EXEC_TIMEOUT_SECS", default_value = "300")]
    exec_timeout_secs: u64,

    /// Close cursors idle for longer than this many seconds
    #[arg(long, env = "TESSERA_CURSOR_IDLE_TIMEOUT_SECS", default_value = "300")]
    cursor_idle_timeout_secs: u64,

    /// Idle cursor sweep interval in seconds
    #[arg(long, env = "TESSERA_CURSOR_SWEEP_INTERVAL_SECS", default_value = "30")]
    cursor_sweep_interval_secs: u64,

    /// Cursor page size when the client gives none
    #[arg(long, env = "TESSERA_DEFAULT_FETCH_SIZE", default_value = "1000")]
    default_fetch_size: usize,

    /// Row cap for snapshot results
    #[arg(long, env = "TESSERA_MAX_SNAPSHOT_ROWS", default_value = "100000")]
    max_snapshot_rows: usize,

    /// Follow database files added to or removed from the data directory
    #[arg(long, env = "TESSERA_WATCH_DATA_DIR", default_value = "true")]
    watch_data_dir: bool,

    /// HTTP port for /health, /ready and /metrics (0 disables)
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            listen_addr: self.listen_addr,
            port: self.port,
            data_dir: self.data_dir,
            catalog_path: self.catalog_path,
            max_connections: self.max_connections,
            max_message_size: self.max_message_size,
            compression: self.compression,
            read_timeout_secs: self.read_timeout_secs,
            write_timeout_secs: self.write_timeout_secs,
            exec_timeout_secs: self.exec_timeout_secs,
            cursor_idle_timeout_secs: self.cursor_idle_timeout_secs,
            cursor_sweep_interval_secs: self.cursor_sweep_interval_secs,
            default_fetch_size: self.default_fetch_size,
            max_snapshot_rows: self.max_snapshot_rows,
            watch_data_dir: self.watch_data_dir,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    telemetry::init(&args.log_level)?;
    info!("Starting Tessera Gateway");

    metrics::init_metrics();

    let http_port = args.http_port;
    let config = args.into_config();
    config.log_config();

    let services = GatewayServices::bootstrap(&config).await?;
    let commands = Arc::new(CommandRegistry::standard(Arc::clone(&services)));
    info!("Command registry initialized ({} patterns)", commands.patterns().len());

    let server = GatewayServer::bind(config.clone(), commands, Arc::clone(&services.cursors)).await?;
    let shutdown = server.shutdown_token();
    info!("Gateway listening on {}", server.local_addr()?);

    let sweeper = services.cursors.start_sweeper(shutdown.clone());

    let _watcher = if config.watch_data_dir {
        match watcher::spawn_watcher(
            Arc::clone(&services.registry),
            Duration::from_millis(config.watch_debounce_ms),
            shutdown.clone(),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to watch data directory: {} - catalog follows only gateway commands", e);
                None
            }
        }
    } else {
        None
    };

    let ready = Arc::new(AtomicBool::new(false));
    if http_port != 0 {
        let app = http_api::router(AppState {
            cursors: Arc::clone(&services.cursors),
            ready: Arc::clone(&ready),
        });
        let http_addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
        let listener = tokio::net::TcpListener::bind(&http_addr).await?;
        info!("HTTP server listening on {}", http_addr);
        info!("  /metrics - Prometheus metrics");

        let http_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { http_shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    let mut gateway = tokio::spawn(server.run());
    ready.store(true, Ordering::Release);
    info!("Tessera Gateway started successfully");

    // Wait for shutdown signal
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down Tessera Gateway");
            None
        }
        finished = &mut gateway => Some(finished),
    };
    ready.store(false, Ordering::Release);
    shutdown.cancel();

    let finished = match finished {
        Some(finished) => finished,
        None => gateway.await,
    };
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Gateway server error: {}", e),
        Err(e) => error!("Gateway task failed: {}", e),
    }

    let _ = sweeper.await;
    Ok(())
}
