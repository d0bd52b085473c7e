//! TCP listener and per-connection sessions
//!
//! Each connection carries exactly one request frame and one response frame.
//! Admission is bounded by a semaphore: past `max_connections` the accept
//! loop stops accepting until a session finishes, so clients queue in the
//! listen backlog instead of being refused. Every failure inside a session
//! becomes an error result; only I/O on a dead socket ends a session
//! without a response.

use crate::commands::{CommandRegistry, UNKNOWN_COMMAND};
use crate::config::GatewayConfig;
use crate::cursors::CursorEngine;
use crate::metrics;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Command, CommandResult, FrameCodec, TesseraError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name reported when the request frame could not be read or decoded
const PROTOCOL_COMMAND: &str = "Protocol";

/// Configure TCP keepalive on a socket for faster dead connection detection
fn configure_tcp_keepalive(stream: &TcpStream, keepalive_secs: u64) {
    use socket2::SockRef;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if keepalive_secs == 0 {
        return;
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    }
}

/// State every session needs
struct SessionContext {
    config: GatewayConfig,
    codec: FrameCodec,
    commands: Arc<CommandRegistry>,
    shutdown: CancellationToken,
}

/// The framed TCP gateway
pub struct GatewayServer {
    listener: TcpListener,
    context: Arc<SessionContext>,
    cursors: Arc<CursorEngine>,
}

impl GatewayServer {
    /// Bind the listener described by `config`
    pub async fn bind(
        config: GatewayConfig,
        commands: Arc<CommandRegistry>,
        cursors: Arc<CursorEngine>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        let context = Arc::new(SessionContext {
            codec: FrameCodec::new(config.protocol_settings()),
            config,
            commands,
            shutdown: CancellationToken::new(),
        });
        Ok(Self {
            listener,
            context,
            cursors,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Stop accepting, cancel in-flight sessions and close every cursor
    pub fn shutdown(&self) {
        self.context.shutdown.cancel();
    }

    /// Serve until shut down
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let max_connections = self.context.config.max_connections.max(1);
        info!("Starting gateway on {} (max {} concurrent sessions)", addr, max_connections);

        let admission = Arc::new(Semaphore::new(max_connections));
        let shutdown = self.context.shutdown.clone();
        let mut sessions = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&admission).acquire_owned() => permit?,
            };

            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            debug!("New connection from {}", peer_addr);
            configure_tcp_keepalive(&socket, self.context.config.tcp_keepalive_secs);

            let context = Arc::clone(&self.context);
            sessions.spawn(async move {
                let _permit = permit;
                metrics::ACTIVE_SESSIONS.inc();
                metrics::SESSIONS_TOTAL.inc();
                if let Err(e) = handle_session(&context, socket).await {
                    let err_str = e.to_string();
                    if err_str.contains("early eof") || err_str.contains("connection reset") {
                        debug!("Client {} disconnected: {}", peer_addr, err_str);
                    } else {
                        warn!("Session with {} ended without a response: {}", peer_addr, e);
                    }
                }
                metrics::ACTIVE_SESSIONS.dec();
            });

            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    error!("Session task failed: {}", e);
                }
            }
        }

        drop(self.listener);
        info!("Gateway stopping; waiting for {} in-flight sessions", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }
        let closed = self.cursors.close_all().await;
        info!(cursors_closed = closed, "Gateway stopped");
        Ok(())
    }
}

/// Serve one request/response exchange
async fn handle_session(context: &SessionContext, mut socket: TcpStream) -> std::result::Result<(), TesseraError> {
    let config = &context.config;
    let codec = &context.codec;

    let read = tokio::select! {
        _ = context.shutdown.cancelled() => Err(TesseraError::Cancelled),
        read = tokio::time::timeout(config.read_timeout(), codec.read_frame(&mut socket)) => match read {
            Ok(frame) => frame,
            Err(_) => Err(TesseraError::Timeout {
                phase: "read",
                secs: config.read_timeout_secs,
            }),
        },
    };

    let result = match read.and_then(|payload| codec.decode::<Command>(&payload)) {
        Ok(command) => execute(context, &command).await,
        Err(TesseraError::Io(e)) => {
            // Nobody left to answer
            return Err(TesseraError::Io(e));
        }
        Err(e) => {
            let kind = match &e {
                TesseraError::MessageTooLarge { .. } => "oversize_request",
                TesseraError::Timeout { .. } => "read_timeout",
                TesseraError::Cancelled => "shutdown",
                _ => "malformed_request",
            };
            metrics::record_protocol_error(kind);
            warn!(kind, "Rejecting request: {}", e);
            CommandResult::from_error(PROTOCOL_COMMAND, &e)
        }
    };

    write_result(context, &mut socket, &result).await?;
    let _ = socket.shutdown().await;
    Ok(())
}

/// Dispatch under the execution deadline
async fn execute(context: &SessionContext, command: &Command) -> CommandResult {
    let timeout = context.config.exec_timeout(command.options.timeout_secs);
    let cancel = context.shutdown.child_token();

    match tokio::time::timeout(timeout, context.commands.dispatch(command, &cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            let name = context
                .commands
                .match_handler(&command.text)
                .map(|h| h.name())
                .unwrap_or(UNKNOWN_COMMAND);
            warn!(command = name, secs = timeout.as_secs(), "Execution deadline elapsed");
            CommandResult::from_error(
                name,
                &TesseraError::Timeout {
                    phase: "execution",
                    secs: timeout.as_secs(),
                },
            )
        }
    }
}

/// Encode and write one response, degrading oversized payloads to an error
async fn write_result(
    context: &SessionContext,
    socket: &mut TcpStream,
    result: &CommandResult,
) -> std::result::Result<(), TesseraError> {
    let codec = &context.codec;
    let mut payload = codec.encode(result)?;

    if let Err(e) = codec.check_size(payload.len()) {
        metrics::OVERSIZE_RESPONSES_TOTAL.inc();
        warn!(command = %result.command_name, size = payload.len(), "Response too large; replacing with error");
        let fallback = result.stripped_to_error(format!(
            "Result too large to send: {}. Use cursor mode or a smaller fetch size.",
            e
        ));
        payload = codec.encode(&fallback)?;
        // Still too large: close without a response
        codec.check_size(payload.len())?;
    }

    let timeout = context.config.write_timeout();
    match tokio::time::timeout(timeout, codec.write_frame(socket, &payload)).await {
        Ok(written) => written,
        Err(_) => {
            metrics::record_protocol_error("write_timeout");
            warn!(command = %result.command_name, "Write deadline elapsed; dropping connection");
            Err(TesseraError::Timeout {
                phase: "write",
                secs: timeout.as_secs(),
            })
        }
    }
}
