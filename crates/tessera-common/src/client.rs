//! Minimal async client: one TCP connection per command

use crate::codec::{FrameCodec, ProtocolSettings};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, TesseraError};
use crate::protocol::{Command, CommandResult, ExecutionOptions};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Sends commands to a gateway described by a connection descriptor
#[derive(Debug, Clone)]
pub struct GatewayClient {
    descriptor: ConnectionDescriptor,
    codec: FrameCodec,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(descriptor: ConnectionDescriptor, settings: ProtocolSettings) -> Self {
        Self {
            descriptor,
            codec: FrameCodec::new(settings),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Same server and credentials, different database
    pub fn for_database(&self, database: impl Into<String>) -> Self {
        let mut client = self.clone();
        client.descriptor.database = Some(database.into());
        client
    }

    /// Same server and database, different login
    pub fn as_login(&self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        let mut client = self.clone();
        client.descriptor = client.descriptor.with_credentials(user_id, password);
        client
    }

    /// Run `text` with default options
    pub async fn execute(&self, text: &str) -> Result<CommandResult> {
        self.send(&Command::new(&self.descriptor, text)).await
    }

    /// Run `text` with explicit options
    pub async fn execute_with(&self, text: &str, options: ExecutionOptions) -> Result<CommandResult> {
        self.send(&Command::new(&self.descriptor, text).with_options(options)).await
    }

    /// Send one command and wait for its result
    pub async fn send(&self, command: &Command) -> Result<CommandResult> {
        let server = self
            .descriptor
            .server
            .clone()
            .ok_or_else(|| TesseraError::InvalidDescriptor("Server is required".into()))?;
        let addr = format!("{}:{}", server, self.descriptor.port);

        let exchange = async {
            let mut stream = TcpStream::connect(&addr).await?;
            let payload = self.codec.encode(command)?;
            self.codec.write_frame(&mut stream, &payload).await?;
            let response = self.codec.read_frame(&mut stream).await?;
            let result: CommandResult = self.codec.decode(&response)?;
            Ok::<_, TesseraError>(result)
        };

        let result = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TesseraError::Timeout {
                phase: "client exchange",
                secs: self.timeout.as_secs(),
            })??;
        debug!(addr = %addr, kind = ?result.kind, "Command completed");
        Ok(result)
    }
}
