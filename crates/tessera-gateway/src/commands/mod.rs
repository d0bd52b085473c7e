//! Command registry and dispatcher
//!
//! Every command kind is a [`CommandHandler`] with a display name and an
//! ordered list of patterns matched against the upper-cased command text.
//! Dispatch walks the handlers in table order and the first match wins, so
//! specific forms (`CREATE DATABASE`) are listed before generic ones
//! (`CREATE ...` as SQL).
//!
//! Handlers parse the original text themselves with case-insensitive
//! grammars so identifiers and passwords keep their spelling.

mod cursor;
mod database;
mod login;
mod grant;
mod sql;

pub use cursor::{CloseCursor, Fetch};
pub use database::{CreateDatabase, DropDatabase, RenameDatabase, ShowDatabases};
pub use grant::{GrantDatabase, RevokeDatabase, ShowGrants};
pub use login::{AlterLoginAdmin, AlterLoginPassword, CreateLogin, DropLogin, ShowLogins};
pub use sql::{NonQuery, Query};

use crate::errors::{self, ErrorCategory};
use crate::metrics;
use crate::services::GatewayServices;
use crate::utils::preview;
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::sync::Arc;
use std::time::Instant;
use tessera_common::{Command, CommandResult, ConnectionDescriptor, Result, TesseraError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Name reported for text no handler recognizes
pub const UNKNOWN_COMMAND: &str = "Unknown";

/// One kind of command the gateway understands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Display name, echoed in the result
    fn name(&self) -> &'static str;

    /// Patterns over the upper-cased command text
    fn patterns(&self) -> &[Regex];

    /// Whether the command changes data or catalog state
    fn is_mutating(&self) -> bool;

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult>;
}

/// Ordered table of command handlers
pub struct CommandRegistry {
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new(handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        Self { handlers }
    }

    /// The full command set in dispatch order
    pub fn standard(services: Arc<GatewayServices>) -> Self {
        let s = || Arc::clone(&services);
        Self::new(vec![
            Arc::new(CreateDatabase::new(s())),
            Arc::new(DropDatabase::new(s())),
            Arc::new(RenameDatabase::new(s())),
            Arc::new(ShowDatabases::new(s())),
            Arc::new(CreateLogin::new(s())),
            Arc::new(DropLogin::new(s())),
            Arc::new(AlterLoginPassword::new(s())),
            Arc::new(AlterLoginAdmin::new(s())),
            Arc::new(ShowLogins::new(s())),
            Arc::new(GrantDatabase::new(s())),
            Arc::new(RevokeDatabase::new(s())),
            Arc::new(ShowGrants::new(s())),
            Arc::new(Fetch::new(s())),
            Arc::new(CloseCursor::new(s())),
            Arc::new(Query::new(s())),
            Arc::new(NonQuery::new(s())),
        ])
    }

    pub fn handlers(&self) -> &[Arc<dyn CommandHandler>] {
        &self.handlers
    }

    /// First handler whose pattern matches `text`
    pub fn match_handler(&self, text: &str) -> Option<&Arc<dyn CommandHandler>> {
        let upper = text.to_uppercase();
        self.handlers
            .iter()
            .find(|h| h.patterns().iter().any(|p| p.is_match(&upper)))
    }

    /// Every recognized pattern, in dispatch order
    pub fn patterns(&self) -> Vec<&str> {
        self.handlers
            .iter()
            .flat_map(|h| h.patterns().iter().map(Regex::as_str))
            .collect()
    }

    /// Route `command` to its handler; failures become error results
    #[instrument(skip_all, fields(command = tracing::field::Empty))]
    pub async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> CommandResult {
        let started = Instant::now();

        let Some(handler) = self.match_handler(&command.text) else {
            warn!(text = %preview(&command.text), "Unrecognized command");
            metrics::record_command(UNKNOWN_COMMAND, false, started.elapsed().as_secs_f64());
            return CommandResult::error(
                UNKNOWN_COMMAND,
                format!(
                    "Unrecognized command. Supported patterns: {}",
                    self.patterns().join(" | ")
                ),
            );
        };

        let name = handler.name();
        tracing::Span::current().record("command", name);
        debug!(mutating = handler.is_mutating(), text = %preview(&command.text), "Dispatching command");

        // Dropping the handler future interrupts any engine call in progress
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TesseraError::Cancelled),
            outcome = handler.execute(command, cancel) => outcome,
        };

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(result) => {
                metrics::record_command(name, !result.is_error(), elapsed);
                info!(kind = ?result.kind, elapsed_ms = (elapsed * 1000.0) as u64, "Command completed");
                result
            }
            Err(e) => {
                let category = errors::classify(&e);
                if matches!(e, TesseraError::Execution(_)) || category == ErrorCategory::Internal {
                    metrics::record_engine_error(&category.to_string());
                }
                metrics::record_command(name, false, elapsed);
                if e.is_client_error() {
                    info!(category = %category, "Command rejected: {}", e);
                } else {
                    warn!(category = %category, "Command failed: {}", e);
                }
                CommandResult::from_error(name, &e)
            }
        }
    }
}

/// Parse the command's descriptor and refuse uninitialized ones
pub(crate) fn descriptor(command: &Command) -> Result<ConnectionDescriptor> {
    let descriptor = command.descriptor()?;
    descriptor.ensure_initialized()?;
    Ok(descriptor)
}

/// Apply a handler grammar, naming the expected form on mismatch
pub(crate) fn parse<'t>(grammar: &Regex, text: &'t str, expected: &str) -> Result<Captures<'t>> {
    grammar
        .captures(text)
        .ok_or_else(|| TesseraError::InvalidCommand(format!("expected {}", expected)))
}

/// Compile a fixed pattern list
pub(crate) fn compile(sources: &[&str]) -> Vec<Regex> {
    sources.iter().map(|s| Regex::new(s).unwrap()).collect()
}

/// Unescape a single-quoted literal body (`''` → `'`)
pub(crate) fn unquote(body: &str) -> String {
    body.replace("''", "'")
}
