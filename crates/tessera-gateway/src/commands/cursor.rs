//! FETCH and CLOSE CURSOR
//!
//! Both authorize twice: first against the descriptor's database like every
//! database-scoped command, then against the database the cursor reads from.

use super::{compile, descriptor, parse, CommandHandler};
use crate::auth::AuthResult;
use crate::services::GatewayServices;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tessera_common::{Command, CommandResult, Result, Rowset, TesseraError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static FETCH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*FETCH\b"]));
static CLOSE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*CLOSE\s+CURSOR\b"]));

static FETCH_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*FETCH\s+(?:(\d+)\s+)?FROM\s+(\S+?)\s*;?\s*$").unwrap());
static CLOSE_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*CLOSE\s+CURSOR\s+(\S+?)\s*;?\s*$").unwrap());

/// Database behind `cursor_id`, provided `auth` may use it
fn cursor_database(services: &GatewayServices, auth: &AuthResult, cursor_id: &str) -> Result<String> {
    let database = services
        .cursors
        .cursor_database(cursor_id)
        .ok_or_else(|| TesseraError::CursorNotFound(cursor_id.to_string()))?;
    let checked = services.auth.authorize_for_database(auth, &database);
    if !checked.authorized {
        return Err(TesseraError::AuthorizationDenied(checked.status_message));
    }
    Ok(database)
}

/// `FETCH [<n>] FROM <cursor-id>`
pub struct Fetch {
    services: Arc<GatewayServices>,
}

impl Fetch {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for Fetch {
    fn name(&self) -> &'static str {
        "Fetch"
    }

    fn patterns(&self) -> &[Regex] {
        &FETCH_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.auth.authorize(&descriptor, descriptor.database_name()).await?;
        let caps = parse(&FETCH_GRAMMAR, &command.text, "FETCH [<count>] FROM <cursor-id>")?;
        let cursor_id = &caps[2];

        let requested = match caps.get(1) {
            Some(n) => Some(n.as_str().parse::<usize>().map_err(|_| {
                TesseraError::InvalidCommand(format!("'{}' is not a valid fetch count", n.as_str()))
            })?),
            None => command.options.fetch_size,
        };
        let fetch_size = self.services.cursors.effective_fetch_size(requested);

        let database = cursor_database(&self.services, &auth, cursor_id)?;
        let _lock = self.services.registry.read(&database, cancel).await?;
        let page = self.services.cursors.fetch(cursor_id, fetch_size, cancel).await?;

        debug!(cursor_id = %cursor_id, rows = page.rows.len(), has_more = page.has_more, "FETCH");
        Ok(CommandResult::cursor_page(
            self.name(),
            page.cursor_id,
            Rowset::new(page.columns, page.rows),
            page.has_more,
        ))
    }
}

/// `CLOSE CURSOR <cursor-id>`; closing an unknown or closed cursor is an error result
pub struct CloseCursor {
    services: Arc<GatewayServices>,
}

impl CloseCursor {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for CloseCursor {
    fn name(&self) -> &'static str {
        "CloseCursor"
    }

    fn patterns(&self) -> &[Regex] {
        &CLOSE_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, command: &Command, _cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.auth.authorize(&descriptor, descriptor.database_name()).await?;
        let caps = parse(&CLOSE_GRAMMAR, &command.text, "CLOSE CURSOR <cursor-id>")?;
        let cursor_id = &caps[1];

        cursor_database(&self.services, &auth, cursor_id)?;
        if !self.services.cursors.close(cursor_id).await {
            return Err(TesseraError::CursorNotFound(cursor_id.to_string()));
        }
        Ok(CommandResult::ack(self.name(), Some(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CommandRegistry;
    use tessera_common::{ExecutionOptions, ResultKind};
    use tokio_util::sync::CancellationToken;

    async fn seeded() -> (tempfile::TempDir, CommandRegistry) {
        let (dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();
        registry.dispatch(&as_admin("master", "CREATE DATABASE Shop"), &cancel).await;
        registry
            .dispatch(&as_admin("Shop", "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)"), &cancel)
            .await;
        let insert = registry
            .dispatch(
                &as_admin("Shop", "INSERT INTO items (name) VALUES ('a'),('b'),('c'),('d'),('e')"),
                &cancel,
            )
            .await;
        assert_eq!(insert.rows_affected, Some(5), "{:?}", insert.error_message);
        (dir, registry)
    }

    #[tokio::test]
    async fn test_fetch_pages_through_cursor() {
        let (_dir, registry) = seeded().await;
        let cancel = CancellationToken::new();

        let opened = registry
            .dispatch(
                &with(as_admin("Shop", "SELECT id, name FROM items ORDER BY id"), ExecutionOptions::cursor(2)),
                &cancel,
            )
            .await;
        assert_eq!(opened.kind, ResultKind::CursorOpened, "{:?}", opened.error_message);
        let id = opened.cursor_id.clone().unwrap();
        let mut sizes = vec![opened.rowset.unwrap().len()];
        let mut more = vec![opened.has_more.unwrap()];

        while *more.last().unwrap() {
            let page = registry
                .dispatch(&as_admin("Shop", &format!("FETCH FROM {id}")), &cancel)
                .await;
            assert_eq!(page.kind, ResultKind::CursorPage, "{:?}", page.error_message);
            sizes.push(page.rowset.unwrap().len());
            more.push(page.has_more.unwrap());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(more, vec![true, true, false]);

        let closed = registry
            .dispatch(&as_admin("Shop", &format!("CLOSE CURSOR {id}")), &cancel)
            .await;
        assert_eq!(closed.kind, ResultKind::Ack);
        let again = registry
            .dispatch(&as_admin("Shop", &format!("CLOSE CURSOR {id}")), &cancel)
            .await;
        assert!(again.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_explicit_fetch_count_overrides_options() {
        let (_dir, registry) = seeded().await;
        let cancel = CancellationToken::new();

        let opened = registry
            .dispatch(
                &with(as_admin("Shop", "SELECT * FROM items"), ExecutionOptions::cursor(1)),
                &cancel,
            )
            .await;
        let id = opened.cursor_id.unwrap();
        let page = registry
            .dispatch(&as_admin("Shop", &format!("FETCH 10 FROM {id}")), &cancel)
            .await;
        assert_eq!(page.rowset.unwrap().len(), 4);
        assert_eq!(page.has_more, Some(false));
    }

    #[tokio::test]
    async fn test_cursor_database_is_authorized() {
        let (_dir, registry) = seeded().await;
        let cancel = CancellationToken::new();
        registry.dispatch(&as_admin("master", "CREATE DATABASE Other"), &cancel).await;
        registry
            .dispatch(&as_admin("master", "CREATE LOGIN jo WITH PASSWORD 'pw'"), &cancel)
            .await;
        registry
            .dispatch(&as_admin("master", "GRANT DATABASE Other TO jo"), &cancel)
            .await;

        let opened = registry
            .dispatch(
                &with(as_admin("Shop", "SELECT * FROM items"), ExecutionOptions::cursor(1)),
                &cancel,
            )
            .await;
        let id = opened.cursor_id.unwrap();

        let stolen = registry
            .dispatch(&as_user("Other", "jo", "pw", &format!("FETCH FROM {id}")), &cancel)
            .await;
        assert!(stolen.error_message.unwrap().contains("Shop"));
    }

    #[tokio::test]
    async fn test_unknown_cursor() {
        let (_dir, registry) = seeded().await;
        let result = registry
            .dispatch(&as_admin("Shop", "FETCH 5 FROM missing"), &CancellationToken::new())
            .await;
        assert_eq!(result.error_message.as_deref(), Some("Cursor 'missing' not found"));
    }
}
