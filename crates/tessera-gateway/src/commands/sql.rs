//! SQL pass-through: row-returning queries and non-queries

use super::{compile, descriptor, CommandHandler};
use crate::engine::RowReader;
use crate::services::GatewayServices;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tessera_common::{Command, CommandResult, ResultMode, Result, Row, Rowset, TesseraError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static QUERY_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"^\s*(SELECT|WITH|VALUES|PRAGMA|EXPLAIN)\b"]));
static NON_QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"^\s*(INSERT|UPDATE|DELETE|REPLACE|CREATE|DROP|ALTER|VACUUM|REINDEX|ANALYZE)\b"])
});

/// Row-returning statement, served as a snapshot or through a cursor
pub struct Query {
    services: Arc<GatewayServices>,
}

impl Query {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }

    /// Read up to `limit` rows, then read one more to learn whether more remain
    async fn read_snapshot(
        reader: &mut Box<dyn RowReader>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Row>, bool)> {
        let mut rows = Vec::new();
        while rows.len() < limit {
            if cancel.is_cancelled() {
                return Err(TesseraError::Cancelled);
            }
            match reader.read_row().await? {
                Some(row) => rows.push(row),
                None => return Ok((rows, false)),
            }
        }
        let has_more = reader.read_row().await?.is_some();
        Ok((rows, has_more))
    }
}

#[async_trait]
impl CommandHandler for Query {
    fn name(&self) -> &'static str {
        "Query"
    }

    fn patterns(&self) -> &[Regex] {
        &QUERY_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let database = descriptor.database_name();
        self.services.auth.authorize(&descriptor, database).await?;

        let registry = &self.services.registry;
        let _lock = registry.read(database, cancel).await?;
        let target = registry.resolve_connection_target(database).await?;
        let options = &command.options;

        match options.result_mode {
            ResultMode::Cursor => {
                let cursors = &self.services.cursors;
                let fetch_size = cursors.effective_fetch_size(options.fetch_size);
                let page = cursors
                    .open_cursor(database, &target, &command.text, fetch_size)
                    .await?;
                Ok(CommandResult::cursor_opened(
                    self.name(),
                    page.cursor_id,
                    Rowset::new(page.columns, page.rows),
                    page.has_more,
                ))
            }
            ResultMode::Snapshot => {
                let cap = self.services.max_snapshot_rows;
                let limit = options.max_rows.map_or(cap, |n| n.min(cap));

                let mut reader = registry.engine().execute_reader(&target, &command.text).await?;
                let outcome = Self::read_snapshot(&mut reader, limit, cancel).await;
                let columns = reader.columns().to_vec();
                reader.close().await;

                let (rows, has_more) = outcome?;
                debug!(database = %database, rows = rows.len(), has_more, "Snapshot served");
                Ok(CommandResult::snapshot(self.name(), Rowset::new(columns, rows), has_more))
            }
        }
    }
}

/// Statement that changes data or schema; runs under the write lock
pub struct NonQuery {
    services: Arc<GatewayServices>,
}

impl NonQuery {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for NonQuery {
    fn name(&self) -> &'static str {
        "NonQuery"
    }

    fn patterns(&self) -> &[Regex] {
        &NON_QUERY_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let database = descriptor.database_name();
        self.services.auth.authorize(&descriptor, database).await?;

        let registry = &self.services.registry;
        let _lock = registry.write(database, cancel).await?;
        let target = registry.resolve_connection_target(database).await?;

        let affected = registry.engine().execute_non_query(&target, &command.text).await?;
        debug!(database = %database, affected, "Non-query executed");
        Ok(CommandResult::ack(self.name(), Some(affected)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CommandRegistry;
    use crate::catalog::LoginRecord;
    use tessera_common::{ColumnType, ExecutionOptions, ResultKind, Value};
    use tokio_util::sync::CancellationToken;

    async fn shop() -> (tempfile::TempDir, CommandRegistry, std::sync::Arc<crate::services::GatewayServices>) {
        let (dir, services) = services().await;
        let registry = CommandRegistry::standard(services.clone());
        let cancel = CancellationToken::new();
        registry.dispatch(&as_admin("master", "CREATE DATABASE Shop"), &cancel).await;
        registry
            .dispatch(
                &as_admin("Shop", "CREATE TABLE items (id INTEGER PRIMARY KEY, name VARCHAR(20), price REAL)"),
                &cancel,
            )
            .await;
        registry
            .dispatch(
                &as_admin("Shop", "INSERT INTO items (name, price) VALUES ('pen', 1.5), ('ink', NULL), ('pad', 3)"),
                &cancel,
            )
            .await;
        (dir, registry, services)
    }

    #[tokio::test]
    async fn test_snapshot_returns_typed_rows() {
        let (_dir, registry, _services) = shop().await;
        let result = registry
            .dispatch(&as_admin("Shop", "SELECT id, name, price FROM items ORDER BY id"), &CancellationToken::new())
            .await;
        assert_eq!(result.kind, ResultKind::Snapshot, "{:?}", result.error_message);
        assert_eq!(result.has_more, Some(false));

        let rowset = result.rowset.unwrap();
        assert_eq!(rowset.columns[1].column_type, ColumnType::Text);
        assert_eq!(rowset.columns[1].max_length, Some(20));
        assert_eq!(rowset.columns[2].column_type, ColumnType::Real);
        assert_eq!(rowset.rows.len(), 3);
        assert_eq!(rowset.rows[0][1], Value::Text("pen".into()));
        assert_eq!(rowset.rows[1][2], Value::Null);
    }

    #[tokio::test]
    async fn test_snapshot_max_rows_sets_has_more() {
        let (_dir, registry, _services) = shop().await;
        let options = ExecutionOptions {
            max_rows: Some(2),
            ..Default::default()
        };
        let result = registry
            .dispatch(&with(as_admin("Shop", "SELECT * FROM items"), options), &CancellationToken::new())
            .await;
        assert_eq!(result.rowset.unwrap().len(), 2);
        assert_eq!(result.has_more, Some(true));
    }

    #[tokio::test]
    async fn test_engine_errors_surface_verbatim() {
        let (_dir, registry, _services) = shop().await;
        let cancel = CancellationToken::new();

        let result = registry
            .dispatch(&as_admin("Shop", "SELECT * FROM nowhere"), &cancel)
            .await;
        assert!(result.error_message.unwrap().contains("no such table: nowhere"));

        let result = registry
            .dispatch(&as_admin("Shop", "INSERT INTO items (id) VALUES (1)"), &cancel)
            .await;
        assert!(result.error_message.unwrap().contains("UNIQUE constraint failed"));
    }

    #[tokio::test]
    async fn test_unauthorized_login_denied_regardless_of_text() {
        let (_dir, registry, services) = shop().await;
        catalog_of(&services)
            .insert_login(&LoginRecord::new("kim", "pw", false))
            .unwrap();
        let cancel = CancellationToken::new();

        for text in ["SELECT name FROM items", "SELECT FROM WHERE", "DELETE FROM items"] {
            let result = registry.dispatch(&as_user("Shop", "kim", "pw", text), &cancel).await;
            let message = result.error_message.unwrap();
            assert!(message.contains("not authorized"), "{message}");
            assert!(message.contains("Shop"), "{message}");
        }
    }

    #[tokio::test]
    async fn test_query_against_missing_database() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let result = registry
            .dispatch(&as_admin("Ghost", "SELECT 1"), &CancellationToken::new())
            .await;
        assert_eq!(result.error_message.as_deref(), Some("Database 'Ghost' does not exist"));
    }
}
