//! CREATE / DROP / RENAME DATABASE and SHOW DATABASES

use super::{compile, descriptor, parse, CommandHandler};
use crate::services::GatewayServices;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tessera_common::{Command, CommandResult, Result, Rowset};
use tokio_util::sync::CancellationToken;
use tracing::info;

static CREATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*CREATE\s+DATABASE\b"]));
static DROP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*DROP\s+DATABASE\b"]));
static RENAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*RENAME\s+DATABASE\b"]));
static SHOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*SHOW\s+DATABASES\b"]));

static CREATE_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*CREATE\s+DATABASE\s+(\S+?)\s*;?\s*$").unwrap());
static DROP_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*DROP\s+DATABASE\s+(\S+?)\s*;?\s*$").unwrap());
static RENAME_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*RENAME\s+DATABASE\s+(\S+)\s+TO\s+(\S+?)\s*;?\s*$").unwrap());
static SHOW_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+DATABASES\s*;?\s*$").unwrap());

/// `CREATE DATABASE <name>`
pub struct CreateDatabase {
    services: Arc<GatewayServices>,
}

impl CreateDatabase {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for CreateDatabase {
    fn name(&self) -> &'static str {
        "CreateDatabase"
    }

    fn patterns(&self) -> &[Regex] {
        &CREATE_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&CREATE_GRAMMAR, &command.text, "CREATE DATABASE <name>")?;

        let record = self.services.registry.create_database(&caps[1], cancel).await?;
        info!(login = %auth.login, database = %record.name, "CREATE DATABASE");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `DROP DATABASE <name>`
pub struct DropDatabase {
    services: Arc<GatewayServices>,
}

impl DropDatabase {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for DropDatabase {
    fn name(&self) -> &'static str {
        "DropDatabase"
    }

    fn patterns(&self) -> &[Regex] {
        &DROP_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&DROP_GRAMMAR, &command.text, "DROP DATABASE <name>")?;
        let name = &caps[1];

        let cursors = &self.services.cursors;
        let mut closed = cursors.close_for_database(name).await;
        let record = self.services.registry.delete_database(name, cancel).await?;
        // Cursors opened while the drop waited for its lock
        closed += cursors.close_for_database(&record.name).await;

        info!(login = %auth.login, database = %record.name, cursors_closed = closed, "DROP DATABASE");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `RENAME DATABASE <old> TO <new>`
pub struct RenameDatabase {
    services: Arc<GatewayServices>,
}

impl RenameDatabase {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for RenameDatabase {
    fn name(&self) -> &'static str {
        "RenameDatabase"
    }

    fn patterns(&self) -> &[Regex] {
        &RENAME_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&RENAME_GRAMMAR, &command.text, "RENAME DATABASE <old> TO <new>")?;
        let (old, new) = (&caps[1], &caps[2]);

        let cursors = &self.services.cursors;
        let mut closed = cursors.close_for_database(old).await;
        let record = self.services.registry.rename_database(old, new, cancel).await?;
        closed += cursors.close_for_database(old).await;

        info!(login = %auth.login, from = %old, to = %record.name, cursors_closed = closed, "RENAME DATABASE");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `SHOW DATABASES`: admins see every database, other logins their grants
pub struct ShowDatabases {
    services: Arc<GatewayServices>,
}

impl ShowDatabases {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for ShowDatabases {
    fn name(&self) -> &'static str {
        "ShowDatabases"
    }

    fn patterns(&self) -> &[Regex] {
        &SHOW_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, command: &Command, _cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.auth.authenticate(&descriptor).await?;
        parse(&SHOW_GRAMMAR, &command.text, "SHOW DATABASES")?;

        let names: Vec<String> = self
            .services
            .registry
            .list_databases()
            .await?
            .into_iter()
            .filter(|record| auth.can_use(&record.name))
            .map(|record| record.name)
            .collect();
        Ok(CommandResult::snapshot(self.name(), Rowset::from_names("name", names), false))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CommandRegistry;
    use crate::catalog::LoginRecord;
    use tessera_common::{ResultKind, Value};
    use tokio_util::sync::CancellationToken;

    fn names(result: &tessera_common::CommandResult) -> Vec<String> {
        result
            .rowset
            .as_ref()
            .unwrap()
            .rows
            .iter()
            .map(|row| match &row[0] {
                Value::Text(name) => name.clone(),
                other => panic!("unexpected cell {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        let first = registry.dispatch(&as_admin("master", "CREATE DATABASE TEST1"), &cancel).await;
        assert_eq!(first.kind, ResultKind::Ack);

        let second = registry.dispatch(&as_admin("master", "create database TEST1"), &cancel).await;
        assert!(second.is_error());
        assert!(second.error_message.unwrap().contains("already exists"));

        let listing = registry.dispatch(&as_admin("master", "SHOW DATABASES"), &cancel).await;
        assert_eq!(names(&listing), vec!["TEST1".to_string()]);
    }

    #[tokio::test]
    async fn test_catalog_commands_require_admin() {
        let (_dir, services) = services().await;
        catalog_of(&services)
            .insert_login(&LoginRecord::new("bob", "pw", false))
            .unwrap();
        let registry = CommandRegistry::standard(services);

        let result = registry
            .dispatch(&as_user("master", "bob", "pw", "CREATE DATABASE SALES"), &CancellationToken::new())
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("admin"));
    }

    #[tokio::test]
    async fn test_invalid_syntax_names_expected_form() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);

        let result = registry
            .dispatch(&as_admin("master", "RENAME DATABASE A"), &CancellationToken::new())
            .await;
        assert_eq!(result.command_name, "RenameDatabase");
        assert!(result.error_message.unwrap().contains("RENAME DATABASE <old> TO <new>"));
    }

    #[tokio::test]
    async fn test_rename_then_drop() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        registry.dispatch(&as_admin("master", "CREATE DATABASE Alpha"), &cancel).await;
        let renamed = registry
            .dispatch(&as_admin("master", "RENAME DATABASE Alpha TO Beta"), &cancel)
            .await;
        assert_eq!(renamed.kind, ResultKind::Ack, "{:?}", renamed.error_message);

        let listing = registry.dispatch(&as_admin("master", "SHOW DATABASES"), &cancel).await;
        assert_eq!(names(&listing), vec!["Beta".to_string()]);

        let dropped = registry.dispatch(&as_admin("master", "DROP DATABASE beta;"), &cancel).await;
        assert_eq!(dropped.kind, ResultKind::Ack, "{:?}", dropped.error_message);
        let missing = registry.dispatch(&as_admin("master", "DROP DATABASE Beta"), &cancel).await;
        assert!(missing.error_message.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_show_databases_filters_by_grant() {
        let (_dir, services) = services().await;
        let catalog = catalog_of(&services).clone();
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        registry.dispatch(&as_admin("master", "CREATE DATABASE ONE"), &cancel).await;
        registry.dispatch(&as_admin("master", "CREATE DATABASE TWO"), &cancel).await;
        catalog.insert_login(&LoginRecord::new("carol", "secret", false)).unwrap();
        catalog.grant("carol", "TWO").unwrap();

        let listing = registry
            .dispatch(&as_user("master", "carol", "secret", "SHOW DATABASES"), &cancel)
            .await;
        assert_eq!(names(&listing), vec!["TWO".to_string()]);
    }
}
