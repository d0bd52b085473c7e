//! GRANT / REVOKE DATABASE and SHOW GRANTS

use super::{compile, descriptor, parse, CommandHandler};
use crate::auth::require_admin;
use crate::catalog::{DatabaseRecord, LoginRecord};
use crate::registry::LockMode;
use crate::services::GatewayServices;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tessera_common::{ColumnDef, ColumnType, Command, CommandResult, Result, Rowset, TesseraError, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

static GRANT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*GRANT\s+DATABASE\b"]));
static REVOKE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*REVOKE\s+DATABASE\b"]));
static SHOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*SHOW\s+GRANTS\b"]));

static GRANT_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*GRANT\s+DATABASE\s+(\S+)\s+TO\s+(\S+?)\s*;?\s*$").unwrap());
static REVOKE_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*REVOKE\s+DATABASE\s+(\S+)\s+FROM\s+(\S+?)\s*;?\s*$").unwrap());
static SHOW_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+GRANTS(?:\s+FOR\s+(\S+?))?\s*;?\s*$").unwrap());

/// Resolve both ends of a grant to their catalog spelling
async fn resolve(services: &GatewayServices, database: &str, login: &str) -> Result<(DatabaseRecord, LoginRecord)> {
    let catalog = services.registry.catalog();
    let login = catalog
        .get_login(login)
        .await?
        .ok_or_else(|| TesseraError::NotFound(format!("Login '{}'", login)))?;
    let database = catalog
        .get_database(database)
        .await?
        .ok_or_else(|| TesseraError::DatabaseNotFound(database.to_string()))?;
    Ok((database, login))
}

/// `GRANT DATABASE <db> TO <login>`
pub struct GrantDatabase {
    services: Arc<GatewayServices>,
}

impl GrantDatabase {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for GrantDatabase {
    fn name(&self) -> &'static str {
        "GrantDatabase"
    }

    fn patterns(&self) -> &[Regex] {
        &GRANT_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&GRANT_GRAMMAR, &command.text, "GRANT DATABASE <database> TO <login>")?;

        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        let (database, login) = resolve(&self.services, &caps[1], &caps[2]).await?;
        let added = registry.catalog().grant(&login.name, &database.name).await?;
        info!(login = %auth.login, grantee = %login.name, database = %database.name, added, "GRANT DATABASE");
        Ok(CommandResult::ack(self.name(), Some(u64::from(added))))
    }
}

/// `REVOKE DATABASE <db> FROM <login>`
pub struct RevokeDatabase {
    services: Arc<GatewayServices>,
}

impl RevokeDatabase {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for RevokeDatabase {
    fn name(&self) -> &'static str {
        "RevokeDatabase"
    }

    fn patterns(&self) -> &[Regex] {
        &REVOKE_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&REVOKE_GRAMMAR, &command.text, "REVOKE DATABASE <database> FROM <login>")?;

        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        let (database, login) = resolve(&self.services, &caps[1], &caps[2]).await?;
        if !registry.catalog().revoke(&login.name, &database.name).await? {
            return Err(TesseraError::NotFound(format!(
                "Grant of database '{}' to login '{}'",
                database.name, login.name
            )));
        }
        info!(login = %auth.login, grantee = %login.name, database = %database.name, "REVOKE DATABASE");
        Ok(CommandResult::ack(self.name(), Some(1)))
    }
}

/// `SHOW GRANTS [FOR <login>]`: admins may list anyone's, others only their own
pub struct ShowGrants {
    services: Arc<GatewayServices>,
}

impl ShowGrants {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for ShowGrants {
    fn name(&self) -> &'static str {
        "ShowGrants"
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
        let caps = parse(&SHOW_GRAMMAR, &command.text, "SHOW GRANTS [FOR <login>]")?;
        let catalog = self.services.registry.catalog();

        let pairs: Vec<(String, String)> = match caps.get(1).map(|m| m.as_str()) {
            None if auth.is_admin => catalog.list_grants().await?,
            None => catalog
                .grants_for(&auth.login)
                .await?
                .into_iter()
                .map(|db| (auth.login.clone(), db))
                .collect(),
            Some(target) => {
                if !target.eq_ignore_ascii_case(&auth.login) {
                    require_admin(&auth)?;
                }
                let login = catalog
                    .get_login(target)
                    .await?
                    .ok_or_else(|| TesseraError::NotFound(format!("Login '{}'", target)))?;
                catalog
                    .grants_for(&login.name)
                    .await?
                    .into_iter()
                    .map(|db| (login.name.clone(), db))
                    .collect()
            }
        };

        let columns = ["login", "database"]
            .into_iter()
            .map(|name| {
                let mut def = ColumnDef::new(name, ColumnType::Text);
                def.nullable = false;
                def
            })
            .collect();
        let rows = pairs
            .into_iter()
            .map(|(login, database)| vec![Value::Text(login), Value::Text(database)])
            .collect();
        Ok(CommandResult::snapshot(self.name(), Rowset::new(columns, rows), false))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::CommandRegistry;
    use tessera_common::{ResultKind, Value};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_grant_enables_access_and_revoke_removes_it() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        registry.dispatch(&as_admin("master", "CREATE DATABASE Sales"), &cancel).await;
        registry
            .dispatch(&as_admin("master", "CREATE LOGIN hank WITH PASSWORD 'pw'"), &cancel)
            .await;

        let denied = registry
            .dispatch(&as_user("Sales", "hank", "pw", "SELECT 1"), &cancel)
            .await;
        assert!(denied.error_message.unwrap().contains("Sales"));

        let granted = registry
            .dispatch(&as_admin("master", "GRANT DATABASE sales TO HANK"), &cancel)
            .await;
        assert_eq!(granted.rows_affected, Some(1), "{:?}", granted.error_message);
        let again = registry
            .dispatch(&as_admin("master", "GRANT DATABASE Sales TO hank"), &cancel)
            .await;
        assert_eq!(again.rows_affected, Some(0));

        let allowed = registry
            .dispatch(&as_user("Sales", "hank", "pw", "SELECT 1"), &cancel)
            .await;
        assert_eq!(allowed.kind, ResultKind::Snapshot, "{:?}", allowed.error_message);

        let mine = registry
            .dispatch(&as_user("master", "hank", "pw", "SHOW GRANTS"), &cancel)
            .await;
        assert_eq!(
            mine.rowset.unwrap().rows,
            vec![vec![Value::Text("hank".into()), Value::Text("Sales".into())]]
        );

        let revoked = registry
            .dispatch(&as_admin("master", "REVOKE DATABASE Sales FROM hank"), &cancel)
            .await;
        assert_eq!(revoked.kind, ResultKind::Ack);
        let twice = registry
            .dispatch(&as_admin("master", "REVOKE DATABASE Sales FROM hank"), &cancel)
            .await;
        assert!(twice.is_error());
    }

    #[tokio::test]
    async fn test_grant_requires_existing_parties() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        let no_db = registry
            .dispatch(&as_admin("master", "GRANT DATABASE Nowhere TO admin"), &cancel)
            .await;
        assert!(no_db.error_message.unwrap().contains("does not exist"));

        registry.dispatch(&as_admin("master", "CREATE DATABASE Real"), &cancel).await;
        let no_login = registry
            .dispatch(&as_admin("master", "GRANT DATABASE Real TO ghost"), &cancel)
            .await;
        assert!(no_login.error_message.unwrap().contains("Login 'ghost'"));
    }

    #[tokio::test]
    async fn test_show_grants_for_other_login_requires_admin() {
        let (_dir, services) = services().await;
        let registry = CommandRegistry::standard(services);
        let cancel = CancellationToken::new();

        registry
            .dispatch(&as_admin("master", "CREATE LOGIN ivy WITH PASSWORD 'pw'"), &cancel)
            .await;
        let result = registry
            .dispatch(&as_user("master", "ivy", "pw", "SHOW GRANTS FOR admin"), &cancel)
            .await;
        assert!(result.is_error());

        let own = registry
            .dispatch(&as_user("master", "ivy", "pw", "SHOW GRANTS FOR ivy"), &cancel)
            .await;
        assert_eq!(own.kind, ResultKind::Snapshot);
    }
}
