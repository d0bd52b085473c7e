//! Login management: CREATE / DROP / ALTER LOGIN and SHOW LOGINS

use super::{compile, descriptor, parse, unquote, CommandHandler};
use crate::auth::{require_admin, PasswordHash};
use crate::catalog::LoginRecord;
use crate::registry::LockMode;
use crate::services::GatewayServices;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tessera_common::{ColumnDef, ColumnType, Command, CommandResult, Result, Rowset, TesseraError, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

static CREATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*CREATE\s+LOGIN\b"]));
static DROP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*DROP\s+LOGIN\b"]));
static PASSWORD_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"^\s*ALTER\s+LOGIN\s+\S+\s+WITH\s+PASSWORD\b"]));
static ADMIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*ALTER\s+LOGIN\s+\S+\s+ADMIN\b"]));
static SHOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(&[r"^\s*SHOW\s+LOGINS\b"]));

static CREATE_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+LOGIN\s+(\S+)\s+WITH\s+PASSWORD\s*=?\s*'((?:[^']|'')*)'(\s+ADMIN)?\s*;?\s*$").unwrap()
});
static DROP_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*DROP\s+LOGIN\s+(\S+?)\s*;?\s*$").unwrap());
static PASSWORD_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*ALTER\s+LOGIN\s+(\S+)\s+WITH\s+PASSWORD\s*=?\s*'((?:[^']|'')*)'\s*;?\s*$").unwrap()
});
static ADMIN_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ALTER\s+LOGIN\s+(\S+)\s+ADMIN\s+(ON|OFF)\s*;?\s*$").unwrap());
static SHOW_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*SHOW\s+LOGINS\s*;?\s*$").unwrap());

static LOGIN_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.@-]{0,127}$").unwrap());

fn validate_login_name(name: &str) -> Result<()> {
    if LOGIN_NAME.is_match(name) {
        Ok(())
    } else {
        Err(TesseraError::InvalidCommand(format!("'{}' is not a valid login name", name)))
    }
}

fn login_not_found(name: &str) -> TesseraError {
    TesseraError::NotFound(format!("Login '{}'", name))
}

/// `CREATE LOGIN <name> WITH PASSWORD '<pw>' [ADMIN]`
pub struct CreateLogin {
    services: Arc<GatewayServices>,
}

impl CreateLogin {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for CreateLogin {
    fn name(&self) -> &'static str {
        "CreateLogin"
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
        let caps = parse(
            &CREATE_GRAMMAR,
            &command.text,
            "CREATE LOGIN <name> WITH PASSWORD '<password>' [ADMIN]",
        )?;
        let name = caps[1].to_string();
        validate_login_name(&name)?;
        let is_admin = caps.get(3).is_some();
        let password = unquote(&caps[2]);

        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        let created = name.clone();
        registry
            .catalog()
            .run(move |store| store.insert_login(&LoginRecord::new(created, &password, is_admin)))
            .await?;
        info!(login = %auth.login, created = %name, admin = is_admin, "CREATE LOGIN");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `DROP LOGIN <name>`; grants go with it
pub struct DropLogin {
    services: Arc<GatewayServices>,
}

impl DropLogin {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for DropLogin {
    fn name(&self) -> &'static str {
        "DropLogin"
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
        let caps = parse(&DROP_GRAMMAR, &command.text, "DROP LOGIN <name>")?;
        let name = &caps[1];

        if name.eq_ignore_ascii_case(&auth.login) {
            return Err(TesseraError::InvalidCommand(format!(
                "login '{}' cannot drop itself",
                auth.login
            )));
        }
        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        if !registry.catalog().delete_login(name).await? {
            return Err(login_not_found(name));
        }
        info!(login = %auth.login, dropped = %name, "DROP LOGIN");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `ALTER LOGIN <name> WITH PASSWORD '<pw>'`, allowed for admins and the login itself
pub struct AlterLoginPassword {
    services: Arc<GatewayServices>,
}

impl AlterLoginPassword {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for AlterLoginPassword {
    fn name(&self) -> &'static str {
        "AlterLoginPassword"
    }

    fn patterns(&self) -> &[Regex] {
        &PASSWORD_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.auth.authenticate(&descriptor).await?;
        let caps = parse(
            &PASSWORD_GRAMMAR,
            &command.text,
            "ALTER LOGIN <name> WITH PASSWORD '<password>'",
        )?;
        let name = &caps[1];
        if !name.eq_ignore_ascii_case(&auth.login) {
            require_admin(&auth)?;
        }

        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        let target = name.to_string();
        let password = unquote(&caps[2]);
        let updated = registry
            .catalog()
            .run(move |store| store.update_password(&target, &PasswordHash::new(&password)))
            .await?;
        if !updated {
            return Err(login_not_found(name));
        }
        info!(login = %auth.login, target = %name, "ALTER LOGIN password");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `ALTER LOGIN <name> ADMIN ON|OFF`
pub struct AlterLoginAdmin {
    services: Arc<GatewayServices>,
}

impl AlterLoginAdmin {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for AlterLoginAdmin {
    fn name(&self) -> &'static str {
        "AlterLoginAdmin"
    }

    fn patterns(&self) -> &[Regex] {
        &ADMIN_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        let auth = self.services.authenticate_admin(&descriptor).await?;
        let caps = parse(&ADMIN_GRAMMAR, &command.text, "ALTER LOGIN <name> ADMIN ON|OFF")?;
        let name = &caps[1];
        let is_admin = caps[2].eq_ignore_ascii_case("ON");

        if !is_admin && name.eq_ignore_ascii_case(&auth.login) {
            return Err(TesseraError::InvalidCommand(format!(
                "login '{}' cannot revoke its own admin role",
                auth.login
            )));
        }
        let registry = &self.services.registry;
        let _locks = registry.acquire_many(&[], LockMode::Write, cancel).await?;
        if !registry.catalog().set_admin(name, is_admin).await? {
            return Err(login_not_found(name));
        }
        info!(login = %auth.login, target = %name, admin = is_admin, "ALTER LOGIN admin");
        Ok(CommandResult::ack(self.name(), None))
    }
}

/// `SHOW LOGINS`
pub struct ShowLogins {
    services: Arc<GatewayServices>,
}

impl ShowLogins {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for ShowLogins {
    fn name(&self) -> &'static str {
        "ShowLogins"
    }

    fn patterns(&self) -> &[Regex] {
        &SHOW_PATTERNS
    }

    fn is_mutating(&self) -> bool {
        false
    }

    async fn execute(&self, command: &Command, _cancel: &CancellationToken) -> Result<CommandResult> {
        let descriptor = descriptor(command)?;
        self.services.authenticate_admin(&descriptor).await?;
        parse(&SHOW_GRAMMAR, &command.text, "SHOW LOGINS")?;

        let mut name = ColumnDef::new("name", ColumnType::Text);
        name.nullable = false;
        let mut is_admin = ColumnDef::new("is_admin", ColumnType::Boolean);
        is_admin.nullable = false;
        let mut created_at = ColumnDef::new("created_at", ColumnType::DateTime);
        created_at.nullable = false;

        let rows = self
            .services
            .registry
            .catalog()
            .list_logins()
            .await?
            .into_iter()
            .map(|login| {
                vec![
                    Value::Text(login.name),
                    Value::Integer(i64::from(login.is_admin)),
                    Value::Text(login.created_at.to_rfc3339()),
                ]
            })
            .collect();

        Ok(CommandResult::snapshot(
            self.name(),
            Rowset::new(vec![name, is_admin, created_at], rows),
            false,
        ))
    }
}
