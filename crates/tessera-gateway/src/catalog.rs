//! Catalog store: logins, databases and grants
//!
//! The catalog lives in a single SQLite file next to (not inside) the data
//! directory's `*.db` files so the directory watcher never mistakes it for a
//! tenant database. Names compare case-insensitively; the spelling used at
//! creation time is kept for display.

use crate::auth::PasswordHash;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{Result, TesseraError};
use tracing::{debug, info};

/// Login seeded on first open
pub const DEFAULT_ADMIN: &str = "admin";

const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS logins (
    name          TEXT PRIMARY KEY COLLATE NOCASE,
    password_hash TEXT NOT NULL,
    salt          TEXT NOT NULL,
    is_admin      INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS databases (
    name       TEXT PRIMARY KEY COLLATE NOCASE,
    path       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS grants (
    login    TEXT NOT NULL COLLATE NOCASE
             REFERENCES logins(name) ON DELETE CASCADE ON UPDATE CASCADE,
    database TEXT NOT NULL COLLATE NOCASE
             REFERENCES databases(name) ON DELETE CASCADE ON UPDATE CASCADE,
    PRIMARY KEY (login, database)
);
"#;

/// A login and its credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub name: String,
    pub password: PasswordHash,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl LoginRecord {
    pub fn new(name: impl Into<String>, password: &str, is_admin: bool) -> Self {
        Self {
            name: name.into(),
            password: PasswordHash::new(password),
            is_admin,
            created_at: Utc::now(),
        }
    }
}

/// A database name and its backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRecord {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl DatabaseRecord {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            created_at: Utc::now(),
        }
    }
}

/// CRUD over login, database and grant records.
///
/// Mutators that target a single record return `false` when it does not
/// exist; inserts fail with [`TesseraError::AlreadyExists`] on a name clash.
pub trait CatalogStore: Send + Sync {
    fn get_login(&self, name: &str) -> Result<Option<LoginRecord>>;
    fn list_logins(&self) -> Result<Vec<LoginRecord>>;
    fn insert_login(&self, login: &LoginRecord) -> Result<()>;
    fn delete_login(&self, name: &str) -> Result<bool>;
    fn update_password(&self, name: &str, password: &PasswordHash) -> Result<bool>;
    fn set_admin(&self, name: &str, is_admin: bool) -> Result<bool>;

    fn get_database(&self, name: &str) -> Result<Option<DatabaseRecord>>;
    fn list_databases(&self) -> Result<Vec<DatabaseRecord>>;
    fn insert_database(&self, database: &DatabaseRecord) -> Result<()>;
    fn delete_database(&self, name: &str) -> Result<bool>;
    /// Rename and repoint a database; grants follow the new name
    fn rename_database(&self, old: &str, new_name: &str, new_path: &Path) -> Result<bool>;

    /// Returns `false` when the grant already existed
    fn grant(&self, login: &str, database: &str) -> Result<bool>;
    fn revoke(&self, login: &str, database: &str) -> Result<bool>;
    /// Database names granted to `login`, sorted
    fn grants_for(&self, login: &str) -> Result<Vec<String>>;
    /// Every (login, database) pair, sorted
    fn list_grants(&self) -> Result<Vec<(String, String)>>;
}

/// Async handle over a [`CatalogStore`].
///
/// Store calls block on SQLite (and its busy timeout), so each one runs on
/// the blocking pool instead of an async worker.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn CatalogStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Run `f` against the store on the blocking pool
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn CatalogStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(TesseraError::internal)?
    }

    pub async fn get_login(&self, name: &str) -> Result<Option<LoginRecord>> {
        let name = name.to_string();
        self.run(move |store| store.get_login(&name)).await
    }

    pub async fn list_logins(&self) -> Result<Vec<LoginRecord>> {
        self.run(|store| store.list_logins()).await
    }

    pub async fn delete_login(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |store| store.delete_login(&name)).await
    }

    pub async fn set_admin(&self, name: &str, is_admin: bool) -> Result<bool> {
        let name = name.to_string();
        self.run(move |store| store.set_admin(&name, is_admin)).await
    }

    pub async fn get_database(&self, name: &str) -> Result<Option<DatabaseRecord>> {
        let name = name.to_string();
        self.run(move |store| store.get_database(&name)).await
    }

    pub async fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        self.run(|store| store.list_databases()).await
    }

    pub async fn insert_database(&self, database: DatabaseRecord) -> Result<()> {
        self.run(move |store| store.insert_database(&database)).await
    }

    pub async fn delete_database(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |store| store.delete_database(&name)).await
    }

    pub async fn rename_database(&self, old: &str, new_name: &str, new_path: &Path) -> Result<bool> {
        let (old, new_name, new_path) = (old.to_string(), new_name.to_string(), new_path.to_path_buf());
        self.run(move |store| store.rename_database(&old, &new_name, &new_path))
            .await
    }

    pub async fn grant(&self, login: &str, database: &str) -> Result<bool> {
        let (login, database) = (login.to_string(), database.to_string());
        self.run(move |store| store.grant(&login, &database)).await
    }

    pub async fn revoke(&self, login: &str, database: &str) -> Result<bool> {
        let (login, database) = (login.to_string(), database.to_string());
        self.run(move |store| store.revoke(&login, &database)).await
    }

    pub async fn grants_for(&self, login: &str) -> Result<Vec<String>> {
        let login = login.to_string();
        self.run(move |store| store.grants_for(&login)).await
    }

    pub async fn list_grants(&self) -> Result<Vec<(String, String)>> {
        self.run(|store| store.list_grants()).await
    }
}

/// [`CatalogStore`] backed by one SQLite file
pub struct SqliteCatalog {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (creating if needed) the catalog at `path` and seed the admin login
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(sql_error)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(sql_error)?;
        conn.pragma_update(None, "foreign_keys", true).map_err(sql_error)?;
        conn.execute_batch(SCHEMA).map_err(sql_error)?;

        let catalog = Self {
            path,
            conn: Mutex::new(conn),
        };
        catalog.seed_admin()?;
        info!(path = %catalog.path.display(), "Catalog opened");
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seed_admin(&self) -> Result<()> {
        if self.get_login(DEFAULT_ADMIN)?.is_some() {
            return Ok(());
        }
        self.insert_login(&LoginRecord::new(DEFAULT_ADMIN, "", true))?;
        info!(login = DEFAULT_ADMIN, "Seeded default admin login");
        Ok(())
    }
}

impl CatalogStore for SqliteCatalog {
    fn get_login(&self, name: &str) -> Result<Option<LoginRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, password_hash, salt, is_admin, created_at FROM logins WHERE name = ?1",
            params![name],
            login_from_row,
        )
        .optional()
        .map_err(sql_error)
    }

    fn list_logins(&self) -> Result<Vec<LoginRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, password_hash, salt, is_admin, created_at FROM logins ORDER BY name")
            .map_err(sql_error)?;
        let rows = stmt.query_map([], login_from_row).map_err(sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_error)
    }

    fn insert_login(&self, login: &LoginRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO logins (name, password_hash, salt, is_admin, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                login.name,
                login.password.hash_hex(),
                login.password.salt_hex(),
                login.is_admin,
                login.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| unique_violation(e, || format!("Login '{}'", login.name)))?;
        debug!(login = %login.name, admin = login.is_admin, "Login inserted");
        Ok(())
    }

    fn delete_login(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM logins WHERE name = ?1", params![name])
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn update_password(&self, name: &str, password: &PasswordHash) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE logins SET password_hash = ?2, salt = ?3 WHERE name = ?1",
                params![name, password.hash_hex(), password.salt_hex()],
            )
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn set_admin(&self, name: &str, is_admin: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE logins SET is_admin = ?2 WHERE name = ?1",
                params![name, is_admin],
            )
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn get_database(&self, name: &str) -> Result<Option<DatabaseRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, path, created_at FROM databases WHERE name = ?1",
            params![name],
            database_from_row,
        )
        .optional()
        .map_err(sql_error)
    }

    fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, path, created_at FROM databases ORDER BY name")
            .map_err(sql_error)?;
        let rows = stmt.query_map([], database_from_row).map_err(sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_error)
    }

    fn insert_database(&self, database: &DatabaseRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO databases (name, path, created_at) VALUES (?1, ?2, ?3)",
            params![
                database.name,
                database.path.to_string_lossy(),
                database.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| unique_violation(e, || format!("Database '{}'", database.name)))?;
        debug!(database = %database.name, path = %database.path.display(), "Database row inserted");
        Ok(())
    }

    fn delete_database(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM databases WHERE name = ?1", params![name])
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn rename_database(&self, old: &str, new_name: &str, new_path: &Path) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE databases SET name = ?2, path = ?3 WHERE name = ?1",
                params![old, new_name, new_path.to_string_lossy()],
            )
            .map_err(|e| unique_violation(e, || format!("Database '{}'", new_name)))?;
        Ok(n > 0)
    }

    fn grant(&self, login: &str, database: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO grants (login, database) VALUES (?1, ?2)",
                params![login, database],
            )
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn revoke(&self, login: &str, database: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "DELETE FROM grants WHERE login = ?1 AND database = ?2",
                params![login, database],
            )
            .map_err(sql_error)?;
        Ok(n > 0)
    }

    fn grants_for(&self, login: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT d.name FROM grants g JOIN databases d ON d.name = g.database \
                 WHERE g.login = ?1 ORDER BY d.name",
            )
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![login], |row| row.get::<_, String>(0))
            .map_err(sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_error)
    }

    fn list_grants(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT l.name, d.name FROM grants g \
                 JOIN logins l ON l.name = g.login \
                 JOIN databases d ON d.name = g.database \
                 ORDER BY l.name, d.name",
            )
            .map_err(sql_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_error)
    }
}

fn login_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoginRecord> {
    let hash: String = row.get(1)?;
    let salt: String = row.get(2)?;
    let password = PasswordHash::from_hex(&hash, &salt).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, "malformed password hash".into())
    })?;
    Ok(LoginRecord {
        name: row.get(0)?,
        password,
        is_admin: row.get(3)?,
        created_at: parse_timestamp(row, 4)?,
    })
}

fn database_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatabaseRecord> {
    let path: String = row.get(1)?;
    Ok(DatabaseRecord {
        name: row.get(0)?,
        path: PathBuf::from(path),
        created_at: parse_timestamp(row, 2)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn sql_error(err: rusqlite::Error) -> TesseraError {
    TesseraError::internal(format!("catalog: {}", err))
}

fn unique_violation(err: rusqlite::Error, what: impl FnOnce() -> String) -> TesseraError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            TesseraError::AlreadyExists(what())
        }
        _ => sql_error(err),
    }
}
