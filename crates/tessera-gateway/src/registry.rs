//! Database registry
//!
//! Maps database names to their backing files and to one [`AsyncRwLock`] per
//! name. Locks are created on first reference and kept for the life of the
//! process. The reserved name [`CATALOG_LOCK`] guards catalog-wide changes.
//!
//! # Lock ordering
//!
//! Operations spanning several names go through [`DatabaseRegistry::acquire_many`],
//! which takes the reserved lock first and the remaining names in sorted
//! order, then releases in reverse. With one global order no two operations
//! can wait on each other in a cycle.

use crate::catalog::{Catalog, CatalogStore, DatabaseRecord};
use crate::engine::{database_path, Engine};
use crate::lock::{AsyncRwLock, HeldLock, LockError};
use crate::metrics;
use crate::watcher::FileEvent;
use dashmap::DashMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tessera_common::{Result, TesseraError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lock name guarding catalog-wide operations
pub const CATALOG_LOCK: &str = "";

/// Extension of database files in the data directory
pub const DATABASE_EXTENSION: &str = "db";

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

/// Locks held by one operation, released in reverse acquisition order
#[must_use = "locks are released as soon as the set is dropped"]
pub struct LockSet {
    keys: Vec<String>,
    guards: Vec<HeldLock>,
}

impl LockSet {
    /// Names in acquisition order (the reserved name shows up as "")
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Normalize a database name to its lock/map key
pub fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// Distinct keys in acquisition order: reserved first, then sorted
pub fn lock_order(names: &[&str]) -> Vec<String> {
    let mut keys: Vec<String> = names
        .iter()
        .map(|n| normalize(n))
        .filter(|k| k != CATALOG_LOCK)
        .collect();
    keys.sort();
    keys.dedup();
    keys.insert(0, CATALOG_LOCK.to_string());
    keys
}

/// Reject names that cannot be used as a database file name
pub fn validate_name(name: &str) -> Result<()> {
    if DATABASE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(TesseraError::InvalidCommand(format!(
            "'{}' is not a valid database name",
            name
        )))
    }
}

/// Database name carried by a data-directory path, if it is a database file
pub fn database_name_from_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(DATABASE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    DATABASE_NAME.is_match(stem).then(|| stem.to_string())
}

fn same_file_name(a: &Path, b: &Path) -> bool {
    match (a.file_name(), b.file_name()) {
        (Some(a), Some(b)) => a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy()),
        _ => false,
    }
}

/// Owns the name → lock map and keeps the catalog in step with the data directory
pub struct DatabaseRegistry {
    locks: DashMap<String, AsyncRwLock>,
    catalog: Catalog,
    engine: Arc<dyn Engine>,
    data_dir: PathBuf,
    lock_timeout: Duration,
}

impl DatabaseRegistry {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        engine: Arc<dyn Engine>,
        data_dir: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            locks: DashMap::new(),
            catalog: Catalog::new(catalog),
            engine,
            data_dir: data_dir.into(),
            lock_timeout,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Lock for `name`, created on first reference
    pub fn lock_for(&self, name: &str) -> AsyncRwLock {
        let key = normalize(name);
        self.locks
            .entry(key.clone())
            .or_insert_with(|| AsyncRwLock::new(key))
            .clone()
    }

    /// Number of lock entries created so far
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Backing file for `name`
    pub async fn resolve_connection_target(&self, name: &str) -> Result<PathBuf> {
        self.catalog
            .get_database(name)
            .await?
            .map(|record| record.path)
            .ok_or_else(|| TesseraError::DatabaseNotFound(name.to_string()))
    }

    pub async fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        self.catalog.list_databases().await
    }

    async fn acquire_one(&self, key: &str, mode: LockMode, cancel: &CancellationToken) -> Result<HeldLock> {
        let lock = self.lock_for(key);
        let started = Instant::now();
        let acquire = async {
            match mode {
                LockMode::Read => lock.read(cancel).await.map(HeldLock::Read),
                LockMode::Write => lock.write(cancel).await.map(HeldLock::Write),
            }
        };

        match tokio::time::timeout(self.lock_timeout, acquire).await {
            Ok(Ok(held)) => {
                metrics::record_lock_wait(mode.as_str(), started.elapsed().as_secs_f64());
                Ok(held)
            }
            Ok(Err(LockError::Cancelled)) => {
                metrics::record_lock_abandoned("cancelled");
                Err(TesseraError::Cancelled)
            }
            Err(_) => {
                warn!(lock = %key, mode = mode.as_str(), "Lock acquisition timed out");
                metrics::record_lock_abandoned("timeout");
                Err(TesseraError::Timeout {
                    phase: "lock acquisition",
                    secs: self.lock_timeout.as_secs(),
                })
            }
        }
    }

    /// Shared lock on one database
    pub async fn read(&self, name: &str, cancel: &CancellationToken) -> Result<LockSet> {
        let key = normalize(name);
        let guard = self.acquire_one(&key, LockMode::Read, cancel).await?;
        Ok(LockSet {
            keys: vec![key],
            guards: vec![guard],
        })
    }

    /// Exclusive lock on one database
    pub async fn write(&self, name: &str, cancel: &CancellationToken) -> Result<LockSet> {
        let key = normalize(name);
        let guard = self.acquire_one(&key, LockMode::Write, cancel).await?;
        Ok(LockSet {
            keys: vec![key],
            guards: vec![guard],
        })
    }

    /// Reserved lock plus every named lock, in global order
    pub async fn acquire_many(&self, names: &[&str], mode: LockMode, cancel: &CancellationToken) -> Result<LockSet> {
        let keys = lock_order(names);
        let mut set = LockSet {
            keys: Vec::with_capacity(keys.len()),
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            // On failure, `set` drops here and releases what it holds in reverse
            let guard = self.acquire_one(&key, mode, cancel).await?;
            set.guards.push(guard);
            set.keys.push(key);
        }
        Ok(set)
    }

    /// Provision a new database file and its catalog row
    pub async fn create_database(&self, name: &str, cancel: &CancellationToken) -> Result<DatabaseRecord> {
        validate_name(name)?;
        let _locks = self.acquire_many(&[name], LockMode::Write, cancel).await?;

        if self.catalog.get_database(name).await?.is_some() {
            return Err(TesseraError::AlreadyExists(format!("Database '{}'", name)));
        }
        let path = database_path(&self.data_dir, name);
        if tokio::fs::try_exists(&path).await? {
            return Err(TesseraError::AlreadyExists(format!(
                "Database file '{}'",
                path.display()
            )));
        }

        self.engine.create(&path).await?;
        let record = DatabaseRecord::new(name, &path);
        if let Err(e) = self.catalog.insert_database(record.clone()).await {
            remove_database_files(&path).await;
            return Err(e);
        }
        info!(database = %name, path = %path.display(), "Database created");
        Ok(record)
    }

    /// Remove a database's files and catalog row
    pub async fn delete_database(&self, name: &str, cancel: &CancellationToken) -> Result<DatabaseRecord> {
        let _locks = self.acquire_many(&[name], LockMode::Write, cancel).await?;

        let record = self
            .catalog
            .get_database(name)
            .await?
            .ok_or_else(|| TesseraError::DatabaseNotFound(name.to_string()))?;
        self.catalog.delete_database(&record.name).await?;
        remove_database_files(&record.path).await;
        info!(database = %record.name, "Database dropped");
        Ok(record)
    }

    /// Rename a database's file and catalog row; grants follow
    pub async fn rename_database(&self, old: &str, new: &str, cancel: &CancellationToken) -> Result<DatabaseRecord> {
        validate_name(new)?;
        let _locks = self.acquire_many(&[old, new], LockMode::Write, cancel).await?;

        let record = self
            .catalog
            .get_database(old)
            .await?
            .ok_or_else(|| TesseraError::DatabaseNotFound(old.to_string()))?;
        let case_only = record.name.eq_ignore_ascii_case(new);
        if !case_only && self.catalog.get_database(new).await?.is_some() {
            return Err(TesseraError::AlreadyExists(format!("Database '{}'", new)));
        }

        let new_path = database_path(&self.data_dir, new);
        if record.path != new_path {
            if !case_only && tokio::fs::try_exists(&new_path).await? {
                return Err(TesseraError::AlreadyExists(format!(
                    "Database file '{}'",
                    new_path.display()
                )));
            }
            move_database_files(&record.path, &new_path).await?;
        }

        if let Err(e) = self.catalog.rename_database(&record.name, new, &new_path).await {
            if record.path != new_path {
                if let Err(undo) = move_database_files(&new_path, &record.path).await {
                    warn!(database = %record.name, "Failed to restore file after catalog error: {}", undo);
                }
            }
            return Err(e);
        }

        info!(from = %record.name, to = %new, "Database renamed");
        Ok(DatabaseRecord {
            name: new.to_string(),
            path: new_path,
            created_at: record.created_at,
        })
    }

    /// Bring the catalog in line with the files present in the data directory
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<()> {
        let _locks = self.acquire_many(&[], LockMode::Write, cancel).await?;

        let mut on_disk: BTreeMap<String, (String, PathBuf)> = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(name) = database_name_from_path(&path) {
                on_disk.insert(normalize(&name), (name, path));
            }
        }

        for record in self.catalog.list_databases().await? {
            match on_disk.remove(&normalize(&record.name)) {
                None => {
                    self.catalog.delete_database(&record.name).await?;
                    metrics::record_catalog_repair("removed");
                    info!(database = %record.name, "Removed catalog entry for missing file");
                }
                Some((_, path)) if path != record.path => {
                    self.catalog.rename_database(&record.name, &record.name, &path).await?;
                    metrics::record_catalog_repair("repointed");
                    info!(database = %record.name, path = %path.display(), "Repointed catalog entry");
                }
                Some(_) => {}
            }
        }

        for (name, path) in on_disk.into_values() {
            self.catalog.insert_database(DatabaseRecord::new(&name, &path)).await?;
            metrics::record_catalog_repair("added");
            info!(database = %name, path = %path.display(), "Registered database file found on disk");
        }
        Ok(())
    }

    /// Apply one change observed in the data directory
    pub async fn apply_file_event(&self, event: &FileEvent, cancel: &CancellationToken) -> Result<()> {
        let _locks = self.acquire_many(&[], LockMode::Write, cancel).await?;
        debug!(?event, "Applying data directory event");

        match event {
            FileEvent::Created(path) => self.register_file(path).await?,
            FileEvent::Removed(path) => self.forget_file(path).await?,
            FileEvent::Renamed { from, to } => match self.record_for_file(from).await? {
                Some(record) => match database_name_from_path(to) {
                    Some(new_name) => {
                        self.catalog.rename_database(&record.name, &new_name, to).await?;
                        metrics::record_catalog_repair("renamed");
                        info!(from = %record.name, to = %new_name, "Catalog follows renamed file");
                    }
                    None => self.forget_file(from).await?,
                },
                None => self.register_file(to).await?,
            },
        }
        Ok(())
    }

    async fn record_for_file(&self, path: &Path) -> Result<Option<DatabaseRecord>> {
        let Some(name) = database_name_from_path(path) else {
            return Ok(None);
        };
        Ok(self
            .catalog
            .get_database(&name)
            .await?
            .filter(|record| same_file_name(&record.path, path)))
    }

    async fn register_file(&self, path: &Path) -> Result<()> {
        let Some(name) = database_name_from_path(path) else {
            return Ok(());
        };
        if !tokio::fs::try_exists(path).await? || self.catalog.get_database(&name).await?.is_some() {
            return Ok(());
        }
        self.catalog.insert_database(DatabaseRecord::new(&name, path)).await?;
        metrics::record_catalog_repair("added");
        info!(database = %name, "Registered new database file");
        Ok(())
    }

    async fn forget_file(&self, path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if let Some(record) = self.record_for_file(path).await? {
            self.catalog.delete_database(&record.name).await?;
            metrics::record_catalog_repair("removed");
            info!(database = %record.name, "Removed catalog entry for deleted file");
        }
        Ok(())
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_database_files(path: &Path) {
    for file in [path.to_path_buf(), sidecar(path, "-wal"), sidecar(path, "-shm")] {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %file.display(), "Failed to remove database file: {}", e),
        }
    }
}

async fn move_database_files(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to).await?;
    for suffix in ["-wal", "-shm"] {
        let source = sidecar(from, suffix);
        if tokio::fs::try_exists(&source).await.unwrap_or(false) {
            tokio::fs::rename(&source, sidecar(to, suffix)).await?;
        }
    }
    Ok(())
}
