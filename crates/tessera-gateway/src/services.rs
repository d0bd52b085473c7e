//! Process-wide services shared by every command handler

use crate::auth::{require_admin, AuthResult, AuthService};
use crate::catalog::{CatalogStore, SqliteCatalog};
use crate::config::GatewayConfig;
use crate::cursors::CursorEngine;
use crate::engine::{Engine, SqliteEngine};
use crate::registry::DatabaseRegistry;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::ConnectionDescriptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Registry, auth and cursor engine, owned by the process and injected into handlers
pub struct GatewayServices {
    pub registry: Arc<DatabaseRegistry>,
    pub auth: AuthService,
    pub cursors: Arc<CursorEngine>,
    /// Row cap for snapshot results
    pub max_snapshot_rows: usize,
}

impl GatewayServices {
    pub fn new(registry: Arc<DatabaseRegistry>, cursors: Arc<CursorEngine>, max_snapshot_rows: usize) -> Self {
        let auth = AuthService::new(registry.catalog().clone());
        Self {
            registry,
            auth,
            cursors,
            max_snapshot_rows,
        }
    }

    /// Open the catalog and data directory described by `config` and
    /// reconcile the two
    pub async fn bootstrap(config: &GatewayConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;
        if let Some(parent) = config.catalog_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create catalog directory {}", parent.display()))?;
        }

        let catalog: Arc<dyn CatalogStore> = Arc::new(
            SqliteCatalog::open(&config.catalog_path)
                .with_context(|| format!("failed to open catalog {}", config.catalog_path.display()))?,
        );
        let engine: Arc<dyn Engine> = Arc::new(SqliteEngine::new(Duration::from_millis(config.busy_timeout_ms)));

        let registry = Arc::new(DatabaseRegistry::new(
            catalog,
            Arc::clone(&engine),
            &config.data_dir,
            config.lock_timeout(),
        ));
        registry
            .reconcile(&CancellationToken::new())
            .await
            .context("failed to reconcile catalog with data directory")?;

        let cursors = Arc::new(CursorEngine::new(engine, config.cursor_config()));
        let databases = registry.list_databases().await.map(|d| d.len()).unwrap_or_default();
        info!(databases, data_dir = %config.data_dir.display(), "Gateway services ready");

        Ok(Arc::new(Self::new(registry, cursors, config.max_snapshot_rows)))
    }

    /// Authenticate and require the admin flag
    pub async fn authenticate_admin(&self, descriptor: &ConnectionDescriptor) -> tessera_common::Result<AuthResult> {
        let auth = self.auth.authenticate(descriptor).await?;
        require_admin(&auth)?;
        Ok(auth)
    }
}
