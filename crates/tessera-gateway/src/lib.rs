//! Tessera Gateway
//!
//! Multi-tenant gateway exposing file-backed SQL databases over a framed
//! TCP protocol:
//! - one request and one response per connection, deadline-bounded
//! - login authentication and per-database grants
//! - per-database reader/writer locks with writer priority
//! - server-side cursors that page large results across round-trips
//! - Prometheus metrics and health checks over HTTP

pub mod auth;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod cursors;
pub mod engine;
pub mod errors;
pub mod http_api;
pub mod lock;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod utils;
pub mod watcher;

pub use auth::{AuthResult, AuthService};
pub use catalog::{CatalogStore, SqliteCatalog};
pub use commands::{CommandHandler, CommandRegistry};
pub use config::GatewayConfig;
pub use cursors::{CursorConfig, CursorEngine};
pub use engine::{Engine, RowReader, SqliteEngine};
pub use lock::AsyncRwLock;
pub use registry::DatabaseRegistry;
pub use server::GatewayServer;
pub use services::GatewayServices;
