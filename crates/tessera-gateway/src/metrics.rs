//! Prometheus Metrics for the Tessera Gateway
//!
//! Exports metrics for:
//! - Command dispatch (by command kind and outcome)
//! - Sessions and protocol-level failures
//! - Per-database lock waits
//! - Server-side cursors
//! - Catalog repairs driven by the directory watcher

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════
// COMMAND METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Commands dispatched by kind and status (ok, error)
pub static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tessera_commands_total",
        "Commands dispatched by kind and status",
        &["command", "status"]
    )
    .unwrap()
});

/// Command execution latency
pub static COMMAND_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tessera_command_duration_seconds",
        "Command execution latency in seconds",
        &["command"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .unwrap()
});

/// Engine failures by category
pub static ENGINE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tessera_engine_errors_total",
        "Backing engine failures by category",
        &["category"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// SESSION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Sessions currently holding an admission permit
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tessera_active_sessions", "Sessions currently being served").unwrap()
});

/// Sessions accepted since start
pub static SESSIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tessera_sessions_total", "Sessions accepted since start").unwrap()
});

/// Protocol failures (read timeout, oversize request, bad document, ...)
pub static PROTOCOL_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tessera_protocol_errors_total",
        "Session-level protocol failures by kind",
        &["kind"]
    )
    .unwrap()
});

/// Responses replaced by an error because they exceeded the size limit
pub static OVERSIZE_RESPONSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tessera_oversize_responses_total",
        "Responses degraded to an error for exceeding the size limit"
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// LOCK METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Time spent waiting for a database lock
pub static LOCK_WAIT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tessera_lock_wait_seconds",
        "Time spent waiting for database locks",
        &["mode"],
        vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .unwrap()
});

/// Lock acquisitions abandoned (timeout or cancellation)
pub static LOCK_ABANDONED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tessera_lock_abandoned_total",
        "Lock acquisitions abandoned by reason",
        &["reason"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// CURSOR METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Cursors currently open
pub static OPEN_CURSORS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tessera_open_cursors", "Server-side cursors currently open").unwrap()
});

/// Rows handed out through cursor pages
pub static CURSOR_ROWS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tessera_cursor_rows_total", "Rows served through cursor pages").unwrap()
});

/// Cursors closed by the idle sweeper
pub static CURSORS_SWEPT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tessera_cursors_swept_total", "Cursors closed for being idle").unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// CATALOG METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Catalog rows added, removed or renamed to match the data directory
pub static CATALOG_REPAIRS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tessera_catalog_repairs_total",
        "Catalog repairs applied from the data directory",
        &["action"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    let _ = &*COMMANDS_TOTAL;
    let _ = &*COMMAND_DURATION_SECONDS;
    let _ = &*ENGINE_ERRORS_TOTAL;
    let _ = &*ACTIVE_SESSIONS;
    let _ = &*SESSIONS_TOTAL;
    let _ = &*PROTOCOL_ERRORS_TOTAL;
    let _ = &*OVERSIZE_RESPONSES_TOTAL;
    let _ = &*LOCK_WAIT_SECONDS;
    let _ = &*LOCK_ABANDONED_TOTAL;
    let _ = &*OPEN_CURSORS;
    let _ = &*CURSOR_ROWS_TOTAL;
    let _ = &*CURSORS_SWEPT_TOTAL;
    let _ = &*CATALOG_REPAIRS_TOTAL;
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record one dispatched command
pub fn record_command(command: &str, ok: bool, duration_secs: f64) {
    let status = if ok { "ok" } else { "error" };
    COMMANDS_TOTAL.with_label_values(&[command, status]).inc();
    COMMAND_DURATION_SECONDS
        .with_label_values(&[command])
        .observe(duration_secs);
}

pub fn record_engine_error(category: &str) {
    ENGINE_ERRORS_TOTAL.with_label_values(&[category]).inc();
}

pub fn record_protocol_error(kind: &str) {
    PROTOCOL_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record how long a lock acquisition waited
pub fn record_lock_wait(mode: &str, wait_secs: f64) {
    LOCK_WAIT_SECONDS.with_label_values(&[mode]).observe(wait_secs);
}

pub fn record_lock_abandoned(reason: &str) {
    LOCK_ABANDONED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_catalog_repair(action: &str) {
    CATALOG_REPAIRS_TOTAL.with_label_values(&[action]).inc();
}
