//! Backing relational engine
//!
//! The gateway never interprets SQL; it hands statements to an [`Engine`] and
//! gets back either a change count or a forward-only [`RowReader`]. The
//! SQLite implementation keeps one file per database and runs each reader on a
//! dedicated thread that owns its connection, pulling rows one at a time.
//!
//! A rusqlite `Statement` and its `Rows` borrow the `Connection` and are not
//! `Send`, so an open reader cannot hop between tasks across awaits. The
//! thread holds all three for the reader's lifetime. Reader threads are
//! therefore bounded by the cursor limit plus the snapshot queries in flight.

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tessera_common::{ColumnDef, ColumnType, Result, Row, TesseraError, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Forward-only stream of rows from one executed query
#[async_trait]
pub trait RowReader: Send {
    /// Column definitions, known before the first row is read
    fn columns(&self) -> &[ColumnDef];

    /// Next row, or `None` once exhausted
    async fn read_row(&mut self) -> Result<Option<Row>>;

    /// Release the statement and its connection
    async fn close(&mut self);
}

/// Executes statements against a database identified by its file target
#[async_trait]
pub trait Engine: Send + Sync {
    /// Provision an empty database at `target`
    async fn create(&self, target: &Path) -> Result<()>;

    /// Run a statement that returns no rows; yields the number of rows changed
    async fn execute_non_query(&self, target: &Path, sql: &str) -> Result<u64>;

    /// Run a query and return a reader positioned before the first row
    async fn execute_reader(&self, target: &Path, sql: &str) -> Result<Box<dyn RowReader>>;
}

/// SQLite engine: `<data_dir>/<NAME>.db`, WAL journal
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    busy_timeout: Duration,
}

impl SqliteEngine {
    pub fn new(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }

    fn open(&self, target: &Path, create: bool) -> rusqlite::Result<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(target, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    async fn create(&self, target: &Path) -> Result<()> {
        let engine = self.clone();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let conn = engine.open(&target, true).map_err(TesseraError::execution)?;
            let mode: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .map_err(TesseraError::execution)?;
            debug!(path = %target.display(), journal_mode = %mode, "Database file provisioned");
            Ok::<_, TesseraError>(())
        })
        .await
        .map_err(TesseraError::internal)?
    }

    async fn execute_non_query(&self, target: &Path, sql: &str) -> Result<u64> {
        let conn = {
            let engine = self.clone();
            let path = target.to_path_buf();
            tokio::task::spawn_blocking(move || engine.open(&path, false))
                .await
                .map_err(TesseraError::internal)?
                .map_err(|e| open_error(target_name(target), e))?
        };

        // Interrupt the statement if this future is dropped (timeout, shutdown)
        let mut interrupt = InterruptOnDrop::new(conn.get_interrupt_handle());
        let sql = sql.to_string();
        let changed = tokio::task::spawn_blocking(move || conn.execute(&sql, []))
            .await
            .map_err(TesseraError::internal)?
            .map_err(TesseraError::execution)?;
        interrupt.disarm();
        Ok(changed as u64)
    }

    async fn execute_reader(&self, target: &Path, sql: &str) -> Result<Box<dyn RowReader>> {
        let conn = {
            let engine = self.clone();
            let path = target.to_path_buf();
            tokio::task::spawn_blocking(move || engine.open(&path, false))
                .await
                .map_err(TesseraError::internal)?
                .map_err(|e| open_error(target_name(target), e))?
        };
        let reader = SqliteRowReader::spawn(conn, sql.to_string()).await?;
        Ok(Box::new(reader))
    }
}

fn target_name(target: &Path) -> String {
    target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.display().to_string())
}

fn open_error(name: String, err: rusqlite::Error) -> TesseraError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::CannotOpen => {
            TesseraError::DatabaseNotFound(name)
        }
        _ => TesseraError::execution(err),
    }
}

struct InterruptOnDrop {
    handle: InterruptHandle,
    armed: bool,
}

impl InterruptOnDrop {
    fn new(handle: InterruptHandle) -> Self {
        Self { handle, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.interrupt();
        }
    }
}

type RowReply = oneshot::Sender<Result<Option<Row>>>;

/// Reader whose statement lives on its own thread.
///
/// Each `read_row` sends one request and receives one row, so nothing is
/// read from SQLite before the caller asks for it.
pub struct SqliteRowReader {
    columns: Vec<ColumnDef>,
    requests: Option<mpsc::Sender<RowReply>>,
    interrupt: InterruptHandle,
    thread: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl SqliteRowReader {
    async fn spawn(conn: Connection, sql: String) -> Result<Self> {
        let interrupt = conn.get_interrupt_handle();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (requests_tx, requests_rx) = mpsc::channel::<RowReply>();

        let thread = std::thread::Builder::new()
            .name("sqlite-reader".into())
            .spawn(move || reader_thread(conn, sql, ready_tx, requests_rx))
            .map_err(TesseraError::internal)?;

        let columns = match ready_rx.await {
            Ok(Ok(columns)) => columns,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TesseraError::internal("reader thread exited before describing columns")),
        };

        Ok(Self {
            columns,
            requests: Some(requests_tx),
            interrupt,
            thread: Some(thread),
            exhausted: false,
        })
    }
}

#[async_trait]
impl RowReader for SqliteRowReader {
    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    async fn read_row(&mut self) -> Result<Option<Row>> {
        if self.exhausted {
            return Ok(None);
        }
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| TesseraError::internal("reader is closed"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(reply_tx)
            .map_err(|_| TesseraError::internal("reader thread terminated"))?;
        let row = reply_rx
            .await
            .map_err(|_| TesseraError::internal("reader thread terminated"))??;
        if row.is_none() {
            self.exhausted = true;
        }
        Ok(row)
    }

    async fn close(&mut self) {
        self.exhausted = true;
        if self.requests.take().is_none() {
            return;
        }
        self.interrupt.interrupt();
        if let Some(thread) = self.thread.take() {
            if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
                warn!("Reader thread join failed");
            }
        }
    }
}

impl Drop for SqliteRowReader {
    fn drop(&mut self) {
        // Dropping the sender ends the thread's request loop
        if self.requests.take().is_some() {
            self.interrupt.interrupt();
        }
    }
}

fn reader_thread(
    conn: Connection,
    sql: String,
    ready: oneshot::Sender<Result<Vec<ColumnDef>>>,
    requests: mpsc::Receiver<RowReply>,
) {
    if let Err(e) = conn.pragma_update(None, "query_only", true) {
        let _ = ready.send(Err(TesseraError::execution(e)));
        return;
    }
    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = ready.send(Err(TesseraError::execution(e)));
            return;
        }
    };
    if !stmt.readonly() {
        let _ = ready.send(Err(TesseraError::Execution(
            "statement is not read-only; run it as a non-query".into(),
        )));
        return;
    }
    let columns = describe_columns(&conn, &stmt);
    let width = columns.len();
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = ready.send(Err(TesseraError::execution(e)));
            return;
        }
    };
    if ready.send(Ok(columns)).is_err() {
        return;
    }

    while let Ok(reply) = requests.recv() {
        let next = match rows.next() {
            Ok(Some(row)) => convert_row(row, width).map(Some).map_err(TesseraError::execution),
            Ok(None) => Ok(None),
            Err(e) => Err(TesseraError::execution(e)),
        };
        let done = !matches!(next, Ok(Some(_)));
        if reply.send(next).is_err() || done {
            break;
        }
    }
}

fn convert_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Row> {
    (0..width)
        .map(|i| {
            Ok(match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Integer(v),
                ValueRef::Real(v) => Value::Real(v),
                ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
            })
        })
        .collect()
}

fn describe_columns(conn: &Connection, stmt: &rusqlite::Statement<'_>) -> Vec<ColumnDef> {
    stmt.columns()
        .iter()
        .zip(stmt.columns_with_metadata())
        .map(|(column, meta)| {
            let (column_type, max_length) = map_decl_type(column.decl_type());
            let mut def = ColumnDef::new(column.name(), column_type);
            def.max_length = max_length;
            // Expressions have no origin column and stay nullable
            if let (Some(table), Some(origin)) = (meta.table_name(), meta.origin_name()) {
                let schema = meta.database_name().unwrap_or("main");
                def.nullable = column_nullable(conn, schema, table, origin).unwrap_or(true);
            }
            def
        })
        .collect()
}

fn column_nullable(conn: &Connection, schema: &str, table: &str, column: &str) -> rusqlite::Result<bool> {
    let not_null: bool = conn.query_row(
        r#"SELECT "notnull" FROM pragma_table_xinfo(?1, ?2) WHERE name = ?3"#,
        params![table, schema, column],
        |row| row.get(0),
    )?;
    Ok(!not_null)
}

/// Map a declared column type to a type tag, following SQLite's affinity rules
pub fn map_decl_type(decl: Option<&str>) -> (ColumnType, Option<u32>) {
    let Some(decl) = decl.map(str::trim).filter(|d| !d.is_empty()) else {
        return (ColumnType::Any, None);
    };
    let upper = decl.to_ascii_uppercase();
    let column_type = if upper.contains("BOOL") {
        ColumnType::Boolean
    } else if upper.contains("DATE") || upper.contains("TIME") {
        ColumnType::DateTime
    } else if upper.contains("INT") {
        ColumnType::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        ColumnType::Text
    } else if upper.contains("BLOB") {
        ColumnType::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        ColumnType::Real
    } else {
        ColumnType::Numeric
    };

    let max_length = match column_type {
        ColumnType::Text | ColumnType::Blob => declared_length(&upper),
        _ => None,
    };
    (column_type, max_length)
}

fn declared_length(decl: &str) -> Option<u32> {
    let open = decl.find('(')?;
    let close = decl[open..].find(')')? + open;
    decl[open + 1..close].split(',').next()?.trim().parse().ok()
}

/// File name for a database in the data directory
pub fn database_file_name(name: &str) -> String {
    format!("{}.db", name.to_ascii_uppercase())
}

/// Full path for a database in `data_dir`
pub fn database_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(database_file_name(name))
}
