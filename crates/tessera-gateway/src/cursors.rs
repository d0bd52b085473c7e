//! Server-side cursors
//!
//! A cursor keeps a forward-only engine reader open across client
//! round-trips. Each page starts with the row buffered by the previous page
//! and ends by trying to read exactly one more, so `has_more` is known
//! without ever reading (and dropping) a row the client will not see.
//!
//! Concurrent calls on one cursor are serialized by its gate. A fetch that is
//! interrupted part-way (timeout, shutdown) may have consumed rows it never
//! returned, so the next call on that cursor closes it instead of serving a
//! page with a gap.

use crate::engine::{Engine, RowReader};
use crate::metrics;
use crate::utils::preview;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_common::{ColumnDef, Result, Row, TesseraError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the cursor engine
#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Maximum number of open cursors
    pub max_cursors: usize,
    /// Close cursors not touched for this long
    pub idle_timeout: Duration,
    /// How often the sweeper looks for idle cursors
    pub sweep_interval: Duration,
    /// Page size when the client does not ask for one
    pub default_fetch_size: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            max_cursors: 1000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            default_fetch_size: 1000,
        }
    }
}

/// Mutable cursor state, only touched while holding the gate
struct CursorState {
    reader: Option<Box<dyn RowReader>>,
    /// Row read ahead of the last page
    lookahead: Option<Row>,
    /// Reader reported end of rows
    exhausted: bool,
    closed: bool,
    /// Set while a page is being assembled; still set afterwards means the
    /// page was abandoned midway
    in_flight: bool,
}

impl CursorState {
    async fn read(&mut self) -> Result<Option<Row>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let row = reader.read_row().await?;
        if row.is_none() {
            self.exhausted = true;
        }
        Ok(row)
    }

    /// Release the reader once nothing more can come out of it
    async fn release_reader(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close().await;
        }
    }

    async fn teardown(&mut self) {
        self.closed = true;
        self.lookahead = None;
        self.release_reader().await;
    }

    /// Serve up to `fetch_size` rows
    async fn next_page(&mut self, fetch_size: usize) -> Result<Page> {
        self.in_flight = true;

        if self.lookahead.is_none() {
            self.lookahead = self.read().await?;
        }
        let Some(first) = self.lookahead.take() else {
            self.release_reader().await;
            self.in_flight = false;
            return Ok(Page::default());
        };

        let mut rows = Vec::with_capacity(fetch_size.min(4096));
        rows.push(first);
        while rows.len() < fetch_size {
            match self.read().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }

        // A full page refills the lookahead; a short page means the reader ran dry
        let has_more = if rows.len() == fetch_size {
            self.lookahead = self.read().await?;
            self.lookahead.is_some()
        } else {
            false
        };

        if !has_more {
            self.release_reader().await;
        }
        self.in_flight = false;
        Ok(Page { rows, has_more })
    }
}

/// A claimed cursor slot, given back on drop unless the cursor was registered
struct SlotReservation<'a> {
    slots: &'a AtomicUsize,
    committed: bool,
}

impl<'a> SlotReservation<'a> {
    fn acquire(slots: &'a AtomicUsize, max: usize) -> Option<Self> {
        slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self { slots, committed: false })
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// One page of rows
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    pub has_more: bool,
}

/// A page together with the cursor's identity and schema
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage {
    pub cursor_id: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub has_more: bool,
}

/// Open cursor holding a live engine reader
pub struct ServerCursor {
    /// Unique cursor ID
    pub id: String,
    /// Database the cursor reads from
    pub database: String,
    /// Column definitions, captured once at open
    pub columns: Vec<ColumnDef>,
    /// Creation time
    pub created_at: Instant,
    gate: tokio::sync::Mutex<CursorState>,
    rows_served: AtomicU64,
    last_accessed: Mutex<Instant>,
}

impl ServerCursor {
    /// Update last accessed time
    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    /// Check if cursor has been idle longer than the given duration
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_accessed().elapsed() > timeout
    }

    pub fn rows_served(&self) -> u64 {
        self.rows_served.load(Ordering::Relaxed)
    }

    fn record_page(&self, page: &Page) {
        let n = page.rows.len() as u64;
        self.rows_served.fetch_add(n, Ordering::Relaxed);
        metrics::CURSOR_ROWS_TOTAL.inc_by(n);
    }
}

/// Statistics about open cursors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorStats {
    pub open_cursors: usize,
    pub total_rows_served: u64,
    pub oldest_cursor_secs: u64,
}

/// Registry of open cursors keyed by id
pub struct CursorEngine {
    cursors: DashMap<String, Arc<ServerCursor>>,
    /// Registered cursors plus opens in progress; never exceeds `max_cursors`
    slots: AtomicUsize,
    engine: Arc<dyn Engine>,
    config: CursorConfig,
    total_rows_served: AtomicU64,
}

impl CursorEngine {
    pub fn new(engine: Arc<dyn Engine>, config: CursorConfig) -> Self {
        Self {
            cursors: DashMap::new(),
            slots: AtomicUsize::new(0),
            engine,
            config,
            total_rows_served: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CursorConfig {
        &self.config
    }

    /// Requested page size, or the default; never below one
    pub fn effective_fetch_size(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.config.default_fetch_size).max(1)
    }

    /// Execute `sql` and serve its first page
    pub async fn open_cursor(
        &self,
        database: &str,
        target: &Path,
        sql: &str,
        fetch_size: usize,
    ) -> Result<CursorPage> {
        let max = self.config.max_cursors;
        let mut slot = SlotReservation::acquire(&self.slots, max).ok_or_else(|| {
            TesseraError::Execution(format!(
                "Maximum cursor limit ({}) reached. Close existing cursors first.",
                max
            ))
        })?;

        let fetch_size = fetch_size.max(1);
        let reader = self.engine.execute_reader(target, sql).await?;
        let columns = reader.columns().to_vec();
        let mut state = CursorState {
            reader: Some(reader),
            lookahead: None,
            exhausted: false,
            closed: false,
            in_flight: false,
        };

        let page = match state.next_page(fetch_size).await {
            Ok(page) => page,
            Err(e) => {
                state.teardown().await;
                return Err(e);
            }
        };

        let cursor = Arc::new(ServerCursor {
            id: uuid::Uuid::new_v4().to_string(),
            database: database.to_string(),
            columns: columns.clone(),
            created_at: Instant::now(),
            gate: tokio::sync::Mutex::new(state),
            rows_served: AtomicU64::new(0),
            last_accessed: Mutex::new(Instant::now()),
        });
        cursor.record_page(&page);
        self.total_rows_served.fetch_add(page.rows.len() as u64, Ordering::Relaxed);

        info!(
            cursor_id = %cursor.id,
            database = %database,
            sql = %preview(sql),
            rows = page.rows.len(),
            has_more = page.has_more,
            "Cursor opened"
        );
        self.cursors.insert(cursor.id.clone(), Arc::clone(&cursor));
        slot.commit();
        metrics::OPEN_CURSORS.inc();

        Ok(CursorPage {
            cursor_id: cursor.id.clone(),
            columns,
            rows: page.rows,
            has_more: page.has_more,
        })
    }

    /// Get a cursor by ID
    pub fn get_cursor(&self, cursor_id: &str) -> Option<Arc<ServerCursor>> {
        self.cursors.get(cursor_id).map(|c| Arc::clone(c.value()))
    }

    /// Database a cursor reads from, used to authorize FETCH/CLOSE
    pub fn cursor_database(&self, cursor_id: &str) -> Option<String> {
        self.cursors.get(cursor_id).map(|c| c.value().database.clone())
    }

    /// Serve the next page of `cursor_id`
    pub async fn fetch(&self, cursor_id: &str, fetch_size: usize, cancel: &CancellationToken) -> Result<CursorPage> {
        let cursor = self
            .get_cursor(cursor_id)
            .ok_or_else(|| TesseraError::CursorNotFound(cursor_id.to_string()))?;

        let mut state = tokio::select! {
            state = cursor.gate.lock() => state,
            _ = cancel.cancelled() => return Err(TesseraError::Cancelled),
        };
        if state.closed {
            return Err(TesseraError::CursorClosed(cursor_id.to_string()));
        }
        if state.in_flight {
            warn!(cursor_id = %cursor_id, "Closing cursor after an interrupted fetch");
            state.teardown().await;
            drop(state);
            self.forget(cursor_id);
            return Err(TesseraError::CursorClosed(cursor_id.to_string()));
        }

        cursor.touch();
        match state.next_page(fetch_size.max(1)).await {
            Ok(page) => {
                cursor.touch();
                cursor.record_page(&page);
                self.total_rows_served.fetch_add(page.rows.len() as u64, Ordering::Relaxed);
                debug!(
                    cursor_id = %cursor_id,
                    fetched = page.rows.len(),
                    has_more = page.has_more,
                    total_fetched = cursor.rows_served(),
                    "Cursor fetch completed"
                );
                Ok(CursorPage {
                    cursor_id: cursor.id.clone(),
                    columns: cursor.columns.clone(),
                    rows: page.rows,
                    has_more: page.has_more,
                })
            }
            Err(e) => {
                warn!(cursor_id = %cursor_id, "Cursor fetch failed, closing: {}", e);
                state.teardown().await;
                drop(state);
                self.forget(cursor_id);
                Err(e)
            }
        }
    }

    /// Close and remove a cursor. Returns `false` if no live cursor had this id.
    pub async fn close(&self, cursor_id: &str) -> bool {
        let Some(cursor) = self.forget(cursor_id) else {
            return false;
        };
        let mut state = cursor.gate.lock().await;
        let was_open = !state.closed;
        state.teardown().await;
        info!(
            cursor_id = %cursor_id,
            total_rows = cursor.rows_served(),
            lifetime_secs = cursor.created_at.elapsed().as_secs(),
            "Cursor closed"
        );
        was_open
    }

    fn forget(&self, cursor_id: &str) -> Option<Arc<ServerCursor>> {
        let (_, cursor) = self.cursors.remove(cursor_id)?;
        self.slots.fetch_sub(1, Ordering::AcqRel);
        metrics::OPEN_CURSORS.dec();
        Some(cursor)
    }

    /// Close all cursors
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.cursors.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        info!(count = closed, "All cursors closed");
        closed
    }

    /// Close every cursor reading from `database`
    pub async fn close_for_database(&self, database: &str) -> usize {
        let ids: Vec<String> = self
            .cursors
            .iter()
            .filter(|e| e.value().database.eq_ignore_ascii_case(database))
            .map(|e| e.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(database = %database, count = closed, "Closed cursors of database");
        }
        closed
    }

    /// Get number of open cursors
    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Close cursors idle past the configured timeout (called periodically)
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let idle_ids: Vec<String> = self
            .cursors
            .iter()
            .filter(|entry| entry.value().is_idle(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for id in idle_ids {
            if self.close(&id).await {
                warn!(cursor_id = %id, "Closed idle cursor");
                metrics::CURSORS_SWEPT_TOTAL.inc();
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept = swept, "Idle cursor sweep completed");
        }
        swept
    }

    /// Start the background idle sweeper
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = engine.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.sweep_idle().await;
                    }
                }
            }
            debug!("Cursor sweeper stopped");
        })
    }

    /// Get cursor statistics
    pub fn stats(&self) -> CursorStats {
        CursorStats {
            open_cursors: self.cursors.len(),
            total_rows_served: self.total_rows_served.load(Ordering::Relaxed),
            oldest_cursor_secs: self
                .cursors
                .iter()
                .map(|c| c.value().created_at.elapsed().as_secs())
                .max()
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tessera_common::{ColumnType, Value};

    /// In-memory reader that counts how often it is pulled
    struct VecReader {
        columns: Vec<ColumnDef>,
        rows: std::vec::IntoIter<Row>,
        reads: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RowReader for VecReader {
        fn columns(&self) -> &[ColumnDef] {
            &self.columns
        }

        async fn read_row(&mut self) -> Result<Option<Row>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_at == Some(n) {
                return Err(TesseraError::Execution("disk I/O error".into()));
            }
            Ok(self.rows.next())
        }

        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct VecEngine {
        rows: usize,
        reads: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Engine for VecEngine {
        async fn create(&self, _target: &Path) -> Result<()> {
            Ok(())
        }

        async fn execute_non_query(&self, _target: &Path, _sql: &str) -> Result<u64> {
            Ok(0)
        }

        async fn execute_reader(&self, _target: &Path, _sql: &str) -> Result<Box<dyn RowReader>> {
            let rows: Vec<Row> = (1..=self.rows as i64).map(|i| vec![Value::Integer(i)]).collect();
            Ok(Box::new(VecReader {
                columns: vec![ColumnDef::new("n", ColumnType::Integer)],
                rows: rows.into_iter(),
                reads: Arc::clone(&self.reads),
                fail_at: self.fail_at,
                delay: self.delay,
            }))
        }
    }

    fn cursors(rows: usize) -> (CursorEngine, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let engine = VecEngine {
            rows,
            reads: Arc::clone(&reads),
            ..Default::default()
        };
        (CursorEngine::new(Arc::new(engine), CursorConfig::default()), reads)
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter()
            .map(|r| match r[0] {
                Value::Integer(i) => i,
                _ => panic!("unexpected value"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_five_rows_in_pages_of_two() {
        let (engine, _) = cursors(5);
        let cancel = CancellationToken::new();

        let first = engine.open_cursor("TEST1", Path::new("t"), "SELECT n", 2).await.unwrap();
        let mut sizes = vec![first.rows.len()];
        let mut more = vec![first.has_more];
        let mut seen = ids(&first.rows);
        while *more.last().unwrap() {
            let page = engine.fetch(&first.cursor_id, 2, &cancel).await.unwrap();
            sizes.push(page.rows.len());
            more.push(page.has_more);
            seen.extend(ids(&page.rows));
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(more, vec![true, true, false]);
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_every_row_once_for_any_fetch_size() {
        for rows in [0usize, 1, 4, 7] {
            for fetch_size in 1..=8usize {
                let (engine, _) = cursors(rows);
                let cancel = CancellationToken::new();
                let first = engine.open_cursor("DB", Path::new("t"), "q", fetch_size).await.unwrap();
                let mut seen = ids(&first.rows);
                let mut has_more = first.has_more;
                while has_more {
                    let page = engine.fetch(&first.cursor_id, fetch_size, &cancel).await.unwrap();
                    assert!(!page.rows.is_empty());
                    seen.extend(ids(&page.rows));
                    has_more = page.has_more;
                }
                assert_eq!(seen, (1..=rows as i64).collect::<Vec<_>>(), "rows={rows} fetch={fetch_size}");
            }
        }
    }

    #[tokio::test]
    async fn test_reads_at_most_one_row_ahead() {
        let (engine, reads) = cursors(100);
        let first = engine.open_cursor("DB", Path::new("t"), "q", 10).await.unwrap();
        assert_eq!(first.rows.len(), 10);
        assert_eq!(reads.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_exact_multiple_reports_no_more() {
        let (engine, _) = cursors(4);
        let cancel = CancellationToken::new();
        let first = engine.open_cursor("DB", Path::new("t"), "q", 2).await.unwrap();
        assert!(first.has_more);
        let second = engine.fetch(&first.cursor_id, 2, &cancel).await.unwrap();
        assert_eq!(second.rows.len(), 2);
        assert!(!second.has_more);

        // Exhausted cursors keep answering with empty pages until closed
        let third = engine.fetch(&first.cursor_id, 2, &cancel).await.unwrap();
        assert!(third.rows.is_empty());
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (engine, _) = cursors(3);
        let cancel = CancellationToken::new();
        let first = engine.open_cursor("DB", Path::new("t"), "q", 1).await.unwrap();
        assert!(engine.close(&first.cursor_id).await);
        assert!(!engine.close(&first.cursor_id).await);
        assert!(matches!(
            engine.fetch(&first.cursor_id, 1, &cancel).await,
            Err(TesseraError::CursorNotFound(_))
        ));
        assert_eq!(engine.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_cursor_swept() {
        let reads = Arc::new(AtomicUsize::new(0));
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 10,
                reads,
                ..Default::default()
            }),
            CursorConfig {
                idle_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let first = engine.open_cursor("DB", Path::new("t"), "q", 1).await.unwrap();
        assert_eq!(engine.sweep_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.sweep_idle().await, 1);
        assert!(matches!(
            engine.fetch(&first.cursor_id, 1, &cancel).await,
            Err(TesseraError::CursorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_shutdown() {
        let engine = Arc::new(CursorEngine::new(
            Arc::new(VecEngine::default()),
            CursorConfig {
                sweep_interval: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        let shutdown = CancellationToken::new();
        let handle = engine.start_sweeper(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_failure_closes_cursor() {
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 10,
                fail_at: Some(4),
                ..Default::default()
            }),
            CursorConfig::default(),
        );
        let cancel = CancellationToken::new();
        let first = engine.open_cursor("DB", Path::new("t"), "q", 2).await.unwrap();
        let err = engine.fetch(&first.cursor_id, 2, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("disk I/O error"));
        assert_eq!(engine.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_nothing_behind() {
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 10,
                fail_at: Some(1),
                ..Default::default()
            }),
            CursorConfig::default(),
        );
        assert!(engine.open_cursor("DB", Path::new("t"), "q", 2).await.is_err());
        assert_eq!(engine.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_fetch_invalidates_cursor() {
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 10,
                delay: Some(Duration::from_millis(20)),
                ..Default::default()
            }),
            CursorConfig::default(),
        );
        let cancel = CancellationToken::new();
        let first = engine.open_cursor("DB", Path::new("t"), "q", 1).await.unwrap();

        let interrupted = tokio::time::timeout(Duration::from_millis(5), engine.fetch(&first.cursor_id, 3, &cancel)).await;
        assert!(interrupted.is_err());

        assert!(matches!(
            engine.fetch(&first.cursor_id, 1, &cancel).await,
            Err(TesseraError::CursorClosed(_))
        ));
        assert_eq!(engine.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_serialized() {
        let engine = Arc::new(CursorEngine::new(
            Arc::new(VecEngine {
                rows: 40,
                delay: Some(Duration::from_millis(1)),
                ..Default::default()
            }),
            CursorConfig::default(),
        ));
        let first = engine.open_cursor("DB", Path::new("t"), "q", 1).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let id = first.cursor_id.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut got = Vec::new();
                loop {
                    let page = engine.fetch(&id, 3, &cancel).await.unwrap();
                    if page.rows.is_empty() {
                        break;
                    }
                    got.extend(ids(&page.rows));
                }
                got
            }));
        }

        let mut seen = ids(&first.rows);
        for task in tasks {
            seen.extend(task.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_opens_respect_limit() {
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 5,
                delay: Some(Duration::from_millis(20)),
                ..Default::default()
            }),
            CursorConfig {
                max_cursors: 2,
                ..Default::default()
            },
        );

        let opens = (0..8).map(|_| engine.open_cursor("A", Path::new("a"), "q", 1));
        let results = futures::future::join_all(opens).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(engine.cursor_count(), 2);

        // Closing gives both slots back
        assert_eq!(engine.close_all().await, 2);
        engine.open_cursor("A", Path::new("a"), "q", 1).await.unwrap();
        engine.open_cursor("A", Path::new("a"), "q", 1).await.unwrap();
        assert!(engine.open_cursor("A", Path::new("a"), "q", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_open_logs_multibyte_text() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (engine, _) = cursors(3);
        let sql = format!("SELECT  '{}'", "é".repeat(60));
        assert!(!sql.is_char_boundary(100));

        let first = engine.open_cursor("TEST1", Path::new("t"), &sql, 2).await.unwrap();
        assert_eq!(ids(&first.rows), vec![1, 2]);
        assert!(first.has_more);
    }

    #[tokio::test]
    async fn test_cursor_limit_and_close_all() {
        let engine = CursorEngine::new(
            Arc::new(VecEngine {
                rows: 5,
                ..Default::default()
            }),
            CursorConfig {
                max_cursors: 2,
                ..Default::default()
            },
        );
        engine.open_cursor("A", Path::new("a"), "q", 1).await.unwrap();
        engine.open_cursor("B", Path::new("b"), "q", 1).await.unwrap();
        assert!(engine.open_cursor("B", Path::new("b"), "q", 1).await.is_err());

        assert_eq!(engine.close_for_database("a").await, 1);
        assert_eq!(engine.stats().open_cursors, 1);
        assert_eq!(engine.close_all().await, 1);
        assert_eq!(engine.stats().open_cursors, 0);
        assert_eq!(engine.stats().total_rows_served, 2);
    }
}
