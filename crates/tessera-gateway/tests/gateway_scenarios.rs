//! End-to-end scenarios against a live listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tessera_common::{
    CommandResult, ConnectionDescriptor, ExecutionOptions, FrameCodec, GatewayClient, ProtocolSettings, ResultKind,
    Value,
};
use tessera_gateway::{CommandRegistry, GatewayConfig, GatewayServer, GatewayServices};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Gateway {
    _dir: TempDir,
    addr: SocketAddr,
    shutdown: CancellationToken,
    services: Arc<GatewayServices>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Gateway {
    async fn start() -> Self {
        Self::start_with(GatewayConfig::default()).await
    }

    async fn start_with(config: GatewayConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = GatewayConfig {
            listen_addr: "127.0.0.1".into(),
            port: 0,
            data_dir: dir.path().join("data"),
            catalog_path: dir.path().join("catalog.sqlite"),
            watch_data_dir: false,
            ..config
        };
        let services = GatewayServices::bootstrap(&config).await.unwrap();
        let commands = Arc::new(CommandRegistry::standard(Arc::clone(&services)));
        let server = GatewayServer::bind(config, commands, Arc::clone(&services.cursors))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.run());
        Self {
            _dir: dir,
            addr,
            shutdown,
            services,
            handle,
        }
    }

    fn admin(&self, database: &str) -> GatewayClient {
        let descriptor = ConnectionDescriptor::new(database, "127.0.0.1", self.addr.port());
        GatewayClient::new(descriptor, ProtocolSettings::default()).with_timeout(Duration::from_secs(10))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn assert_ok(result: &CommandResult) {
    assert!(!result.is_error(), "{}: {:?}", result.command_name, result.error_message);
}

fn text_cells(result: &CommandResult) -> Vec<String> {
    result
        .rowset
        .as_ref()
        .unwrap()
        .rows
        .iter()
        .map(|row| match &row[0] {
            Value::Text(s) => s.clone(),
            other => panic!("unexpected {other:?}"),
        })
        .collect()
}

async fn seed_numbers(gateway: &Gateway, database: &str, count: usize) -> GatewayClient {
    let admin = gateway.admin("master");
    assert_ok(&admin.execute(&format!("CREATE DATABASE {database}")).await.unwrap());
    let db = gateway.admin(database);
    assert_ok(&db.execute("CREATE TABLE numbers (n INTEGER NOT NULL)").await.unwrap());
    let values: Vec<String> = (1..=count).map(|n| format!("({n})")).collect();
    let insert = db
        .execute(&format!("INSERT INTO numbers (n) VALUES {}", values.join(",")))
        .await
        .unwrap();
    assert_eq!(insert.rows_affected, Some(count as u64));
    db
}

#[tokio::test]
async fn test_create_database_twice() {
    let gateway = Gateway::start().await;
    let admin = gateway.admin("master");

    assert_ok(&admin.execute("CREATE DATABASE TEST1").await.unwrap());
    let second = admin.execute("CREATE DATABASE TEST1").await.unwrap();
    assert_eq!(second.kind, ResultKind::Error);
    assert!(second.error_message.as_deref().unwrap().contains("already exists"));

    let listing = admin.execute("SHOW DATABASES").await.unwrap();
    assert_eq!(text_cells(&listing), vec!["TEST1".to_string()]);
    gateway.stop().await;
}

#[tokio::test]
async fn test_ungranted_login_is_denied_for_any_command() {
    let gateway = Gateway::start().await;
    let admin = gateway.admin("master");
    assert_ok(&admin.execute("CREATE DATABASE TEST1").await.unwrap());
    assert_ok(&admin.execute("CREATE LOGIN reader WITH PASSWORD 'pw'").await.unwrap());

    let outsider = gateway.admin("TEST1").as_login("reader", "pw");
    for text in [
        "SELECT 1",
        "SELECT nonsense FROM WHERE",
        "INSERT INTO t VALUES (1)",
        "FETCH 10 FROM 00000000-0000-0000-0000-000000000000",
        "CLOSE CURSOR whatever",
    ] {
        let result = outsider.execute(text).await.unwrap();
        let message = result.error_message.unwrap_or_default();
        assert!(message.contains("TEST1"), "{text}: {message}");
        assert!(message.contains("not authorized"), "{text}: {message}");
    }
    gateway.stop().await;
}

#[tokio::test]
async fn test_cursor_pages_across_connections() {
    let gateway = Gateway::start().await;
    let db = seed_numbers(&gateway, "PAGED", 5).await;

    let opened = db
        .execute_with("SELECT n FROM numbers ORDER BY n", ExecutionOptions::cursor(2))
        .await
        .unwrap();
    assert_eq!(opened.kind, ResultKind::CursorOpened);
    let cursor_id = opened.cursor_id.clone().unwrap();

    let mut sizes = vec![opened.rowset.as_ref().unwrap().len()];
    let mut flags = vec![opened.has_more.unwrap()];
    let mut seen: Vec<Value> = opened.rowset.unwrap().rows.into_iter().map(|r| r[0].clone()).collect();

    while *flags.last().unwrap() {
        let page = db
            .execute_with(&format!("FETCH FROM {cursor_id}"), ExecutionOptions::cursor(2))
            .await
            .unwrap();
        assert_eq!(page.kind, ResultKind::CursorPage);
        assert_eq!(page.cursor_id.as_deref(), Some(cursor_id.as_str()));
        let rowset = page.rowset.unwrap();
        sizes.push(rowset.len());
        flags.push(page.has_more.unwrap());
        seen.extend(rowset.rows.into_iter().map(|r| r[0].clone()));
    }

    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(flags, vec![true, true, false]);
    assert_eq!(seen, (1..=5).map(Value::Integer).collect::<Vec<_>>());

    assert_ok(&db.execute(&format!("CLOSE CURSOR {cursor_id}")).await.unwrap());
    let again = db.execute(&format!("CLOSE CURSOR {cursor_id}")).await.unwrap();
    assert!(again.error_message.unwrap().contains("not found"));
    let fetch = db.execute(&format!("FETCH FROM {cursor_id}")).await.unwrap();
    assert!(fetch.is_error());
    gateway.stop().await;
}

#[tokio::test]
async fn test_every_row_once_for_any_fetch_size() {
    let gateway = Gateway::start().await;
    let db = seed_numbers(&gateway, "GRID", 23).await;

    for fetch_size in [1, 4, 23, 50] {
        let mut result = db
            .execute_with("SELECT n FROM numbers ORDER BY n", ExecutionOptions::cursor(fetch_size))
            .await
            .unwrap();
        let cursor_id = result.cursor_id.clone().unwrap();
        let mut seen = Vec::new();
        loop {
            seen.extend(result.rowset.take().unwrap().rows.into_iter().map(|r| r[0].clone()));
            if !result.has_more.unwrap() {
                break;
            }
            result = db
                .execute(&format!("FETCH {fetch_size} FROM {cursor_id}"))
                .await
                .unwrap();
        }
        assert_eq!(seen, (1..=23).map(Value::Integer).collect::<Vec<_>>(), "fetch size {fetch_size}");
        db.execute(&format!("CLOSE CURSOR {cursor_id}")).await.unwrap();
    }
    assert_eq!(gateway.services.cursors.cursor_count(), 0);
    gateway.stop().await;
}

#[tokio::test]
async fn test_snapshot_truncation() {
    let gateway = Gateway::start().await;
    let db = seed_numbers(&gateway, "SNAP", 10).await;

    let options = ExecutionOptions {
        max_rows: Some(3),
        ..Default::default()
    };
    let result = db.execute_with("SELECT n FROM numbers", options).await.unwrap();
    assert_eq!(result.kind, ResultKind::Snapshot);
    assert_eq!(result.rowset.unwrap().len(), 3);
    assert_eq!(result.has_more, Some(true));

    let whole = db.execute("SELECT n FROM numbers").await.unwrap();
    assert_eq!(whole.rowset.unwrap().len(), 10);
    assert_eq!(whole.has_more, Some(false));
    gateway.stop().await;
}

#[tokio::test]
async fn test_oversized_request_gets_error_result() {
    let gateway = Gateway::start_with(GatewayConfig {
        max_message_size: 1024,
        ..Default::default()
    })
    .await;
    let codec = FrameCodec::new(ProtocolSettings {
        max_message_size: 1024,
        compression: false,
    });

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();
    let response = codec.read_frame(&mut stream).await.unwrap();
    let result: CommandResult = codec.decode(&response).unwrap();
    assert_eq!(result.kind, ResultKind::Error);
    assert!(result.error_message.unwrap().contains("exceeds maximum"));

    // The listener keeps serving
    assert_ok(&gateway.admin("master").execute("SHOW DATABASES").await.unwrap());
    gateway.stop().await;
}

#[tokio::test]
async fn test_unknown_command_lists_patterns() {
    let gateway = Gateway::start().await;
    let result = gateway.admin("master").execute("TELL ME A STORY").await.unwrap();
    assert_eq!(result.kind, ResultKind::Error);
    let message = result.error_message.unwrap();
    assert!(message.contains("CREATE\\s+DATABASE"), "{message}");
    assert!(message.contains("SELECT"), "{message}");
    gateway.stop().await;
}

#[tokio::test]
async fn test_execution_deadline() {
    let gateway = Gateway::start_with(GatewayConfig {
        exec_timeout_secs: 1,
        ..Default::default()
    })
    .await;
    let admin = gateway.admin("master");
    assert_ok(&admin.execute("CREATE DATABASE SLOW").await.unwrap());

    let result = gateway
        .admin("SLOW")
        .execute("WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT count(*) FROM n")
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Error);
    assert!(result.error_message.unwrap().contains("execution"));

    // The write lock is free again once the query was abandoned
    assert_ok(&gateway.admin("SLOW").execute("CREATE TABLE t (x INTEGER)").await.unwrap());
    gateway.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_cursors() {
    let gateway = Gateway::start().await;
    let db = seed_numbers(&gateway, "OPEN", 4).await;
    db.execute_with("SELECT n FROM numbers", ExecutionOptions::cursor(1))
        .await
        .unwrap();
    assert_eq!(gateway.services.cursors.cursor_count(), 1);

    let services = Arc::clone(&gateway.services);
    gateway.stop().await;
    assert_eq!(services.cursors.cursor_count(), 0);
}
