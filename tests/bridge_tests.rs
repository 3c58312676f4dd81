//! Protocol bridge tests
//!
//! Frame-level behavior of the bridge, driven over raw TCP sockets against a
//! running fixture.

mod test_utils;

use std::time::Duration;

use pgharness::protocol::message::backend;
use pgharness::protocol::Frame;
use pgharness::{no_app, FixtureConfig, FixtureSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use test_utils::wire::{
    connect_authenticated, query_frame, read_message, read_until_ready, simple_query,
    startup_frame, terminate_frame,
};
use test_utils::{eventually, init_tracing};

const SETTLE: Duration = Duration::from_secs(5);

async fn start() -> FixtureSession<()> {
    init_tracing();
    FixtureSession::start(FixtureConfig::default(), no_app)
        .await
        .expect("fixture start")
}

#[tokio::test]
async fn test_disconnect_before_auth_keeps_bridge_serving() {
    let fx = start().await;

    let mut stream = TcpStream::connect(fx.addr()).await.unwrap();
    stream
        .write_all(&startup_frame("postgres", "postgres"))
        .await
        .unwrap();
    let request = read_message(&mut stream).await;
    assert_eq!(request.auth_code(), Some(3));
    drop(stream);

    assert!(eventually(SETTLE, || fx.open_connections() == 1).await);

    let row = fx.client().query_one("SELECT 'still here'", &[]).await.unwrap();
    assert_eq!(row.get::<_, String>(0), "still here");

    let mut other = connect_authenticated(fx.addr()).await;
    let reply = simple_query(&mut other, "SELECT 2").await;
    assert_eq!(reply[1].data_row(), Some(vec![Some("2".to_string())]));

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_frames_before_password_are_dropped() {
    let fx = start().await;

    let mut stream = TcpStream::connect(fx.addr()).await.unwrap();
    stream
        .write_all(&startup_frame("postgres", "postgres"))
        .await
        .unwrap();
    assert_eq!(read_message(&mut stream).await.auth_code(), Some(3));

    stream
        .write_all(&query_frame(
            "CREATE TABLE sneaky (x INTEGER); INSERT INTO sneaky VALUES (1)",
        ))
        .await
        .unwrap();
    stream
        .write_all(&test_utils::wire::password_frame("whatever"))
        .await
        .unwrap();

    // The query got no reply; the first message is AuthenticationOk
    let welcome = read_until_ready(&mut stream).await;
    assert_eq!(welcome[0].auth_code(), Some(0));
    assert!(welcome.iter().any(|m| m.tag == backend::BACKEND_KEY_DATA));
    assert!(!welcome.iter().any(|m| m.tag == backend::COMMAND_COMPLETE));

    // Nothing reached the engine
    let row = fx
        .client()
        .query_one(
            "SELECT count(*) FROM sqlite_master WHERE name = $1",
            &[&"sneaky"],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 0);

    let reply = simple_query(&mut stream, "SELECT x FROM sneaky").await;
    assert_eq!(reply[0].sqlstate().as_deref(), Some("42P01"));

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_terminate_closes_connection() {
    let fx = start().await;

    let mut stream = connect_authenticated(fx.addr()).await;
    let mut other = connect_authenticated(fx.addr()).await;
    assert!(eventually(SETTLE, || fx.open_connections() == 3).await);

    let reply = simple_query(&mut stream, "CREATE TABLE kept (x INTEGER); INSERT INTO kept VALUES (1)").await;
    let tags: Vec<_> = reply.iter().filter_map(|m| m.command_tag()).collect();
    assert_eq!(tags, vec!["CREATE TABLE", "INSERT 0 1"]);

    stream.write_all(&terminate_frame()).await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "no reply to Terminate");
    assert!(eventually(SETTLE, || fx.open_connections() == 2).await);

    // Engine state is exactly what the connection left behind
    let rows = fx
        .client()
        .query("SELECT x FROM kept ORDER BY x", &[])
        .await
        .unwrap();
    let values: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();
    assert_eq!(values, vec![1]);

    // The other open connection keeps working
    let reply = simple_query(&mut other, "INSERT INTO kept VALUES (2)").await;
    assert_eq!(reply[0].command_tag().as_deref(), Some("INSERT 0 1"));
    let reply = simple_query(&mut other, "SELECT count(*) FROM kept").await;
    assert_eq!(reply[1].data_row(), Some(vec![Some("2".to_string())]));

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_pipelined_queries_answer_in_order() {
    let fx = start().await;
    let mut stream = connect_authenticated(fx.addr()).await;

    let mut batch = query_frame("SELECT 'first'");
    batch.extend(query_frame("SELECT 'second'"));
    batch.extend(query_frame("SELECT 'third'"));
    stream.write_all(&batch).await.unwrap();

    for expected in ["first", "second", "third"] {
        let reply = read_until_ready(&mut stream).await;
        let rows: Vec<_> = reply.iter().filter_map(|m| m.data_row()).collect();
        assert_eq!(rows, vec![vec![Some(expected.to_string())]]);
    }

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_reported_to_sender_only() {
    let fx = start().await;
    let mut bad = connect_authenticated(fx.addr()).await;
    let mut good = connect_authenticated(fx.addr()).await;

    // Query text without its terminating NUL
    bad.write_all(&Frame::new(b'Q', b"SELECT 1").into_bytes())
        .await
        .unwrap();
    let reply = read_until_ready(&mut bad).await;
    assert_eq!(reply[0].sqlstate().as_deref(), Some("08P01"));

    bad.write_all(&Frame::new(b'y', b"").into_bytes()).await.unwrap();
    let reply = read_until_ready(&mut bad).await;
    assert_eq!(reply[0].sqlstate().as_deref(), Some("0A000"));

    // Both connections keep working
    let reply = simple_query(&mut bad, "SELECT 'recovered'").await;
    assert_eq!(reply[1].data_row(), Some(vec![Some("recovered".to_string())]));
    let reply = simple_query(&mut good, "SELECT 'unaffected'").await;
    assert_eq!(reply[1].data_row(), Some(vec![Some("unaffected".to_string())]));

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_sql_error_does_not_close_connection() {
    let fx = start().await;
    let mut stream = connect_authenticated(fx.addr()).await;

    let reply = simple_query(&mut stream, "SELECT * FROM missing_table").await;
    assert_eq!(reply[0].sqlstate().as_deref(), Some("42P01"));
    assert_eq!(reply.last().map(|m| m.tag), Some(backend::READY_FOR_QUERY));

    let reply = simple_query(&mut stream, "CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1)").await;
    let tags: Vec<_> = reply.iter().filter_map(|m| m.command_tag()).collect();
    assert_eq!(tags, vec!["CREATE TABLE", "INSERT 0 1"]);

    fx.close().await.unwrap();
}

#[tokio::test]
async fn test_close_drops_open_connections() {
    let fx = start().await;
    let mut stream = connect_authenticated(fx.addr()).await;
    let addr = fx.addr();

    fx.close().await.unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(SETTLE, stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "connection not closed by teardown");
    assert!(TcpStream::connect(addr).await.is_err());
}
