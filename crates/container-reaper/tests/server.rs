//! End-to-end tests of the reaper server against the in-memory runtime

use container_reaper::{Filter, ReaperConfig, ReaperServer};
use container_runtime::{ContainerRuntime, ContainerSpec, MemoryRuntime};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn config(reconnection_ms: u64) -> ReaperConfig {
    ReaperConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        connection_timeout: Duration::from_secs(5),
        reconnection_timeout: Duration::from_millis(reconnection_ms),
    }
}

fn session_spec(session: &str) -> ContainerSpec {
    ContainerSpec {
        image: "postgres:16".to_string(),
        labels: BTreeMap::from([
            ("ephemeral.session-id".to_string(), session.to_string()),
            ("ephemeral.reap".to_string(), "true".to_string()),
        ]),
        ..Default::default()
    }
}

fn session_filter(session: &str) -> Filter {
    Filter::new()
        .label("ephemeral.session-id", session)
        .label("ephemeral.reap", "true")
}

async fn register(addr: std::net::SocketAddr, filter: &Filter) -> BufReader<TcpStream> {
    let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
    stream
        .get_mut()
        .write_all(filter.encode().unwrap().as_bytes())
        .await
        .unwrap();
    let mut ack = String::new();
    stream.read_line(&mut ack).await.unwrap();
    assert_eq!(ack, "ACK\n");
    stream
}

#[tokio::test]
async fn test_sweeps_after_client_disconnects() {
    let runtime = MemoryRuntime::new().with_image("postgres:16");
    let doomed = runtime.create(&session_spec("s1")).await.unwrap();
    runtime.start(&doomed).await.unwrap();
    let stopped = runtime.create(&session_spec("s1")).await.unwrap();
    let bystander = runtime.create(&session_spec("s2")).await.unwrap();

    let server = ReaperServer::bind(config(100), Arc::new(runtime.clone()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());

    let client = register(addr, &session_filter("s1")).await;
    drop(client);

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(report.removed.len(), 2);
    assert!(report.is_clean());
    assert!(!runtime.contains(&doomed));
    assert!(!runtime.contains(&stopped));
    assert!(runtime.contains(&bystander));
}

#[tokio::test]
async fn test_reconnect_within_grace_postpones_sweep() {
    let runtime = MemoryRuntime::new().with_image("postgres:16");
    let id = runtime.create(&session_spec("s1")).await.unwrap();

    let server = ReaperServer::bind(config(300), Arc::new(runtime.clone()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());

    let first = register(addr, &session_filter("s1")).await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = register(addr, &session_filter("s1")).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!handle.is_finished());
    assert!(runtime.contains(&id));

    drop(second);
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.removed, vec![id]);
}

#[tokio::test]
async fn test_malformed_line_gets_no_ack() {
    let runtime = MemoryRuntime::new();
    let server = ReaperServer::bind(config(100), Arc::new(runtime))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let registrations = server.registrations();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"volume=data\n").await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(read, 0);
    assert!(registrations.is_empty());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_gives_up_without_clients() {
    let runtime = MemoryRuntime::new().with_image("postgres:16");
    let id = runtime.create(&session_spec("s1")).await.unwrap();

    let mut config = config(100);
    config.connection_timeout = Duration::from_millis(100);
    let server = ReaperServer::bind(config, Arc::new(runtime.clone()))
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .unwrap()
        .unwrap();

    assert!(report.removed.is_empty());
    assert!(runtime.contains(&id));
}

#[tokio::test]
async fn test_shutdown_sweeps_immediately() {
    let runtime = MemoryRuntime::new().with_image("postgres:16");
    let id = runtime.create(&session_spec("s1")).await.unwrap();

    let server = ReaperServer::bind(config(60_000), Arc::new(runtime.clone()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());

    let _client = register(addr, &session_filter("s1")).await;
    shutdown.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.removed, vec![id.clone()]);
    assert!(runtime.list(&Default::default()).await.unwrap().is_empty());
}
