//! Scenarios against a real Docker daemon
//!
//! Run with `cargo test -p ephemeral-containers --features docker-tests`.

#![cfg(feature = "docker-tests")]

use ephemeral_containers::wait::{all_of, for_http, for_listening_port, for_log};
use ephemeral_containers::{
    ContainerProvider, ContainerRequest, DockerProvider, Error, GenericContainerRequest,
    WaitStrategy, generic_container_on,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

fn nginx() -> ContainerRequest {
    ContainerRequest::new("nginx:alpine")
        .with_exposed_port("80/tcp")
        .wait_for(for_http("/").with_startup_timeout(Duration::from_secs(60)))
}

#[tokio::test]
async fn test_nginx_is_reachable_until_terminated() {
    let provider = DockerProvider::new().unwrap();
    let request = GenericContainerRequest::from(nginx()).started();
    let container = generic_container_on(&provider, request).await.unwrap();

    let host = container.host().await.unwrap();
    let port = container.mapped_port("80/tcp").await.unwrap();
    let body = reqwest::get(format!("http://{}:{}/", host, port))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("nginx"));

    let name = container.name().await.unwrap();
    container.terminate().await.unwrap();
    container.terminate().await.unwrap();

    assert!(!provider.container_exists(&name).await.unwrap());
    assert!(matches!(
        container.mapped_port("80/tcp").await,
        Err(Error::NotFound(_))
    ));
    assert!(TcpStream::connect((host.as_str(), port)).await.is_err());
}

#[tokio::test]
async fn test_parallel_containers_get_distinct_ports() {
    let provider = DockerProvider::new().unwrap();
    let (first, second) = tokio::join!(
        provider.run_container(nginx()),
        provider.run_container(nginx())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(
        first.mapped_port("80").await.unwrap(),
        second.mapped_port("80").await.unwrap()
    );

    first.terminate().await.unwrap();
    second.terminate().await.unwrap();
}

#[tokio::test]
async fn test_log_and_port_strategies_on_redis() {
    let provider = DockerProvider::new().unwrap();
    let strategies: Vec<Arc<dyn WaitStrategy>> = vec![
        Arc::new(for_log("Ready to accept connections")),
        Arc::new(for_listening_port("6379/tcp")),
    ];
    let redis = provider
        .run_container(
            ContainerRequest::new("redis:7-alpine")
                .with_exposed_port("6379/tcp")
                .wait_for(all_of(strategies)),
        )
        .await
        .unwrap();

    assert!(redis.is_running().await.unwrap());
    assert!(redis.is_guarded());
    redis.terminate().await.unwrap();
}
