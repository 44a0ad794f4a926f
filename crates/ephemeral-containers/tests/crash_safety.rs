//! Session cleanup through an in-process reaper and the in-memory runtime

use container_reaper::{ReaperConfig, ReaperServer, Registrations, SweepReport};
use container_runtime::MemoryRuntime;
use ephemeral_containers::session::{LABEL_MANAGED, LABEL_REAP, LABEL_SESSION_ID};
use ephemeral_containers::wait::for_log;
use ephemeral_containers::{
    ContainerProvider, ContainerRequest, DockerProvider, Error, ProviderConfig, SessionId,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Fixture {
    runtime: MemoryRuntime,
    registrations: Registrations,
    reaper: JoinHandle<container_reaper::Result<SweepReport>>,
    shutdown: CancellationToken,
    config: ProviderConfig,
}

async fn fixture() -> Fixture {
    let runtime = MemoryRuntime::new()
        .with_image("postgres:16")
        .with_image("redis:7");

    let server = ReaperServer::bind(
        ReaperConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            connection_timeout: Duration::from_secs(10),
            reconnection_timeout: Duration::from_millis(100),
        },
        Arc::new(runtime.clone()),
    )
    .await
    .unwrap();

    let config = ProviderConfig {
        host_override: Some("127.0.0.1".to_string()),
        reaper_addr: Some(server.local_addr().unwrap().to_string()),
        ..Default::default()
    };
    let registrations = server.registrations();
    let shutdown = server.shutdown_token();
    let reaper = tokio::spawn(server.run());

    Fixture {
        runtime,
        registrations,
        reaper,
        shutdown,
        config,
    }
}

impl Fixture {
    fn provider(&self) -> DockerProvider {
        DockerProvider::with_runtime(Arc::new(self.runtime.clone()), self.config.clone())
            .with_session(SessionId::new())
    }

    async fn sweep_report(self) -> (MemoryRuntime, SweepReport) {
        let report = tokio::time::timeout(Duration::from_secs(5), self.reaper)
            .await
            .expect("reaper did not sweep")
            .unwrap()
            .unwrap();
        (self.runtime, report)
    }
}

#[tokio::test]
async fn test_guarded_containers_are_swept_when_the_session_disappears() {
    let fixture = fixture().await;
    let provider = fixture.provider();
    let session = provider.session_id();

    let db = provider
        .run_container(ContainerRequest::new("postgres:16").with_exposed_port("5432/tcp"))
        .await
        .unwrap();
    let cache = provider
        .create_container(ContainerRequest::new("redis:7").with_label("team", "storage"))
        .await
        .unwrap();
    let kept = provider
        .create_container(ContainerRequest::new("redis:7").skip_reaper())
        .await
        .unwrap();

    for container in [&db, &cache] {
        assert!(container.is_guarded());
        let labels = fixture.runtime.labels(container.id()).unwrap();
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_SESSION_ID], session.to_string());
        assert_eq!(labels[LABEL_REAP], "true");
    }
    assert_eq!(
        fixture.runtime.labels(cache.id()).unwrap()["team"],
        "storage"
    );
    assert!(!fixture.runtime.labels(kept.id()).unwrap().contains_key(LABEL_REAP));

    let (db_id, cache_id, kept_id) = (
        db.id().to_string(),
        cache.id().to_string(),
        kept.id().to_string(),
    );
    // everything holding the reaper connection goes away without cleanup
    drop((db, cache, kept, provider));

    let (runtime, report) = fixture.sweep_report().await;
    assert!(report.is_clean());
    assert_eq!(report.removed.len(), 2);
    assert!(!runtime.contains(&db_id));
    assert!(!runtime.contains(&cache_id));
    assert!(runtime.contains(&kept_id));
}

#[tokio::test]
async fn test_registration_is_acknowledged_before_create() {
    let fixture = fixture().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let registrations = fixture.registrations.clone();
    let observed = seen.clone();
    fixture.runtime.on_create(move |_spec| {
        observed.lock().unwrap().push(registrations.len());
    });

    let provider = fixture.provider();
    provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap();
    provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 1]);
}

#[tokio::test]
async fn test_crash_during_startup_is_swept() {
    let fixture = fixture().await;
    let provider = fixture.provider();

    // the test process "dies" while waiting for a container that never becomes ready
    let startup = provider.run_container(
        ContainerRequest::new("postgres:16").wait_for(for_log("never logged")),
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(300), startup)
            .await
            .is_err()
    );
    let orphans = fixture.runtime.container_ids();
    assert_eq!(orphans.len(), 1);
    drop(provider);

    let (runtime, report) = fixture.sweep_report().await;
    assert_eq!(report.removed, orphans);
    assert!(runtime.container_ids().is_empty());
}

#[tokio::test]
async fn test_released_container_is_swept() {
    let fixture = fixture().await;
    let provider = fixture.provider();

    let container = provider
        .create_container(ContainerRequest::new("redis:7").skip_reaper())
        .await
        .unwrap();
    container.release_to_reaper().await.unwrap();
    let id = container.id().to_string();
    drop((container, provider));

    let (runtime, report) = fixture.sweep_report().await;
    assert_eq!(report.removed, vec![id.clone()]);
    assert!(!runtime.contains(&id));
}

#[tokio::test]
async fn test_unreachable_reaper_fails_closed() {
    let runtime = MemoryRuntime::new().with_image("redis:7");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let provider = DockerProvider::with_runtime(
        Arc::new(runtime.clone()),
        ProviderConfig {
            host_override: Some("127.0.0.1".to_string()),
            reaper_addr: Some(addr),
            reaper_ack_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
    .with_session(SessionId::new());

    let err = provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RegistrationFailed { .. }));
    assert!(runtime.container_ids().is_empty());

    // opting out still works without a reaper
    provider
        .create_container(ContainerRequest::new("redis:7").skip_reaper())
        .await
        .unwrap();
    assert_eq!(runtime.container_ids().len(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_share_one_registration() {
    let fixture = fixture().await;
    let provider = fixture.provider();

    let creates = (0..5).map(|_| {
        let provider = provider.clone();
        tokio::spawn(async move {
            provider
                .create_container(ContainerRequest::new("redis:7"))
                .await
        })
    });
    for create in creates.collect::<Vec<_>>() {
        create.await.unwrap().unwrap();
    }

    assert_eq!(fixture.registrations.len(), 1);
    drop(provider);

    let (runtime, report) = fixture.sweep_report().await;
    assert_eq!(report.removed.len(), 5);
    assert!(runtime.container_ids().is_empty());
}

#[tokio::test]
async fn test_guarded_create_fails_closed_after_the_reaper_exits() {
    let fixture = fixture().await;
    let provider = fixture.provider();

    provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap();
    fixture.shutdown.cancel();
    let (runtime, report) = fixture.sweep_report().await;
    assert_eq!(report.removed.len(), 1);

    let err = provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RegistrationFailed { .. }));
    assert!(runtime.container_ids().is_empty());
}

#[tokio::test]
async fn test_failed_create_after_registration_leaves_nothing_behind() {
    let fixture = fixture().await;
    let provider = fixture.provider();
    fixture.runtime.fail_creates(1);

    let err = provider
        .create_container(ContainerRequest::new("redis:7"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Collaborator { op: "create", ref target, .. } if target == "redis:7"
    ));
    assert_eq!(fixture.registrations.len(), 1);
    drop(provider);

    let (runtime, report) = fixture.sweep_report().await;
    assert!(report.removed.is_empty() && report.is_clean());
    assert!(runtime.container_ids().is_empty());
}
