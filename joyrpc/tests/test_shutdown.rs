use std::sync::Arc;
use std::time::Duration;

use joyrpc::{
    ChannelManager, ErrorKind, Exporter, ExporterConfig, InvokerState, ManagerConfig,
    MemoryRegistry, PluginRegistry, Refer, ReferConfig, Service, ServiceKey, Shutdown,
    ShutdownConfig, Url,
};

fn slow_service() -> Service {
    let mut service = Service::new("io.joyrpc.Slow");
    service.method("work", |ms: u64| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    });
    service
}

struct Fixture {
    registry: Arc<MemoryRegistry>,
    shutdown: Arc<Shutdown>,
    plugins: PluginRegistry,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            registry: Arc::new(MemoryRegistry::new()),
            shutdown: Arc::new(Shutdown::new(ShutdownConfig::default())),
            plugins: PluginRegistry::with_builtins(),
        }
    }

    async fn bind(&self) -> (Arc<Exporter>, Arc<Refer>) {
        let exporter = Exporter::new(
            Url::parse("joyrpc://127.0.0.1:0/io.joyrpc.Slow?alias=prod").unwrap(),
            ExporterConfig::default(),
            vec![slow_service()],
            self.registry.clone(),
            self.shutdown.clone(),
            &self.plugins,
        )
        .unwrap();
        exporter.open().await.unwrap();

        let refer = Refer::new(
            &Url::parse("joyrpc://127.0.0.1:0/io.joyrpc.Slow?alias=prod").unwrap(),
            ReferConfig {
                timeout: Duration::from_secs(5),
                ..ReferConfig::default()
            },
            self.registry.clone(),
            ChannelManager::create(ManagerConfig::default()),
            self.shutdown.clone(),
            &self.plugins,
        )
        .unwrap();
        refer.open().await.unwrap();
        (exporter, refer)
    }
}

#[tokio::test]
async fn test_graceful_close_drains_in_flight_calls() {
    let fixture = Fixture::new();
    let (exporter, refer) = fixture.bind().await;
    let key = ServiceKey::new("io.joyrpc.Slow", "prod");

    let mut calls = Vec::new();
    for _ in 0..30 {
        let refer = refer.clone();
        calls.push(tokio::spawn(async move {
            refer.invoke::<u64, u64>("work", &50).await
        }));
    }
    // let every request reach the provider before closing it.
    tokio::time::sleep(Duration::from_millis(25)).await;

    exporter.close().await;
    assert_eq!(exporter.state(), InvokerState::Closed);
    assert!(fixture.registry.providers(&key).is_empty());

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), 50);
    }
    refer.close().await;
}

#[tokio::test]
async fn test_coordinator_closes_invokers_in_priority_order() {
    let fixture = Fixture::new();
    let (exporter, refer) = fixture.bind().await;

    fixture.shutdown.shutdown().await;
    assert!(fixture.shutdown.is_shutting_down());
    assert_eq!(refer.state(), InvokerState::Closed);
    assert_eq!(exporter.state(), InvokerState::Closed);

    let error = refer
        .invoke::<u64, u64>("work", &1)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Shutdown);

    // reopening after process shutdown is refused.
    let error = refer.open().await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Shutdown);
}

#[tokio::test]
async fn test_requests_during_closing_fail_fast() {
    let fixture = Fixture::new();
    let (exporter, refer) = fixture.bind().await;

    let slow = {
        let refer = refer.clone();
        tokio::spawn(async move { refer.invoke::<u64, u64>("work", &200).await })
    };
    tokio::time::sleep(Duration::from_millis(25)).await;

    let closing = {
        let refer = refer.clone();
        tokio::spawn(async move { refer.close().await })
    };
    tokio::time::sleep(Duration::from_millis(25)).await;

    // the invoker is CLOSING: new work is refused immediately.
    let error = refer
        .invoke::<u64, u64>("work", &1)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Shutdown);

    // while the in-flight call still completes within the drain window.
    assert_eq!(slow.await.unwrap().unwrap(), 200);
    closing.await.unwrap();
    exporter.close().await;
}
