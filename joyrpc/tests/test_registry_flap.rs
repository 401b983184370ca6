use std::sync::Arc;
use std::time::Duration;

use joyrpc::{
    ChannelManager, Event, Exporter, ExporterConfig, ManagerConfig, MemoryRegistry,
    PluginRegistry, Refer, ReferConfig, Service, ServiceKey, Shutdown, ShutdownConfig, Url,
    drain_events,
};

fn echo_service() -> Service {
    let mut service = Service::new("io.joyrpc.Echo");
    service.method("echo", |req: String| async move { Ok(req) });
    service
}

#[tokio::test]
async fn test_snapshot_replay_causes_no_churn() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = Arc::new(Shutdown::new(ShutdownConfig::default()));
    let plugins = PluginRegistry::with_builtins();

    let exporter = Exporter::new(
        Url::parse("joyrpc://127.0.0.1:0/io.joyrpc.Echo?alias=prod").unwrap(),
        ExporterConfig::default(),
        vec![echo_service()],
        registry.clone(),
        shutdown.clone(),
        &plugins,
    )
    .unwrap();
    exporter.open().await.unwrap();

    let refer = Refer::new(
        &Url::parse("joyrpc://127.0.0.1:0/io.joyrpc.Echo?alias=prod").unwrap(),
        ReferConfig::default(),
        registry.clone(),
        ChannelManager::create(ManagerConfig::default()),
        shutdown,
        &plugins,
    )
    .unwrap();
    refer.open().await.unwrap();

    let version = refer.cluster().version();
    let channel_id = refer.cluster().snapshot()[0].channel().unwrap().id();
    let mut events = refer.subscribe_events();
    let _ = drain_events(&mut events);

    // the registry comes back from a flap and replays the unchanged
    // snapshot with the same version.
    let key = ServiceKey::new("io.joyrpc.Echo", "prod");
    for _ in 0..3 {
        registry.republish(&key);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(refer.cluster().version(), version);
    let nodes = refer.cluster().snapshot();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].channel().unwrap().id(), channel_id, "no reopen");

    let churn: Vec<Event> = drain_events(&mut events)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                Event::NodeAdded(_) | Event::NodeRemoved(_) | Event::NodeDead(_)
            )
        })
        .collect();
    assert!(churn.is_empty(), "unexpected node churn: {churn:?}");

    let reply: String = refer.invoke("echo", &"still here".to_string()).await.unwrap();
    assert_eq!(reply, "still here");

    refer.close().await;
    exporter.close().await;
}
