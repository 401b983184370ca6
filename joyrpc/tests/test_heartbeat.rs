use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use joyrpc::{
    ChannelManager, ErrorKind, HeartbeatConfig, HeartbeatMode, ManagerConfig, MsgFlags, MsgMeta,
    TcpClientTransport, Url,
};

/// Accepts connections and reads forever without ever writing back, keeping
/// the TCP connection alive while heartbeats go unanswered.
async fn start_black_hole() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut sink = [0u8; 4096];
                while let Ok(n) = stream.read(&mut sink).await {
                    if n == 0 {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_unanswered_heartbeats_kill_the_channel() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let addr = start_black_hole().await;

    let manager = ChannelManager::create(ManagerConfig {
        heartbeat: HeartbeatConfig {
            mode: HeartbeatMode::Timing,
            interval: Duration::from_millis(100),
            failures: 3,
            probe_timeout: Duration::from_millis(80),
        },
        ..ManagerConfig::default()
    });
    let url = Url::parse(&format!("joyrpc://{addr}/io.joyrpc.Echo")).unwrap();

    let channel = manager.connect(&url, &TcpClientTransport).await.unwrap();
    let first_id = channel.id();

    // a user call outlives the heartbeat verdict and fails with it.
    let meta = MsgMeta {
        method: "echo".into(),
        flags: MsgFlags::IsReq,
        ..MsgMeta::default()
    };
    let receiver = channel
        .ask(meta, Bytes::from_static(b"{}"), Duration::from_secs(10))
        .unwrap();

    // 3 failures x (100ms interval + 80ms probe) lands well inside 2s.
    let error = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("heartbeat verdict overdue")
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::TransportDead);
    assert!(!channel.is_open());

    // the pool evicted the dead entry and the next connect opens fresh.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.open_channels(), 0);
    let next = manager.connect(&url, &TcpClientTransport).await.unwrap();
    assert_ne!(next.id(), first_id);
    assert!(next.is_open());

    manager.stop().await;
}

#[tokio::test]
async fn test_idle_mode_spares_busy_channels() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let addr = start_black_hole().await;

    let manager = ChannelManager::create(ManagerConfig {
        heartbeat: HeartbeatConfig {
            mode: HeartbeatMode::Idle,
            interval: Duration::from_millis(150),
            failures: 2,
            probe_timeout: Duration::from_millis(80),
        },
        ..ManagerConfig::default()
    });
    let url = Url::parse(&format!("joyrpc://{addr}/io.joyrpc.Echo")).unwrap();
    let channel = manager.connect(&url, &TcpClientTransport).await.unwrap();

    // keep the write side busy; idle mode must not ping a busy channel.
    for _ in 0..8 {
        let meta = MsgMeta {
            flags: MsgFlags::IsRsp,
            ..MsgMeta::default()
        };
        let _ = channel.tell(meta, Bytes::from_static(b"tick"));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(channel.is_open());

    // once traffic stops, the idle window elapses and the verdict falls.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!channel.is_open());

    manager.stop().await;
}
