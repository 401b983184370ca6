use std::{
    net::SocketAddr,
    sync::{Arc, atomic::{AtomicU64, Ordering}},
    time::Duration,
};

use foldhash::fast::RandomState;
use tokio::net::{TcpListener, TcpStream};

use crate::{
    channel::{Channel, ChannelConfig, ChannelOptions, RequestHandler},
    channel_manager::{ChannelManager, ChannelOpener},
    error::{Error, ErrorKind, Result},
    supervisor::TaskSupervisor,
    timewheel::TimeWheel,
    url::{Url, params},
};

/// Client side of the framed TCP protocol; plugged into a
/// [`ChannelManager`] as the opener for `joyrpc://` addresses.
#[derive(Debug, Default)]
pub struct TcpClientTransport;

#[async_trait::async_trait]
impl ChannelOpener for TcpClientTransport {
    async fn open(&self, url: &Url, manager: &ChannelManager) -> Result<Channel> {
        if url.bool_param(params::SSL_ENABLE, false) {
            return Err(Error::new(
                ErrorKind::Config,
                "ssl is not supported by the tcp transport".to_string(),
            ));
        }

        let endpoint = url.endpoint();
        let connect_timeout = manager.connect_timeout(url);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::Transport,
                    format!("connect to {endpoint} timed out after {connect_timeout:?}"),
                )
            })?
            .map_err(|e| {
                Error::new(ErrorKind::Transport, format!("connect to {endpoint}: {e}"))
            })?;
        let _ = stream.set_nodelay(true);
        let remote = stream
            .peer_addr()
            .map_err(|e| Error::new(ErrorKind::Transport, e.to_string()))?;

        let (reader, writer) = stream.into_split();
        Ok(Channel::spawn(
            ChannelOptions {
                id: manager.allocate_channel_id(),
                remote,
                server: false,
                config: manager.channel_config(url),
                wheel: manager.wheel().clone(),
                handler: None,
            },
            reader,
            writer,
        ))
    }
}

/// Server side of the framed TCP protocol: accept loop plus the set of
/// accepted channels.
pub struct TcpServerTransport {
    config: ChannelConfig,
    wheel: Arc<TimeWheel>,
    acceptor: TaskSupervisor,
    channels: dashmap::DashMap<u64, Channel, RandomState>,
    next_id: AtomicU64,
}

impl TcpServerTransport {
    #[must_use]
    pub fn create(config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            wheel: TimeWheel::create(Duration::from_millis(10), 512),
            acceptor: TaskSupervisor::create(),
            channels: dashmap::DashMap::default(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Binds and starts the accept loop; every accepted connection becomes a
    /// server channel dispatching requests into `handler`.
    ///
    /// # Errors
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::Init, format!("bind {addr}: {e}")))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::Init, e.to_string()))?;

        let guard = self.acceptor.start_task();
        tokio::spawn({
            let this = self.clone();
            async move {
                tokio::select! {
                    () = guard.stopped() => {
                        tracing::info!("stop accept loop on {listener_addr}");
                    }
                    () = async {
                        tracing::info!("start listening: {listener_addr}");
                        while let Ok((stream, peer)) = listener.accept().await {
                            this.add_channel(stream, peer, handler.clone());
                        }
                    } => {}
                }
            }
        });

        Ok(listener_addr)
    }

    fn add_channel(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, handler: Arc<dyn RequestHandler>) {
        let _ = stream.set_nodelay(true);
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let (reader, writer) = stream.into_split();
        let channel = Channel::spawn(
            ChannelOptions {
                id,
                remote: peer,
                server: true,
                config: self.config.clone(),
                wheel: self.wheel.clone(),
                handler: Some(handler),
            },
            reader,
            writer,
        );
        self.channels.insert(id, channel.clone());

        let this = self.clone();
        tokio::spawn(async move {
            channel.closed().await;
            this.channels.remove(&id);
        });
    }

    pub(crate) fn wheel(&self) -> &Arc<TimeWheel> {
        &self.wheel
    }

    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Stops accepting new connections; established channels keep serving.
    pub fn stop_accepting(&self) {
        self.acceptor.stop();
    }

    /// Closes every accepted channel.
    pub fn close_channels(&self, error: &Error) {
        let channels: Vec<Channel> = self.channels.iter().map(|e| e.value().clone()).collect();
        for channel in channels {
            channel.close(error.clone());
        }
    }

    pub async fn stop(&self) {
        self.stop_accepting();
        self.close_channels(&Error::new(
            ErrorKind::TransportClosed,
            "server transport stopped".to_string(),
        ));
        self.acceptor.all_stopped().await;
        self.wheel.stop();
    }
}

impl std::fmt::Debug for TcpServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerTransport")
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// Dials `addr` and exchanges one heartbeat, verifying the transport answers
/// end to end. Used as the bind-time self check before registration.
pub(crate) async fn probe_endpoint(
    addr: SocketAddr,
    wheel: &Arc<TimeWheel>,
    timeout: Duration,
) -> Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::new(ErrorKind::Init, format!("self check on {addr} timed out")))?
        .map_err(|e| Error::new(ErrorKind::Init, format!("self check on {addr}: {e}")))?;
    let (reader, writer) = stream.into_split();
    let channel = Channel::spawn(
        ChannelOptions {
            id: 0,
            remote: addr,
            server: false,
            config: ChannelConfig::default(),
            wheel: wheel.clone(),
            handler: None,
        },
        reader,
        writer,
    );
    let result = channel.probe(timeout).await;
    channel.close(Error::new(
        ErrorKind::TransportClosed,
        "self check complete".to_string(),
    ));
    result.map_err(|e| Error::new(ErrorKind::Init, format!("self check on {addr}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::channel_manager::ManagerConfig;
    use crate::msg::{Message, MsgFlags, MsgMeta};

    struct Reverse;

    #[async_trait::async_trait]
    impl RequestHandler for Reverse {
        async fn on_request(&self, channel: Channel, msg: Message) {
            let reversed: Vec<u8> = msg.payload.iter().rev().copied().collect();
            let meta = MsgMeta {
                msgid: msg.meta.msgid,
                flags: MsgFlags::IsRsp,
                ..MsgMeta::default()
            };
            let _ = channel.tell(meta, Bytes::from(reversed));
        }
    }

    fn url_for(addr: SocketAddr) -> Url {
        Url::parse(&format!("joyrpc://{addr}/io.joyrpc.Echo")).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let server = TcpServerTransport::create(ChannelConfig::default());
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap(), Arc::new(Reverse))
            .await
            .unwrap();

        let manager = ChannelManager::create(ManagerConfig::default());
        let channel = manager
            .connect(&url_for(addr), &TcpClientTransport)
            .await
            .unwrap();

        let meta = MsgMeta {
            method: "echo".into(),
            flags: MsgFlags::IsReq,
            ..MsgMeta::default()
        };
        let receiver = channel
            .ask(meta, Bytes::from_static(b"abc"), Duration::from_secs(1))
            .unwrap();
        let msg = receiver.recv().await.unwrap();
        assert_eq!(msg.payload.as_slice(), b"cba");

        server.stop().await;
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_probe_endpoint_self_check() {
        let server = TcpServerTransport::create(ChannelConfig::default());
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap(), Arc::new(Reverse))
            .await
            .unwrap();

        let wheel = TimeWheel::create(Duration::from_millis(10), 64);
        probe_endpoint(addr, &wheel, Duration::from_secs(1))
            .await
            .unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ssl_param_is_rejected() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let url = url_for("127.0.0.1:1".parse().unwrap()).with_param(params::SSL_ENABLE, "true");
        let error = manager
            .connect(&url, &TcpClientTransport)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_server_channel_count_follows_disconnects() {
        let server = TcpServerTransport::create(ChannelConfig::default());
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap(), Arc::new(Reverse))
            .await
            .unwrap();

        let manager = ChannelManager::create(ManagerConfig::default());
        let channel = manager
            .connect(&url_for(addr), &TcpClientTransport)
            .await
            .unwrap();
        channel.probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.open_channels(), 1);

        channel.close(Error::kind(ErrorKind::TransportClosed));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.open_channels(), 0);
        server.stop().await;
    }
}
