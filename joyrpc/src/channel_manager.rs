use std::{
    sync::{Arc, Mutex, atomic::{AtomicU64, Ordering}},
    time::Duration,
};

use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    channel::{Channel, ChannelConfig},
    error::{Error, ErrorKind, Result},
    heartbeat::{self, HeartbeatConfig},
    supervisor::TaskSupervisor,
    timewheel::TimeWheel,
    url::{Url, params},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ManagerConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde_inline_default(Duration::from_millis(100))]
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap_or(
            Self {
                channel: ChannelConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                connect_timeout: Duration::from_secs(3),
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_secs(30),
            },
        )
    }
}

/// Opens one channel to an address; implemented per transport protocol.
#[async_trait::async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, url: &Url, manager: &ChannelManager) -> Result<Channel>;
}

#[derive(Default)]
struct Slot {
    channel: Option<Channel>,
    refs: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Backoff {
    attempts: u32,
    next_at: Option<tokio::time::Instant>,
}

/// Pool of shared client channels keyed by endpoint.
///
/// `connect` hands out the existing open channel for an endpoint or opens a
/// fresh one; reference counts are per caller and `release` closes the
/// channel once the count reaches zero and the url does not request sharing.
/// Failed opens arm an exponential backoff with jitter per endpoint.
pub struct ChannelManager {
    config: ManagerConfig,
    slots: dashmap::DashMap<String, Arc<tokio::sync::Mutex<Slot>>, RandomState>,
    backoff: dashmap::DashMap<String, Mutex<Backoff>, RandomState>,
    wheel: Arc<TimeWheel>,
    supervisor: TaskSupervisor,
    next_id: AtomicU64,
}

impl ChannelManager {
    #[must_use]
    pub fn create(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            slots: dashmap::DashMap::default(),
            backoff: dashmap::DashMap::default(),
            wheel: TimeWheel::create(Duration::from_millis(10), 512),
            supervisor: TaskSupervisor::create(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Shared deadline wheel for every channel of this manager.
    #[must_use]
    pub fn wheel(&self) -> &Arc<TimeWheel> {
        &self.wheel
    }

    #[must_use]
    pub fn allocate_channel_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    #[must_use]
    pub fn channel_config(&self, url: &Url) -> ChannelConfig {
        self.config.channel.clone().with_url(url)
    }

    #[must_use]
    pub fn connect_timeout(&self, url: &Url) -> Duration {
        url.duration_param(params::CONNECT_TIMEOUT, self.config.connect_timeout)
    }

    /// Returns the pooled channel for the url's endpoint, opening one with
    /// `opener` when necessary. Each successful call takes one reference.
    ///
    /// # Errors
    ///
    /// Propagates opener failures; while the endpoint is backing off, fails
    /// fast with a retriable `Transport` error instead of dialing.
    pub async fn connect(&self, url: &Url, opener: &dyn ChannelOpener) -> Result<Channel> {
        if self.supervisor.is_stopped() {
            return Err(Error::new(
                ErrorKind::Shutdown,
                "channel manager is stopped".to_string(),
            ));
        }

        let endpoint = url.endpoint();
        if let Some(delay) = self.backoff_remaining(&endpoint) {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("reconnect backoff active for {endpoint}, retry in {delay:?}"),
            ));
        }

        let slot_arc = self.slots.entry(endpoint.clone()).or_default().clone();
        let mut slot = slot_arc.lock().await;
        if let Some(channel) = slot.channel.clone()
            && channel.is_open()
        {
            slot.refs += 1;
            return Ok(channel);
        }

        match opener.open(url, self).await {
            Ok(channel) => {
                self.backoff.remove(&endpoint);
                slot.channel = Some(channel.clone());
                slot.refs = 1;

                heartbeat::start(
                    channel.clone(),
                    self.config.heartbeat.clone().with_url(url),
                    self.supervisor.start_task(),
                );
                self.watch_for_eviction(endpoint, slot_arc.clone(), channel.clone());
                Ok(channel)
            }
            Err(e) => {
                self.arm_backoff(&endpoint);
                Err(e)
            }
        }
    }

    /// Drops one reference; the channel closes at zero unless the url
    /// requests sharing (the default).
    pub async fn release(&self, url: &Url) {
        let endpoint = url.endpoint();
        let Some(slot_arc) = self.slots.get(&endpoint).map(|s| s.clone()) else {
            return;
        };
        let mut slot = slot_arc.lock().await;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0
            && !url.bool_param(params::SHARE, true)
            && let Some(channel) = slot.channel.take()
        {
            channel.close(Error::new(
                ErrorKind::TransportClosed,
                "last reference released".to_string(),
            ));
        }
    }

    /// Number of endpoints currently holding an open channel.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|slot| slot.channel.as_ref().is_some_and(Channel::is_open))
                    .unwrap_or(true)
            })
            .count()
    }

    /// Suggested wait before redialing an endpoint, for reconnect loops.
    #[must_use]
    pub fn retry_delay(&self, endpoint: &str) -> Duration {
        self.backoff_remaining(endpoint)
            .unwrap_or(self.config.backoff_base)
    }

    /// Closes every pooled channel and refuses further connects.
    pub async fn stop(&self) {
        self.supervisor.stop();
        let slots: Vec<_> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        for slot_arc in slots {
            let mut slot = slot_arc.lock().await;
            if let Some(channel) = slot.channel.take() {
                channel.close(Error::new(
                    ErrorKind::TransportClosed,
                    "channel manager stopped".to_string(),
                ));
            }
        }
        self.wheel.stop();
    }

    fn watch_for_eviction(
        &self,
        endpoint: String,
        slot_arc: Arc<tokio::sync::Mutex<Slot>>,
        channel: Channel,
    ) {
        let guard = self.supervisor.start_task();
        tokio::spawn(async move {
            let closed = channel.closed();
            tokio::pin!(closed);
            tokio::select! {
                () = guard.stopped() => return,
                () = &mut closed => {}
            }

            let mut slot = slot_arc.lock().await;
            if slot
                .channel
                .as_ref()
                .is_some_and(|current| current.id() == channel.id())
            {
                tracing::info!("evicting dead channel {} for {endpoint}", channel.id());
                slot.channel = None;
            }
        });
    }

    fn backoff_remaining(&self, endpoint: &str) -> Option<Duration> {
        let entry = self.backoff.get(endpoint)?;
        let state = entry.lock().ok()?;
        let next_at = state.next_at?;
        let now = tokio::time::Instant::now();
        (now < next_at).then(|| next_at - now)
    }

    fn arm_backoff(&self, endpoint: &str) {
        let entry = self
            .backoff
            .entry(endpoint.to_string())
            .or_insert_with(|| Mutex::new(Backoff::default()));
        let Ok(mut state) = entry.lock() else {
            return;
        };
        state.attempts = state.attempts.saturating_add(1);

        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << state.attempts.min(16).saturating_sub(1))
            .min(self.config.backoff_max);
        let jitter_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default() as u128
            % (exp.as_nanos() / 4 + 1);
        let delay = exp + Duration::from_nanos(jitter_ns as u64);
        state.next_at = Some(tokio::time::Instant::now() + delay);
        tracing::warn!(
            "connect to {endpoint} failed {} times, backing off {delay:?}",
            state.attempts
        );
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("endpoints", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::channel::{ChannelOptions, RequestHandler};
    use crate::msg::{Message, MsgFlags, MsgMeta};

    struct Echo;

    #[async_trait::async_trait]
    impl RequestHandler for Echo {
        async fn on_request(&self, channel: Channel, msg: Message) {
            let meta = MsgMeta {
                msgid: msg.meta.msgid,
                flags: MsgFlags::IsRsp,
                ..MsgMeta::default()
            };
            let _ = channel.tell(meta, msg.payload.into());
        }
    }

    /// Opener backed by an in-memory duplex with an echo peer.
    #[derive(Default)]
    struct LoopbackOpener {
        opens: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChannelOpener for LoopbackOpener {
        async fn open(&self, url: &Url, manager: &ChannelManager) -> Result<Channel> {
            self.opens.fetch_add(1, Ordering::AcqRel);
            if self.fail.load(Ordering::Acquire) {
                return Err(Error::new(ErrorKind::Transport, "dial refused".to_string()));
            }

            let (client_io, server_io) = tokio::io::duplex(1 << 20);
            let (client_read, client_write) = tokio::io::split(client_io);
            let (server_read, server_write) = tokio::io::split(server_io);
            let _server = Channel::spawn(
                ChannelOptions {
                    id: manager.allocate_channel_id(),
                    remote: "127.0.0.1:0".parse().unwrap_or_else(|_| unreachable!()),
                    server: true,
                    config: manager.channel_config(url),
                    wheel: manager.wheel().clone(),
                    handler: Some(Arc::new(Echo)),
                },
                server_read,
                server_write,
            );
            Ok(Channel::spawn(
                ChannelOptions {
                    id: manager.allocate_channel_id(),
                    remote: "127.0.0.1:0".parse().unwrap_or_else(|_| unreachable!()),
                    server: false,
                    config: manager.channel_config(url),
                    wheel: manager.wheel().clone(),
                    handler: None,
                },
                client_read,
                client_write,
            ))
        }
    }

    fn url(share: bool) -> Url {
        let url = Url::parse("joyrpc://127.0.0.1:22000/io.joyrpc.Echo").unwrap();
        url.with_param(params::SHARE, if share { "true" } else { "false" })
    }

    #[tokio::test]
    async fn test_connect_shares_one_channel_per_endpoint() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let opener = LoopbackOpener::default();

        let first = manager.connect(&url(true), &opener).await.unwrap();
        let second = manager.connect(&url(true), &opener).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(opener.opens.load(Ordering::Acquire), 1);
        assert_eq!(manager.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_release_closes_unshared_channel_at_zero() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let opener = LoopbackOpener::default();
        let url = url(false);

        let channel = manager.connect(&url, &opener).await.unwrap();
        let _again = manager.connect(&url, &opener).await.unwrap();

        manager.release(&url).await;
        assert!(channel.is_open());
        manager.release(&url).await;
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_arms_backoff() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let opener = LoopbackOpener::default();
        opener.fail.store(true, Ordering::Release);

        let error = manager.connect(&url(true), &opener).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Transport);
        assert_eq!(opener.opens.load(Ordering::Acquire), 1);

        // the gate rejects without dialing while the backoff is armed.
        let error = manager.connect(&url(true), &opener).await.unwrap_err();
        assert!(error.msg.contains("backoff"));
        assert_eq!(opener.opens.load(Ordering::Acquire), 1);
        assert!(manager.retry_delay("127.0.0.1:22000") > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dead_channel_is_evicted_and_reopened() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let opener = LoopbackOpener::default();

        let first = manager.connect(&url(true), &opener).await.unwrap();
        first.close(Error::kind(ErrorKind::TransportDead));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.open_channels(), 0);

        let second = manager.connect(&url(true), &opener).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.is_open());
    }

    #[tokio::test]
    async fn test_stop_refuses_new_connects() {
        let manager = ChannelManager::create(ManagerConfig::default());
        let opener = LoopbackOpener::default();
        let channel = manager.connect(&url(true), &opener).await.unwrap();

        manager.stop().await;
        assert!(!channel.is_open());
        let error = manager.connect(&url(true), &opener).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Shutdown);
    }
}
