use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    channel::Channel,
    error::{Error, ErrorKind},
    supervisor::TaskGuard,
    url::{Url, params},
};

#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatMode {
    /// Ping at a fixed interval regardless of traffic.
    Timing,
    /// Ping only when the channel saw no bytes within the interval.
    Idle,
}

impl std::str::FromStr for HeartbeatMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "timing" => Ok(HeartbeatMode::Timing),
            "idle" => Ok(HeartbeatMode::Idle),
            other => Err(Error::new(
                ErrorKind::Config,
                format!("unknown heartbeat mode `{other}`"),
            )),
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct HeartbeatConfig {
    #[serde_inline_default(HeartbeatMode::Timing)]
    pub mode: HeartbeatMode,
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive failures before the channel is declared dead.
    #[serde_inline_default(3)]
    pub failures: u32,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap_or(
            Self {
                mode: HeartbeatMode::Timing,
                interval: Duration::from_secs(10),
                failures: 3,
                probe_timeout: Duration::from_secs(3),
            },
        )
    }
}

impl HeartbeatConfig {
    /// Applies per-address overrides carried on the url.
    #[must_use]
    pub fn with_url(mut self, url: &Url) -> Self {
        self.interval = url.duration_param(params::HEARTBEAT_INTERVAL, self.interval);
        if let Some(mode) = url.param(params::HEARTBEAT_MODE)
            && let Ok(mode) = mode.parse()
        {
            self.mode = mode;
        }
        self
    }
}

/// Monitors one channel, consulting the configured strategy every tick.
///
/// After `failures` consecutive missed pongs the channel is closed with
/// `TransportDead`, which fails its pending calls and lets the owning pool
/// evict it.
pub(crate) fn start(channel: Channel, config: HeartbeatConfig, guard: TaskGuard) {
    tokio::spawn(async move {
        let closed = channel.closed();
        tokio::pin!(closed);

        let start = tokio::time::Instant::now() + config.interval;
        let mut ticker = tokio::time::interval_at(start, config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut misses = 0u32;

        loop {
            tokio::select! {
                () = guard.stopped() => return,
                () = &mut closed => return,
                _ = ticker.tick() => {}
            }

            if config.mode == HeartbeatMode::Idle && channel.idle_for() < config.interval {
                misses = 0;
                continue;
            }

            match channel.probe(config.probe_timeout).await {
                Ok(()) => misses = 0,
                Err(e) => {
                    misses += 1;
                    tracing::warn!(
                        "heartbeat miss {misses}/{} on channel {}: {e}",
                        config.failures,
                        channel.id()
                    );
                    if misses >= config.failures {
                        channel.close(Error::new(
                            ErrorKind::TransportDead,
                            format!("{misses} consecutive heartbeat failures"),
                        ));
                        return;
                    }
                }
            }
        }
    });
}
