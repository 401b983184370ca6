use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use crate::{
    channel::Channel,
    supervisor::Inflight,
    url::{Url, params},
};

/// Connection state of one provider endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Candidate = 0,
    Connecting = 1,
    Connected = 2,
    Weak = 3,
    Closing = 4,
    Dead = 5,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Candidate,
            1 => NodeState::Connecting,
            2 => NodeState::Connected,
            3 => NodeState::Weak,
            4 => NodeState::Closing,
            _ => NodeState::Dead,
        }
    }
}

/// One provider endpoint owned by a cluster.
///
/// Identity is the url, less the weight and tag parameters that registry
/// snapshots may rewrite in place; everything else is set at admission. A
/// node that reaches `Dead` never leaves it; re-admission allocates a fresh
/// node.
pub struct Node {
    url: Url,
    identity: Url,
    weight: AtomicU32,
    tags: Mutex<BTreeMap<String, String>>,
    warmup: Duration,
    started: tokio::time::Instant,
    state: AtomicU8,
    channel: Mutex<Option<Channel>>,
    inflight: Inflight,
}

impl Node {
    #[must_use]
    pub fn new(url: Url) -> Self {
        let weight = url.u32_param(params::WEIGHT, 100);
        let warmup = url.duration_param(params::WARMUP, Duration::ZERO);
        let mut tags = BTreeMap::new();
        if let Some(region) = url.param(params::REGION) {
            tags.insert(params::REGION.to_string(), region.to_string());
        }
        Self {
            identity: Self::identity_of(&url),
            url,
            weight: AtomicU32::new(weight),
            tags: Mutex::new(tags),
            warmup,
            started: tokio::time::Instant::now(),
            state: AtomicU8::new(NodeState::Candidate as u8),
            channel: Mutex::new(None),
            inflight: Inflight::default(),
        }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The identity a node is diffed by: its url without the attributes an
    /// update may rewrite in place (weight, tags). Any other difference
    /// means a different node.
    #[must_use]
    pub fn identity(&self) -> &Url {
        &self.identity
    }

    /// Identity of the node a url advertises.
    #[must_use]
    pub fn identity_of(url: &Url) -> Url {
        url.without_param(params::WEIGHT)
            .without_param(params::REGION)
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts a transition out of any state in `from`. `Dead` is terminal,
    /// so repeated evictions are noops.
    pub fn transition(&self, from: &[NodeState], to: NodeState) -> bool {
        for &state in from {
            if state == NodeState::Dead {
                continue;
            }
            if self
                .state
                .compare_exchange(state as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .lock()
            .ok()
            .and_then(|tags| tags.get(key).cloned())
    }

    /// Applies a weight/tag-only update from a newer snapshot; observers see
    /// the change on the next pick.
    pub fn update_from(&self, url: &Url) {
        self.weight
            .store(url.u32_param(params::WEIGHT, 100), Ordering::Release);
        if let Ok(mut tags) = self.tags.lock() {
            tags.clear();
            if let Some(region) = url.param(params::REGION) {
                tags.insert(params::REGION.to_string(), region.to_string());
            }
        }
    }

    pub(crate) fn set_channel(&self, channel: Channel) {
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel);
        }
    }

    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.channel.lock().ok().and_then(|slot| slot.clone())
    }

    #[must_use]
    pub fn warmed_up(&self) -> bool {
        self.started.elapsed() >= self.warmup
    }

    /// Weight ramped linearly across the warm-up window, so a fresh provider
    /// takes traffic gradually once admitted.
    #[must_use]
    pub fn effective_weight(&self) -> u32 {
        let weight = self.weight();
        if self.warmup.is_zero() {
            return weight;
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.warmup {
            return weight;
        }
        let ratio = elapsed.as_millis() as f64 / self.warmup.as_millis().max(1) as f64;
        ((f64::from(weight) * ratio) as u32).max(1)
    }

    /// Admission check: only connected nodes past their warm-up deadline
    /// receive user traffic. Weak nodes get probe traffic only.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.state() == NodeState::Connected && self.warmed_up()
    }

    #[must_use]
    pub fn inflight(&self) -> &Inflight {
        &self.inflight
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("url", &self.url.to_string())
            .field("state", &self.state())
            .field("weight", &self.weight())
            .finish()
    }
}
