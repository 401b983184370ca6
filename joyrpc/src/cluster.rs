use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock, atomic::{AtomicU64, Ordering}},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    channel_manager::{ChannelManager, ChannelOpener},
    error::{Error, ErrorKind, Result},
    event::{Event, EventSender},
    node::{Node, NodeState},
    registry::{ClusterSnapshot, ServiceKey},
    supervisor::TaskSupervisor,
    url::Url,
};

/// What `open` waits for before declaring the binding usable.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OpenWait {
    /// The initial registry snapshot arrived, even if empty.
    Snapshot,
    /// At least one node is eligible for traffic.
    #[default]
    Node,
}

/// Live set of provider nodes for one service.
///
/// Consumes the registry's cluster stream and diffs each snapshot against
/// the current membership: new urls are admitted as candidates and dialed,
/// vanished urls are drained and evicted, surviving urls get their weight
/// and tags updated in place. The node set handed to selection is a
/// copy-on-write snapshot, so readers never observe a partial transition.
pub struct Cluster {
    key: ServiceKey,
    manager: Arc<ChannelManager>,
    opener: Arc<dyn ChannelOpener>,
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
    /// Advertised providers keyed by node identity (see [`Node::identity`]).
    desired: Mutex<BTreeMap<Url, Url>>,
    version: AtomicU64,
    first_snapshot: CancellationToken,
    ready_notify: tokio::sync::Notify,
    events: EventSender,
    supervisor: TaskSupervisor,
    drain_timeout: Duration,
}

impl Cluster {
    #[must_use]
    pub fn create(
        key: ServiceKey,
        manager: Arc<ChannelManager>,
        opener: Arc<dyn ChannelOpener>,
        events: EventSender,
        drain_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            manager,
            opener,
            nodes: RwLock::new(Arc::new(Vec::new())),
            desired: Mutex::new(BTreeMap::new()),
            version: AtomicU64::default(),
            first_snapshot: CancellationToken::new(),
            ready_notify: tokio::sync::Notify::new(),
            events,
            supervisor: TaskSupervisor::create(),
            drain_timeout,
        })
    }

    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Last applied snapshot version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Atomic membership snapshot, sorted by url.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes
            .read()
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_eligible(&self) -> bool {
        self.snapshot().iter().any(|node| node.is_eligible())
    }

    /// Starts consuming the registry stream.
    pub fn start(self: &Arc<Self>, mut rx: watch::Receiver<ClusterSnapshot>) {
        let guard = self.supervisor.start_task();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                this.apply(snapshot);

                tokio::select! {
                    () = guard.stopped() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::warn!(
                                "registry stream for {} ended, keeping last membership",
                                this.key
                            );
                            let _ = this.events.send(Event::RegistryDown);
                            guard.stopped().await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Stops stream consumption and drains every node.
    pub async fn stop(&self) {
        self.supervisor.stop();
        let nodes = self.snapshot();
        if let Ok(mut slot) = self.nodes.write() {
            *slot = Arc::new(Vec::new());
        }
        for node in nodes.iter() {
            self.close_node(node).await;
        }
    }

    /// Waits for the binding to become usable.
    ///
    /// # Errors
    ///
    /// Fails with `Init` when the condition is not met within `timeout`.
    pub async fn wait_ready(&self, wait: OpenWait, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        match wait {
            OpenWait::Snapshot => {
                tokio::select! {
                    () = self.first_snapshot.cancelled() => Ok(()),
                    () = tokio::time::sleep_until(deadline) => Err(Error::new(
                        ErrorKind::Init,
                        format!("no registry snapshot for {} within {timeout:?}", self.key),
                    )),
                }
            }
            OpenWait::Node => {
                loop {
                    let notified = self.ready_notify.notified();
                    if self.has_eligible() {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::new(
                            ErrorKind::Init,
                            format!("no eligible node for {} within {timeout:?}", self.key),
                        ));
                    }
                    tokio::select! {
                        () = notified => {}
                        // warm-up completes by time passing, so re-check periodically.
                        () = tokio::time::sleep(Duration::from_millis(50)) => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    fn apply(self: &Arc<Self>, snapshot: ClusterSnapshot) {
        let first = !self.first_snapshot.is_cancelled();
        if !first && snapshot.version <= self.version() {
            tracing::debug!(
                "dropping stale snapshot v{} for {} (applied v{})",
                snapshot.version,
                self.key,
                self.version()
            );
            return;
        }

        // one node per url; urls differing only in weight/tags update that
        // node in place, and duplicates collapse.
        let desired: BTreeMap<Url, Url> = snapshot
            .providers
            .into_iter()
            .map(|url| (Node::identity_of(&url), url))
            .collect();

        let mut added: Vec<Arc<Node>> = Vec::new();
        let mut removed: Vec<Arc<Node>> = Vec::new();

        // diff under the write lock so concurrent dead-node replacement
        // cannot slip between the read and the swap.
        if let Ok(mut slot) = self.nodes.write() {
            let current = slot.clone();
            let mut kept: Vec<Arc<Node>> = Vec::with_capacity(desired.len());

            for node in current.iter() {
                match desired.get(node.identity()) {
                    Some(url) if node.state() == NodeState::Dead => {
                        // still advertised; replace the dead node with a fresh one.
                        let fresh = Arc::new(Node::new(url.clone()));
                        added.push(fresh.clone());
                        kept.push(fresh);
                    }
                    Some(url) => {
                        // weight/tag-only update, applied in place.
                        node.update_from(url);
                        kept.push(node.clone());
                    }
                    None => removed.push(node.clone()),
                }
            }
            for (identity, url) in &desired {
                if !current.iter().any(|node| node.identity() == identity) {
                    let node = Arc::new(Node::new(url.clone()));
                    let _ = self.events.send(Event::NodeAdded(url.clone()));
                    added.push(node.clone());
                    kept.push(node);
                }
            }
            kept.sort_by(|a, b| a.url().cmp(b.url()));
            *slot = Arc::new(kept);
        }
        if let Ok(mut slot) = self.desired.lock() {
            *slot = desired;
        }
        self.version.store(snapshot.version, Ordering::Release);
        self.first_snapshot.cancel();
        tracing::info!(
            "applied snapshot v{} for {}: +{} -{}",
            snapshot.version,
            self.key,
            added.len(),
            removed.len()
        );

        for node in added {
            self.spawn_connect(node);
        }
        for node in removed {
            let _ = self.events.send(Event::NodeRemoved(node.url().clone()));
            let this = self.clone();
            tokio::spawn(async move { this.close_node(&node).await });
        }
    }

    fn spawn_connect(self: &Arc<Self>, node: Arc<Node>) {
        let guard = self.supervisor.start_task();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if !node.transition(&[NodeState::Candidate], NodeState::Connecting) {
                    return;
                }
                match this.manager.connect(node.url(), this.opener.as_ref()).await {
                    Ok(channel) => {
                        // admission needs one answered heartbeat, not just a
                        // completed dial.
                        if let Err(e) = channel.probe(Duration::from_secs(3)).await {
                            tracing::warn!("first heartbeat to {} failed: {e}", node.url());
                            this.manager.release(node.url()).await;
                            if !node.transition(&[NodeState::Connecting], NodeState::Candidate) {
                                return;
                            }
                        } else {
                            node.set_channel(channel.clone());
                            if node.transition(&[NodeState::Connecting], NodeState::Connected) {
                                this.ready_notify.notify_waiters();
                                this.watch_node(node, channel);
                            } else {
                                // lost a race with removal; give the reference back.
                                this.manager.release(node.url()).await;
                            }
                            return;
                        }
                        let delay = this.manager.retry_delay(&node.url().endpoint());
                        tokio::select! {
                            () = guard.stopped() => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!("connect {} failed: {e}", node.url());
                        if !node.transition(&[NodeState::Connecting], NodeState::Candidate) {
                            return;
                        }
                        let delay = this.manager.retry_delay(&node.url().endpoint());
                        tokio::select! {
                            () = guard.stopped() => return,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
    }

    fn watch_node(self: &Arc<Self>, node: Arc<Node>, channel: crate::channel::Channel) {
        let guard = self.supervisor.start_task();
        let this = self.clone();
        tokio::spawn(async move {
            let closed = channel.closed();
            tokio::pin!(closed);
            tokio::select! {
                () = guard.stopped() => return,
                () = &mut closed => {}
            }

            if node.transition(&[NodeState::Connected, NodeState::Weak], NodeState::Dead) {
                let _ = this.events.send(Event::NodeDead(node.url().clone()));
                this.replace_dead(&node);
            }
        });
    }

    /// Admits a fresh candidate for a still-advertised url whose node died.
    fn replace_dead(self: &Arc<Self>, dead: &Arc<Node>) {
        if self.supervisor.is_stopped() {
            return;
        }
        // take the currently advertised url, which may carry newer
        // weight/tags than the dead node saw.
        let Some(url) = self
            .desired
            .lock()
            .ok()
            .and_then(|desired| desired.get(dead.identity()).cloned())
        else {
            return;
        };

        let fresh = Arc::new(Node::new(url.clone()));
        let mut replaced = false;
        if let Ok(mut slot) = self.nodes.write() {
            let mut nodes: Vec<Arc<Node>> = slot.as_ref().clone();
            for entry in &mut nodes {
                if entry.identity() == dead.identity() && entry.state() == NodeState::Dead {
                    *entry = fresh.clone();
                    replaced = true;
                    break;
                }
            }
            if replaced {
                *slot = Arc::new(nodes);
            }
        }
        if replaced {
            tracing::info!("re-admitting {url} after channel death");
            self.spawn_connect(fresh);
        }
    }

    async fn close_node(&self, node: &Arc<Node>) {
        if !node.transition(
            &[
                NodeState::Candidate,
                NodeState::Connecting,
                NodeState::Connected,
                NodeState::Weak,
            ],
            NodeState::Closing,
        ) {
            return;
        }

        if !node.inflight().drain(self.drain_timeout).await {
            tracing::warn!(
                "node {} still had calls in flight after {:?}",
                node.url(),
                self.drain_timeout
            );
        }
        node.transition(&[NodeState::Closing], NodeState::Dead);
        self.manager.release(node.url()).await;
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("key", &self.key.to_string())
            .field("version", &self.version())
            .field("nodes", &self.snapshot().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_manager::ManagerConfig;
    use crate::channel::Channel;

    /// Opener that never succeeds; membership logic is what's under test.
    struct DeadEndOpener;

    #[async_trait::async_trait]
    impl ChannelOpener for DeadEndOpener {
        async fn open(&self, _url: &Url, _manager: &ChannelManager) -> crate::Result<Channel> {
            Err(Error::new(ErrorKind::Transport, "unreachable".to_string()))
        }
    }

    fn provider(port: u16) -> Url {
        Url::parse(&format!("joyrpc://127.0.0.1:{port}/io.joyrpc.Echo?alias=prod")).unwrap()
    }

    fn cluster() -> (
        Arc<Cluster>,
        watch::Sender<ClusterSnapshot>,
        watch::Receiver<ClusterSnapshot>,
        EventSender,
    ) {
        let (tx, rx) = watch::channel(ClusterSnapshot::default());
        let events = crate::event::channel();
        let cluster = Cluster::create(
            ServiceKey::new("io.joyrpc.Echo", "prod"),
            ChannelManager::create(ManagerConfig::default()),
            Arc::new(DeadEndOpener),
            events.clone(),
            Duration::from_millis(100),
        );
        (cluster, tx, rx, events)
    }

    #[tokio::test]
    async fn test_stale_versions_are_dropped() {
        let (cluster, tx, rx, _events) = cluster();
        cluster.start(rx);

        tx.send_replace(ClusterSnapshot {
            version: 2,
            providers: vec![provider(22000), provider(22001)],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.version(), 2);
        assert_eq!(cluster.snapshot().len(), 2);

        // an older version must not replace the membership.
        tx.send_replace(ClusterSnapshot {
            version: 1,
            providers: vec![provider(22002)],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.version(), 2);
        assert_eq!(cluster.snapshot().len(), 2);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_urls_collapse() {
        let (cluster, tx, rx, _events) = cluster();
        cluster.start(rx);

        tx.send_replace(ClusterSnapshot {
            version: 1,
            providers: vec![provider(22000), provider(22000), provider(22000)],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.snapshot().len(), 1);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_removal_and_same_version_replay() {
        let (cluster, tx, rx, _events) = cluster();
        cluster.start(rx);

        tx.send_replace(ClusterSnapshot {
            version: 1,
            providers: vec![provider(22000), provider(22001)],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send_replace(ClusterSnapshot {
            version: 2,
            providers: vec![provider(22000)],
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let nodes = cluster.snapshot();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].url(), &provider(22000));

        // replaying the same version is a noop.
        tx.send_replace(ClusterSnapshot {
            version: 2,
            providers: vec![provider(22000)],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.snapshot().len(), 1);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_wait_ready() {
        let (cluster, tx, rx, _events) = cluster();
        let error = cluster
            .wait_ready(OpenWait::Snapshot, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Init);

        cluster.start(rx);
        tx.send_replace(ClusterSnapshot {
            version: 1,
            providers: Vec::new(),
        });
        cluster
            .wait_ready(OpenWait::Snapshot, Duration::from_secs(1))
            .await
            .unwrap();

        // no eligible node ever appears with a dead-end opener.
        let error = cluster
            .wait_ready(OpenWait::Node, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Init);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_weight_update_mutates_the_node_in_place() {
        let (cluster, tx, rx, events) = cluster();
        let mut events = events.subscribe();
        cluster.start(rx);

        tx.send_replace(ClusterSnapshot {
            version: 1,
            providers: vec![provider(22000).with_param(crate::url::params::WEIGHT, "100")],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.snapshot()[0].weight(), 100);
        let _ = crate::event::drain_events(&mut events);

        tx.send_replace(ClusterSnapshot {
            version: 2,
            providers: vec![provider(22000).with_param(crate::url::params::WEIGHT, "300")],
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // same node, new weight; no membership churn.
        let nodes = cluster.snapshot();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].weight(), 300);
        assert!(crate::event::drain_events(&mut events).is_empty());
        cluster.stop().await;
    }
}
