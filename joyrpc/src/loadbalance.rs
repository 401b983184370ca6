use std::{
    hash::BuildHasher,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use foldhash::fast::RandomState;

use crate::{node::Node, request::Request};

/// Picks one node from an eligibility-filtered snapshot.
///
/// Implementations may keep per-instance counters; every invoker builds its
/// own balancer so state is scoped to one cluster. The snapshot is sorted by
/// url, which makes index-based picks deterministic under ties.
pub trait LoadBalance: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, nodes: &[Arc<Node>], request: &Request) -> Option<Arc<Node>>;
}

/// Cycles through the snapshot in url order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl LoadBalance for RoundRobin {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select(&self, nodes: &[Arc<Node>], _request: &Request) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::AcqRel) % nodes.len();
        Some(nodes[index].clone())
    }
}

/// Weighted pick over the warm-up-ramped effective weights.
#[derive(Default)]
pub struct WeightedRandom {
    seed: AtomicU64,
    hasher: RandomState,
}

impl LoadBalance for WeightedRandom {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, nodes: &[Arc<Node>], _request: &Request) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let weights: Vec<u64> = nodes
            .iter()
            .map(|node| u64::from(node.effective_weight()))
            .collect();
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return nodes.first().cloned();
        }

        let roll = self.seed.fetch_add(1, Ordering::AcqRel);
        let mut target = self.hasher.hash_one(roll) % total;
        for (node, weight) in nodes.iter().zip(&weights) {
            if target < *weight {
                return Some(node.clone());
            }
            target -= *weight;
        }
        nodes.first().cloned()
    }
}

/// Prefers the node with the fewest calls in flight; ties resolve to the
/// lowest url since the snapshot is sorted.
#[derive(Debug, Default)]
pub struct LeastActive;

impl LoadBalance for LeastActive {
    fn name(&self) -> &'static str {
        "leastactive"
    }

    fn select(&self, nodes: &[Arc<Node>], _request: &Request) -> Option<Arc<Node>> {
        nodes
            .iter()
            .min_by_key(|node| node.inflight().count())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::Codec;
    use crate::url::Url;

    fn nodes(ports: &[u16]) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = ports
            .iter()
            .map(|port| {
                Arc::new(Node::new(
                    Url::parse(&format!("joyrpc://127.0.0.1:{port}/io.joyrpc.Echo")).unwrap(),
                ))
            })
            .collect();
        nodes.sort_by(|a, b| a.url().cmp(b.url()));
        nodes
    }

    fn request() -> Request {
        Request::new(
            "io.joyrpc.Echo",
            "",
            "echo",
            Codec::Json,
            &(),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let nodes = nodes(&[22000, 22001, 22002]);
        let balancer = RoundRobin::default();
        let request = request();

        let picks: Vec<_> = (0..6)
            .map(|_| balancer.select(&nodes, &request).unwrap().url().port())
            .collect();
        assert_eq!(picks, [22000, 22001, 22002, 22000, 22001, 22002]);
        assert!(balancer.select(&[], &request).is_none());
    }

    #[tokio::test]
    async fn test_weighted_random_skips_zero_total() {
        let nodes = nodes(&[22000]);
        let balancer = WeightedRandom::default();
        assert!(balancer.select(&nodes, &request()).is_some());
        assert!(balancer.select(&[], &request()).is_none());
    }

    #[tokio::test]
    async fn test_weighted_random_respects_weights() {
        let mut nodes = nodes(&[22000]);
        let heavy = Arc::new(Node::new(
            Url::parse("joyrpc://127.0.0.1:22001/io.joyrpc.Echo?weight=100000").unwrap(),
        ));
        nodes.push(heavy.clone());
        nodes.sort_by(|a, b| a.url().cmp(b.url()));

        let balancer = WeightedRandom::default();
        let request = request();
        let heavy_picks = (0..200)
            .filter(|_| {
                balancer.select(&nodes, &request).unwrap().url().port() == 22001
            })
            .count();
        assert!(heavy_picks > 150, "heavy node picked {heavy_picks}/200");
    }

    #[tokio::test]
    async fn test_least_active_prefers_idle_node() {
        let nodes = nodes(&[22000, 22001]);
        let _busy = nodes[0].inflight().track();

        let balancer = LeastActive;
        let pick = balancer.select(&nodes, &request()).unwrap();
        assert_eq!(pick.url().port(), 22001);
    }
}
