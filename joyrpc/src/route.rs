use std::{hash::BuildHasher, sync::Arc};

use foldhash::fast::RandomState;

use crate::{
    error::{Error, ErrorKind, Result},
    loadbalance::LoadBalance,
    node::Node,
    request::Request,
    url::params,
};

/// Composes address filtering, sticky rules, and the balancer into one pick.
///
/// The retry policy around it re-enters `select` with the failed endpoints
/// excluded, so a pick never repeats a node that just failed.
pub struct Route {
    balancer: Arc<dyn LoadBalance>,
    sticky_key: Option<String>,
    region: Option<String>,
    hasher: RandomState,
}

impl Route {
    #[must_use]
    pub fn new(balancer: Arc<dyn LoadBalance>) -> Self {
        Self {
            balancer,
            sticky_key: None,
            region: None,
            hasher: RandomState::default(),
        }
    }

    /// Pins calls carrying the named attachment to one node by hashing its
    /// value over the candidate list.
    #[must_use]
    pub fn with_sticky(mut self, key: Option<String>) -> Self {
        self.sticky_key = key;
        self
    }

    /// Restricts candidates to nodes tagged with the region.
    #[must_use]
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Selects one node for the request. `excluded` carries the identities
    /// of nodes that already failed this call.
    ///
    /// # Errors
    ///
    /// Fails with `NoAvailableNode` when no candidate survives admission,
    /// region filtering, and the exclusion list.
    pub fn select(
        &self,
        nodes: &[Arc<Node>],
        request: &Request,
        excluded: &[crate::url::Url],
    ) -> Result<Arc<Node>> {
        let candidates: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|node| node.is_eligible())
            .filter(|node| !excluded.contains(node.identity()))
            .filter(|node| match &self.region {
                None => true,
                Some(region) => node.tag(params::REGION).as_deref() == Some(region),
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::new(
                ErrorKind::NoAvailableNode,
                format!("0 of {} nodes eligible", nodes.len()),
            ));
        }

        if let Some(key) = &self.sticky_key
            && let Some(value) = request.attachments.get(key)
        {
            let index = (self.hasher.hash_one(value) as usize) % candidates.len();
            return Ok(candidates[index].clone());
        }

        self.balancer
            .select(&candidates, request)
            .ok_or_else(|| Error::kind(ErrorKind::NoAvailableNode))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("balancer", &self.balancer.name())
            .field("sticky", &self.sticky_key)
            .field("region", &self.region)
            .finish()
    }
}
