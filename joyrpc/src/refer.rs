use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;

use crate::{
    channel_manager::{ChannelManager, ChannelOpener},
    cluster::{Cluster, OpenWait},
    codec::Codec,
    descriptor::MethodOptions,
    error::{Error, ErrorKind, Result},
    event::{self, EventReceiver, EventSender},
    filter::{CACHE_ATTACHMENT, FilterChain},
    plugin::PluginRegistry,
    registry::{Registry, ServiceKey},
    request::{Request, Response},
    route::Route,
    shutdown::{REFER_PRIORITY, Shutdown},
    supervisor::Inflight,
    switch::{InvokerState, StateSwitch},
    tcp::TcpClientTransport,
    url::{Url, params},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ReferConfig {
    #[serde_inline_default(String::new())]
    pub alias: String,
    /// Aggregate call deadline.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    #[serde_inline_default(0)]
    pub retries: u32,
    /// Per-attempt budget; the remaining aggregate deadline when unset.
    #[serde(default, with = "humantime_serde::option")]
    pub attempt_timeout: Option<Duration>,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub open_wait: OpenWait,
    #[serde_inline_default("msgpack".to_string())]
    pub serialization: String,
    #[serde_inline_default("random".to_string())]
    pub loadbalance: String,
    /// Attachment name that pins calls to one node.
    #[serde(default)]
    pub sticky: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde_inline_default(vec!["trace".to_string()])]
    pub filters: Vec<String>,
    /// Drain deadline for in-flight calls on close.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Drain deadline for a node evicted by a registry update.
    #[serde_inline_default(Duration::from_secs(2))]
    #[serde(with = "humantime_serde")]
    pub node_drain_timeout: Duration,
    #[serde(default)]
    pub method_options: BTreeMap<String, MethodOptions>,
}

impl Default for ReferConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap_or_else(|_| unreachable!("empty object satisfies every default"))
    }
}

impl ReferConfig {
    /// Applies overrides carried on the consumer url.
    #[must_use]
    pub fn with_url(mut self, url: &Url) -> Self {
        self.alias = url.string_param(params::ALIAS, &self.alias);
        self.timeout = url.duration_param(params::TIMEOUT, self.timeout);
        self.retries = url.u32_param(params::RETRIES, self.retries);
        self.connect_timeout = url.duration_param(params::CONNECT_TIMEOUT, self.connect_timeout);
        self.serialization = url.string_param(params::SERIALIZATION, &self.serialization);
        self.loadbalance = url.string_param(params::LOADBALANCE, &self.loadbalance);
        if let Some(sticky) = url.param(params::STICKY) {
            self.sticky = Some(sticky.to_string());
        }
        if let Some(region) = url.param(params::REGION) {
            self.region = Some(region.to_string());
        }
        self
    }
}

/// Client-side invoker: binds an interface to the network through the
/// registry-fed cluster, the route layer, and the interceptor chain.
pub struct Refer {
    key: ServiceKey,
    config: ReferConfig,
    codec: Codec,
    registry: Arc<dyn Registry>,
    cluster: Arc<Cluster>,
    route: Route,
    chain: FilterChain,
    state: Arc<StateSwitch>,
    inflight: Inflight,
    events: EventSender,
    shutdown: Arc<Shutdown>,
    /// Attribute overrides from the registry's configure stream.
    overrides: Arc<RwLock<BTreeMap<String, String>>>,
}

impl Refer {
    /// Builds the binding without subscribing or dialing.
    ///
    /// # Errors
    ///
    /// Fails with `Config` when a named codec, balancer, or filter does not
    /// resolve.
    pub fn new(
        url: &Url,
        config: ReferConfig,
        registry: Arc<dyn Registry>,
        manager: Arc<ChannelManager>,
        shutdown: Arc<Shutdown>,
        plugins: &PluginRegistry,
    ) -> Result<Arc<Self>> {
        Self::with_opener(
            url,
            config,
            registry,
            manager,
            Arc::new(TcpClientTransport),
            shutdown,
            plugins,
        )
    }

    /// Same as [`new`], with a custom transport opener.
    ///
    /// # Errors
    ///
    /// [`new`]: Refer::new
    pub fn with_opener(
        url: &Url,
        config: ReferConfig,
        registry: Arc<dyn Registry>,
        manager: Arc<ChannelManager>,
        opener: Arc<dyn ChannelOpener>,
        shutdown: Arc<Shutdown>,
        plugins: &PluginRegistry,
    ) -> Result<Arc<Self>> {
        let config = config.with_url(url);
        let codec = plugins.codec(&config.serialization)?;
        let balancer = plugins.balancer(&config.loadbalance)?;
        let chain = FilterChain::build(plugins.filters(&config.filters)?);
        let route = Route::new(balancer)
            .with_sticky(config.sticky.clone())
            .with_region(config.region.clone());

        let key = ServiceKey::new(url.interface(), &config.alias);
        let events = event::channel();
        let cluster = Cluster::create(
            key.clone(),
            manager,
            opener,
            events.clone(),
            config.node_drain_timeout,
        );

        Ok(Arc::new(Self {
            key,
            config,
            codec,
            registry,
            cluster,
            route,
            chain,
            state: Arc::new(StateSwitch::default()),
            inflight: Inflight::default(),
            events,
            shutdown,
            overrides: Arc::default(),
        }))
    }

    /// Subscribes to the registry and waits for the binding to become
    /// usable. Idempotent once opened.
    ///
    /// # Errors
    ///
    /// Fails with `Init` when the readiness condition is not met within the
    /// connect timeout, and `Shutdown` after close.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.state.is(InvokerState::Opened) {
            return Ok(());
        }
        if self.shutdown.is_shutting_down() {
            return Err(Error::new(
                ErrorKind::Shutdown,
                "process is shutting down".to_string(),
            ));
        }
        if !self.state.transition(InvokerState::New, InvokerState::Opening) {
            // another caller is opening; wait for its verdict.
            let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
            loop {
                match self.state.state() {
                    InvokerState::Opened => return Ok(()),
                    InvokerState::Opening if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    _ => return Err(Error::kind(ErrorKind::Shutdown)),
                }
            }
        }

        let rx = match self.registry.subscribe_cluster(&self.key).await {
            Ok(rx) => rx,
            Err(e) => {
                self.state
                    .transition(InvokerState::Opening, InvokerState::Closed);
                return Err(Error::new(
                    ErrorKind::Init,
                    format!("subscribe {} failed: {e}", self.key),
                ));
            }
        };
        self.watch_configure().await;
        self.cluster.start(rx);

        match self
            .cluster
            .wait_ready(self.config.open_wait, self.config.connect_timeout)
            .await
        {
            Ok(()) => {
                let hook = {
                    let this = Arc::downgrade(self);
                    move || {
                        let this = this.clone();
                        async move {
                            if let Some(refer) = this.upgrade() {
                                refer.close().await;
                            }
                        }
                    }
                };
                self.shutdown.add_hook("refer", REFER_PRIORITY, hook);

                self.state
                    .transition(InvokerState::Opening, InvokerState::Opened);
                let _ = self.events.send(event::Event::Opened);
                tracing::info!("refer {} opened", self.key);
                Ok(())
            }
            Err(e) => {
                self.cluster.stop().await;
                self.state
                    .transition(InvokerState::Opening, InvokerState::Closed);
                Err(e)
            }
        }
    }

    /// Typed call: encodes the arguments, runs the full pipeline, decodes
    /// the reply.
    ///
    /// # Errors
    pub async fn invoke<Req, Rsp>(&self, method: &str, args: &Req) -> Result<Rsp>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let options = self.config.method_options.get(method);
        let configured = self
            .overrides
            .read()
            .ok()
            .and_then(|overrides| {
                overrides
                    .get(params::TIMEOUT)
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
            });
        let timeout = options
            .and_then(|options| options.timeout)
            .or(configured)
            .unwrap_or(self.config.timeout);

        let mut request = Request::new(
            &self.key.interface,
            &self.key.alias,
            method,
            self.codec,
            args,
            timeout,
        )?;
        if options.is_some_and(|options| options.cache) {
            request
                .attachments
                .insert(CACHE_ATTACHMENT.to_string(), "true".to_string());
        }
        self.invoke_request(request).await.decode()
    }

    /// Untyped call used by generated proxies and gateways; filters see the
    /// outcome before the caller does.
    pub async fn invoke_request(&self, request: Request) -> Response {
        if self.shutdown.is_shutting_down() {
            return Response::error(Error::new(
                ErrorKind::Shutdown,
                "process is shutting down".to_string(),
            ));
        }
        if !self.state.is(InvokerState::Opened) {
            return Response::error(Error::new(
                ErrorKind::Shutdown,
                format!("refer {} is not opened", self.key),
            ));
        }

        let _guard = self.inflight.track();
        let (_, response) = self
            .chain
            .invoke(request, |request| async move {
                let response = self.dispatch(&request).await;
                (request, response)
            })
            .await;
        response
    }

    /// Route, send, await; re-enters the route with the failed node excluded
    /// while the retry budget and the aggregate deadline allow.
    async fn dispatch(&self, request: &Request) -> Response {
        let deadline = tokio::time::Instant::now() + request.timeout;
        let mut attempts_left = self.config.retries;
        let mut excluded: Vec<Url> = Vec::new();

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Response::error(Error::new(
                    ErrorKind::Timeout,
                    "call deadline exhausted".to_string(),
                ));
            }
            let remaining = deadline - now;

            let node = match self
                .route
                .select(&self.cluster.snapshot(), request, &excluded)
            {
                Ok(node) => node,
                Err(e) => {
                    if e.is_retriable() && attempts_left > 0 {
                        attempts_left -= 1;
                        tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
                        continue;
                    }
                    return Response::error(e);
                }
            };
            let Some(channel) = node.channel().filter(crate::channel::Channel::is_open) else {
                excluded.push(node.identity().clone());
                if attempts_left > 0 {
                    attempts_left -= 1;
                    continue;
                }
                return Response::error(Error::new(
                    ErrorKind::TransportClosed,
                    format!("{} has no live channel", node.url()),
                ));
            };

            let attempt_budget = self
                .config
                .attempt_timeout
                .map_or(remaining, |budget| budget.min(remaining));
            let _node_guard = node.inflight().track();
            let receiver =
                match channel.ask(request.to_meta(), request.payload.clone(), attempt_budget) {
                    Ok(receiver) => receiver,
                    Err(e) => {
                        if e.is_retriable() && attempts_left > 0 {
                            excluded.push(node.identity().clone());
                            attempts_left -= 1;
                            continue;
                        }
                        return Response::error(e);
                    }
                };

            match receiver.recv().await {
                Ok(msg) => {
                    let response = Response::from_message(msg);
                    if let Err(e) = &response.result
                        && e.kind == ErrorKind::Retry
                        && attempts_left > 0
                    {
                        excluded.push(node.identity().clone());
                        attempts_left -= 1;
                        continue;
                    }
                    return response;
                }
                Err(e) => {
                    let budget_remains = tokio::time::Instant::now() < deadline;
                    let retriable =
                        e.is_retriable() || (e.kind == ErrorKind::Timeout && budget_remains);
                    if retriable && attempts_left > 0 {
                        excluded.push(node.identity().clone());
                        attempts_left -= 1;
                        continue;
                    }
                    return Response::error(e);
                }
            }
        }
    }

    /// Stops accepting invokes, drains in-flight calls, and releases the
    /// cluster. Safe to call repeatedly.
    pub async fn close(self: &Arc<Self>) {
        if !self
            .state
            .transition(InvokerState::Opened, InvokerState::Closing)
        {
            self.state.transition(InvokerState::New, InvokerState::Closed);
            self.state
                .transition(InvokerState::Opening, InvokerState::Closed);
            return;
        }

        if !self.inflight.drain(self.config.close_timeout).await {
            tracing::warn!(
                "refer {} closing with calls still in flight after {:?}",
                self.key,
                self.config.close_timeout
            );
        }
        // dropping the cluster's stream is the unsubscribe.
        self.cluster.stop().await;
        self.state
            .transition(InvokerState::Closing, InvokerState::Closed);
        let _ = self.events.send(event::Event::Closed);
        tracing::info!("refer {} closed", self.key);
    }

    #[must_use]
    pub fn state(&self) -> InvokerState {
        self.state.state()
    }

    #[must_use]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Live membership view, for metrics and tests.
    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    #[must_use]
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    async fn watch_configure(self: &Arc<Self>) {
        let Ok(mut rx) = self.registry.subscribe_configure(&self.key).await else {
            return;
        };
        let overrides = self.overrides.clone();
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if this.upgrade().is_none() {
                    return;
                }
                if !snapshot.overrides.is_empty() {
                    tracing::info!("applying {} configure overrides", snapshot.overrides.len());
                }
                if let Ok(mut slot) = overrides.write() {
                    *slot = snapshot.overrides;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }
}

impl std::fmt::Debug for Refer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refer")
            .field("key", &self.key.to_string())
            .field("state", &self.state())
            .finish()
    }
}
