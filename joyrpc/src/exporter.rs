use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use tokio::sync::Semaphore;

use crate::{
    channel::{Channel, ChannelConfig, RequestHandler},
    codec::Codec,
    descriptor::{InterfaceDescriptor, MethodOptions},
    error::{Error, ErrorKind, Result},
    event::{self, EventReceiver, EventSender},
    filter::FilterChain,
    msg::{Message, MsgFlags, MsgMeta},
    plugin::PluginRegistry,
    registry::Registry,
    request::{Request, Response},
    shutdown::{EXPORTER_PRIORITY, Shutdown},
    supervisor::Inflight,
    switch::{InvokerState, StateSwitch},
    tcp::{self, TcpServerTransport},
    url::{Url, params},
};

/// What happens to a request when the business executor is saturated.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RejectionPolicy {
    /// Fail fast with an overload error.
    #[default]
    Reject,
    /// Run on the channel's receive task, applying backpressure to reads.
    CallerRuns,
    /// Wait up to the configured bound for a worker, then reject.
    WaitBounded,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ExecutorConfig {
    /// Concurrent business calls across all channels.
    #[serde_inline_default(256)]
    pub workers: usize,
    #[serde(default)]
    pub policy: RejectionPolicy,
    /// Acquire budget under `WaitBounded`.
    #[serde_inline_default(Duration::from_millis(100))]
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap_or(
            Self {
                workers: 256,
                policy: RejectionPolicy::Reject,
                wait: Duration::from_millis(100),
            },
        )
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ExporterConfig {
    #[serde_inline_default(String::new())]
    pub alias: String,
    #[serde_inline_default(100)]
    pub weight: u32,
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// Defers the transport bind after `open`.
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Drain deadline for in-flight calls on close.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Grace between deregistration and socket close.
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub offline_timeout: Duration,
    #[serde_inline_default(true)]
    pub gracefully_shutdown: bool,
    /// Server-side guard for methods without their own timeout.
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub method_include: Vec<String>,
    #[serde(default)]
    pub method_exclude: Vec<String>,
    #[serde_inline_default(vec!["trace".to_string()])]
    pub filters: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap_or_else(|_| unreachable!("empty object satisfies every default"))
    }
}

impl ExporterConfig {
    /// Applies overrides carried on the provider url.
    #[must_use]
    pub fn with_url(mut self, url: &Url) -> Self {
        self.alias = url.string_param(params::ALIAS, &self.alias);
        self.weight = url.u32_param(params::WEIGHT, self.weight);
        self.warmup = url.duration_param(params::WARMUP, self.warmup);
        self.delay = url.duration_param(params::DELAY, self.delay);
        self.shutdown_timeout = url.duration_param(params::SHUTDOWN_TIMEOUT, self.shutdown_timeout);
        self.offline_timeout = url.duration_param(params::OFFLINE_TIMEOUT, self.offline_timeout);
        self.gracefully_shutdown =
            url.bool_param(params::GRACEFULLY_SHUTDOWN, self.gracefully_shutdown);
        let include = url.list_param(params::METHOD_INCLUDE);
        if !include.is_empty() {
            self.method_include = include;
        }
        let exclude = url.list_param(params::METHOD_EXCLUDE);
        if !exclude.is_empty() {
            self.method_exclude = exclude;
        }
        self
    }
}

type MethodFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;
type MethodHandler = Box<dyn Fn(Bytes, Codec) -> MethodFuture + Send + Sync>;

/// One interface implementation being published: typed method handlers plus
/// the descriptor built from them.
pub struct Service {
    descriptor: InterfaceDescriptor,
    handlers: HashMap<String, MethodHandler, RandomState>,
}

impl Service {
    #[must_use]
    pub fn new(interface: &str) -> Self {
        Self {
            descriptor: InterfaceDescriptor::new(interface),
            handlers: HashMap::default(),
        }
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.descriptor.interface
    }

    /// Publishes a method with default options.
    pub fn method<Req, Rsp, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        self.method_with(name, MethodOptions::default(), f)
    }

    /// Publishes a method with explicit per-method options.
    pub fn method_with<Req, Rsp, F, Fut>(
        &mut self,
        name: &str,
        options: MethodOptions,
        f: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: MethodHandler = Box::new(move |payload: Bytes, codec: Codec| {
            let f = f.clone();
            Box::pin(async move {
                let args: Req = codec.decode(&payload)?;
                let reply = f(args).await?;
                codec.encode(&reply)
            })
        });
        self.descriptor.insert(name, options);
        self.handlers.insert(name.to_string(), handler);
        self
    }
}

struct ServiceDef {
    descriptor: InterfaceDescriptor,
    handlers: HashMap<String, MethodHandler, RandomState>,
}

struct DispatcherInner {
    services: HashMap<(String, String), ServiceDef, RandomState>,
    chain: FilterChain,
    permits: Arc<Semaphore>,
    executor: ExecutorConfig,
    inflight: Inflight,
    state: Arc<StateSwitch>,
    shutdown: Arc<Shutdown>,
    call_timeout: Duration,
}

/// Server-side request pipeline: locate the descriptor, run the filter
/// chain, dispatch to the implementation on the business executor, reply.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    fn reply(channel: &Channel, req_meta: &MsgMeta, response: Response) {
        let mut flags = MsgFlags::IsRsp | response.codec.flags();
        let payload = match &response.result {
            Ok(payload) => Bytes::from(payload.clone()),
            Err(error) => {
                flags |= MsgFlags::IsError;
                response.codec.encode(error).unwrap_or_default()
            }
        };
        let meta = MsgMeta {
            msgid: req_meta.msgid,
            flags,
            attachments: response.attachments.clone(),
            ..MsgMeta::default()
        };
        if let Err(e) = channel.tell(meta, payload) {
            tracing::warn!(
                "failed to send response for request {} on channel {}: {e}",
                req_meta.msgid,
                channel.id()
            );
        }
    }

    async fn handle(&self, msg: Message) -> Response {
        let codec = Codec::from_flags(msg.meta.flags);
        let request = Request {
            service: msg.meta.service.clone(),
            alias: msg.meta.alias.clone(),
            method: msg.meta.method.clone(),
            attachments: msg.meta.attachments.clone(),
            payload: msg.payload.into(),
            codec,
            timeout: self.inner.call_timeout,
        };

        let inner = &self.inner;
        let (_, response) = inner
            .chain
            .invoke(request, |req| async move {
                let response = inner.call(&req).await;
                (req, response)
            })
            .await;
        response
    }
}

impl DispatcherInner {
    async fn call(&self, request: &Request) -> Response {
        let key = (request.service.clone(), request.alias.clone());
        let Some(def) = self.services.get(&key) else {
            return Response::error(Error::new(
                ErrorKind::NoSuchAlias,
                format!("{}/{} is not exported", request.service, request.alias),
            ));
        };
        let Some(handler) = def.handlers.get(&request.method) else {
            return Response::error(Error::new(
                ErrorKind::NoSuchMethod,
                format!("{}.{} is not published", request.service, request.method),
            ));
        };

        let options = def.descriptor.get(&request.method).cloned().unwrap_or_default();
        if options.validation && request.payload.is_empty() {
            return Response::error(Error::new(
                ErrorKind::Remote,
                format!("validation failed: {} requires arguments", request.method),
            ));
        }

        let budget = options.timeout.unwrap_or(self.call_timeout);
        match tokio::time::timeout(budget, handler(request.payload.clone(), request.codec)).await {
            Ok(Ok(payload)) => Response::ok(payload.into(), request.codec),
            Ok(Err(error)) => Response::error(error),
            Err(_) => Response::error(Error::new(
                ErrorKind::Timeout,
                format!("{} exceeded the {budget:?} execution budget", request.method),
            )),
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Dispatcher {
    async fn on_request(&self, channel: Channel, msg: Message) {
        let inner = &self.inner;
        if inner.shutdown.is_shutting_down() || inner.state.state() != InvokerState::Opened {
            Self::reply(
                &channel,
                &msg.meta,
                Response::error(Error::new(
                    ErrorKind::Shutdown,
                    "provider is shutting down".to_string(),
                )),
            );
            return;
        }

        let permit = match inner.executor.policy {
            RejectionPolicy::Reject => match inner.permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    Self::reply(
                        &channel,
                        &msg.meta,
                        Response::error(Error::new(
                            ErrorKind::Overload,
                            "business executor saturated".to_string(),
                        )),
                    );
                    return;
                }
            },
            RejectionPolicy::WaitBounded => {
                match tokio::time::timeout(
                    inner.executor.wait,
                    inner.permits.clone().acquire_owned(),
                )
                .await
                {
                    Ok(Ok(permit)) => Some(permit),
                    _ => {
                        Self::reply(
                            &channel,
                            &msg.meta,
                            Response::error(Error::new(
                                ErrorKind::Overload,
                                format!(
                                    "no worker available within {:?}",
                                    inner.executor.wait
                                ),
                            )),
                        );
                        return;
                    }
                }
            }
            // saturation runs the call on the receive task, so reads stall
            // and the peer feels the pressure.
            RejectionPolicy::CallerRuns => inner.permits.clone().try_acquire_owned().ok(),
        };

        // the in-flight guard covers sending the reply, so a graceful drain
        // never closes the socket under a queued response.
        match permit {
            Some(permit) => {
                let this = self.clone();
                let guard = inner.inflight.track();
                tokio::spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let meta = msg.meta.clone();
                    let response = this.handle(msg).await;
                    Self::reply(&channel, &meta, response);
                });
            }
            None => {
                let _guard = inner.inflight.track();
                let meta = msg.meta.clone();
                let response = self.handle(msg).await;
                Self::reply(&channel, &meta, response);
            }
        }
    }
}

struct ExporterDoctor {
    state: Arc<StateSwitch>,
    permits: Arc<Semaphore>,
}

impl crate::health::Doctor for ExporterDoctor {
    fn name(&self) -> &'static str {
        "exporter"
    }

    fn diagnose(&self) -> crate::health::HealthState {
        if self.state.state() >= InvokerState::Closing {
            crate::health::HealthState::Dead
        } else if self.permits.available_permits() == 0 {
            crate::health::HealthState::Exhausted
        } else {
            crate::health::HealthState::Healthy
        }
    }
}

/// Server-side invoker: binds published services to a server transport and
/// keeps the registry in sync with the binding's lifecycle.
pub struct Exporter {
    base_url: Url,
    config: ExporterConfig,
    dispatcher: Dispatcher,
    interfaces: Vec<String>,
    transport: Arc<TcpServerTransport>,
    registry: Arc<dyn Registry>,
    state: Arc<StateSwitch>,
    events: EventSender,
    shutdown: Arc<Shutdown>,
    bound: Mutex<Option<SocketAddr>>,
    registered: Mutex<Vec<Url>>,
}

impl Exporter {
    /// Builds the binding without touching the network.
    ///
    /// # Errors
    ///
    /// Fails with `Config` on an empty service list, an unsupported url
    /// parameter, a filter name that does not resolve, or include/exclude
    /// lists that strip an interface of every method.
    pub fn new(
        url: Url,
        config: ExporterConfig,
        services: Vec<Service>,
        registry: Arc<dyn Registry>,
        shutdown: Arc<Shutdown>,
        plugins: &PluginRegistry,
    ) -> Result<Arc<Self>> {
        if services.is_empty() {
            return Err(Error::new(
                ErrorKind::Config,
                "an exporter needs at least one service".to_string(),
            ));
        }
        if url.bool_param(params::SSL_ENABLE, false) {
            return Err(Error::new(
                ErrorKind::Config,
                "ssl is not supported by the tcp transport".to_string(),
            ));
        }
        let config = config.with_url(&url);

        let mut table: HashMap<(String, String), ServiceDef, RandomState> = HashMap::default();
        let mut interfaces = Vec::with_capacity(services.len());
        for service in services {
            let interface = service.interface().to_string();
            let mut descriptor = InterfaceDescriptor::new(&interface);
            let mut handlers: HashMap<String, MethodHandler, RandomState> = HashMap::default();
            for (name, handler) in service.handlers {
                let included = config.method_include.is_empty()
                    || config.method_include.contains(&name);
                if !included || config.method_exclude.contains(&name) {
                    continue;
                }
                let options = service.descriptor.get(&name).cloned().unwrap_or_default();
                descriptor.insert(&name, options);
                handlers.insert(name, handler);
            }
            if handlers.is_empty() {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("no methods exported for {interface}"),
                ));
            }
            interfaces.push(interface.clone());
            table.insert(
                (interface, config.alias.clone()),
                ServiceDef { descriptor, handlers },
            );
        }

        let chain = FilterChain::build(plugins.filters(&config.filters)?);
        let state = Arc::new(StateSwitch::default());
        let permits = Arc::new(Semaphore::new(config.executor.workers.max(1)));
        let dispatcher = Dispatcher {
            inner: Arc::new(DispatcherInner {
                services: table,
                chain,
                permits,
                executor: config.executor.clone(),
                inflight: Inflight::default(),
                state: state.clone(),
                shutdown: shutdown.clone(),
                call_timeout: config.call_timeout,
            }),
        };

        Ok(Arc::new(Self {
            transport: TcpServerTransport::create(config.channel.clone()),
            base_url: url,
            config,
            dispatcher,
            interfaces,
            registry,
            state,
            events: event::channel(),
            shutdown,
            bound: Mutex::new(None),
            registered: Mutex::new(Vec::new()),
        }))
    }

    /// Binds the transport, self-checks it, registers the providers, and
    /// moves the invoker to OPENED. Idempotent once opened.
    ///
    /// # Errors
    pub async fn open(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.state.is(InvokerState::Opened)
            && let Some(addr) = self.addr()
        {
            return Ok(addr);
        }
        if self.shutdown.is_shutting_down() {
            return Err(Error::new(
                ErrorKind::Shutdown,
                "process is shutting down".to_string(),
            ));
        }
        if !self.state.transition(InvokerState::New, InvokerState::Opening) {
            return match self.state.state() {
                InvokerState::Opened => self.addr().ok_or_else(|| {
                    Error::new(ErrorKind::Init, "opened without a bound address".to_string())
                }),
                InvokerState::Opening => Err(Error::new(
                    ErrorKind::Init,
                    "open already in progress".to_string(),
                )),
                _ => Err(Error::kind(ErrorKind::Shutdown)),
            };
        }

        if !self.config.delay.is_zero() {
            tracing::info!("delaying export by {:?}", self.config.delay);
            tokio::time::sleep(self.config.delay).await;
        }

        let result = self.bind_and_register().await;
        match result {
            Ok(addr) => {
                let hook = {
                    let this = Arc::downgrade(self);
                    move || {
                        let this = this.clone();
                        async move {
                            if let Some(exporter) = this.upgrade() {
                                exporter.close().await;
                            }
                        }
                    }
                };
                self.shutdown.add_hook("exporter", EXPORTER_PRIORITY, hook);

                self.state
                    .transition(InvokerState::Opening, InvokerState::Opened);
                let _ = self.events.send(event::Event::Opened);
                tracing::info!("exported {:?} on {addr}", self.interfaces);
                Ok(addr)
            }
            Err(e) => {
                self.transport.stop().await;
                self.state
                    .transition(InvokerState::Opening, InvokerState::Closed);
                Err(e)
            }
        }
    }

    async fn bind_and_register(self: &Arc<Self>) -> Result<SocketAddr> {
        let bind_addr: SocketAddr = format!("{}:{}", self.base_url.host(), self.base_url.port())
            .parse()
            .map_err(|_| {
                Error::new(
                    ErrorKind::Config,
                    format!("cannot bind to `{}`", self.base_url.endpoint()),
                )
            })?;
        let addr = self
            .transport
            .listen(bind_addr, Arc::new(self.dispatcher.clone()))
            .await?;
        if let Ok(mut bound) = self.bound.lock() {
            *bound = Some(addr);
        }

        // registration happens only after the transport answers end to end.
        tcp::probe_endpoint(addr, self.transport.wheel(), Duration::from_secs(3)).await?;

        let urls = self.provider_urls(addr);
        for (index, url) in urls.iter().enumerate() {
            if let Err(e) = self.registry.register(url).await {
                // roll back the providers already advertised.
                for url in &urls[..index] {
                    let _ = self.registry.deregister(url).await;
                }
                return Err(e);
            }
        }
        if let Ok(mut registered) = self.registered.lock() {
            *registered = urls;
        }
        Ok(addr)
    }

    /// Stops accepting, drains in-flight calls, deregisters, then closes the
    /// sockets. Safe to call repeatedly.
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

        self.transport.stop_accepting();
        if self.config.gracefully_shutdown
            && !self
                .dispatcher
                .inner
                .inflight
                .drain(self.config.shutdown_timeout)
                .await
        {
            tracing::warn!(
                "closing with calls still in flight after {:?}",
                self.config.shutdown_timeout
            );
        }

        // clients must see the providers vanish before the sockets do.
        let registered = self
            .registered
            .lock()
            .map(|mut urls| std::mem::take(&mut *urls))
            .unwrap_or_default();
        for url in &registered {
            if let Err(e) = self.registry.deregister(url).await {
                tracing::warn!("deregister {url} failed: {e}");
            }
        }
        if !self.config.offline_timeout.is_zero() {
            tokio::time::sleep(self.config.offline_timeout).await;
        }

        self.transport.stop().await;
        self.state
            .transition(InvokerState::Closing, InvokerState::Closed);
        let _ = self.events.send(event::Event::Closed);
    }

    #[must_use]
    pub fn state(&self) -> InvokerState {
        self.state.state()
    }

    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|bound| *bound)
    }

    #[must_use]
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Health check reporting executor saturation and lifecycle death.
    #[must_use]
    pub fn doctor(&self) -> Arc<dyn crate::health::Doctor> {
        Arc::new(ExporterDoctor {
            state: self.state.clone(),
            permits: self.dispatcher.inner.permits.clone(),
        })
    }

    fn provider_urls(&self, addr: SocketAddr) -> Vec<Url> {
        self.interfaces
            .iter()
            .map(|interface| {
                let mut url = Url::new(
                    self.base_url.scheme(),
                    self.base_url.host(),
                    addr.port(),
                    interface,
                );
                for (key, value) in self.base_url.params() {
                    url = url.with_param(key, value);
                }
                url.with_param(params::ALIAS, &self.config.alias)
                    .with_param(params::WEIGHT, &self.config.weight.to_string())
                    .with_param(
                        params::WARMUP,
                        &self.config.warmup.as_millis().to_string(),
                    )
            })
            .collect()
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("interfaces", &self.interfaces)
            .field("state", &self.state())
            .field("addr", &self.addr())
            .finish()
    }
}
