//! # JoyRPC - A Registry-Driven RPC Runtime
//!
//! JoyRPC binds service interfaces to the network: a [`Refer`] is the
//! client-side binding that invokes remote methods as if they were local,
//! an [`Exporter`] is the server-side binding that publishes an
//! implementation. Both stay alive through registry changes and connection
//! failures, preserving request/response ordering and at-most-one delivery
//! per call.
//!
//! ## Features
//!
//! - **Registry-fed clustering**: providers advertise through a pluggable
//!   registry; consumers track versioned snapshots with warm-up, eviction,
//!   and automatic re-admission.
//! - **Shared channels**: one framed TCP connection per endpoint,
//!   multiplexing requests behind a pooled [`ChannelManager`] with
//!   heartbeat-driven liveness and reconnect backoff.
//! - **Interceptor chain**: prioritized filters around every call on both
//!   sides, with short-circuiting for caches and limiters.
//! - **Coordinated shutdown**: priority-grouped hooks drain invokers before
//!   the process exits.
//! - **Multiple serialization formats**: JSON and MessagePack per message.
//!
//! ## Export a Service
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use joyrpc::{Exporter, ExporterConfig, MemoryRegistry, PluginRegistry,
//!              Service, Shutdown, ShutdownConfig, Url};
//!
//! #[tokio::main]
//! async fn main() -> joyrpc::Result<()> {
//!     let mut service = Service::new("io.joyrpc.Echo");
//!     service.method("echo", |req: String| async move {
//!         Ok(req.chars().rev().collect::<String>())
//!     });
//!
//!     let registry = Arc::new(MemoryRegistry::new());
//!     let shutdown = Arc::new(Shutdown::new(ShutdownConfig::default()));
//!     let plugins = PluginRegistry::with_builtins();
//!
//!     let url = Url::parse("joyrpc://0.0.0.0:22000/io.joyrpc.Echo?alias=prod")?;
//!     let exporter = Exporter::new(
//!         url,
//!         ExporterConfig::default(),
//!         vec![service],
//!         registry,
//!         shutdown.clone(),
//!         &plugins,
//!     )?;
//!     let addr = exporter.open().await?;
//!     println!("serving on {addr}");
//!     shutdown.listen_signals();
//!     Ok(())
//! }
//! ```
//!
//! ## Invoke It
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use joyrpc::{ChannelManager, ManagerConfig, MemoryRegistry, PluginRegistry,
//!              Refer, ReferConfig, Shutdown, ShutdownConfig, Url};
//!
//! #[tokio::main]
//! async fn main() -> joyrpc::Result<()> {
//!     let registry = Arc::new(MemoryRegistry::new());
//!     let shutdown = Arc::new(Shutdown::new(ShutdownConfig::default()));
//!     let plugins = PluginRegistry::with_builtins();
//!     let manager = ChannelManager::create(ManagerConfig::default());
//!
//!     let url = Url::parse("joyrpc://consumer:0/io.joyrpc.Echo?alias=prod")?;
//!     let refer = Refer::new(&url, ReferConfig::default(), registry, manager,
//!                            shutdown, &plugins)?;
//!     refer.open().await?;
//!     let reply: String = refer.invoke("echo", &"abc".to_string()).await?;
//!     println!("echo: {reply}");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

/// Error types and the crate-wide result alias.
mod error;
pub use error::{Error, ErrorKind, Result};

/// Canonical service address and its typed parameter views.
mod url;
pub use url::{Url, params};

/// Frame metadata, flags, and the wire framing helpers.
mod msg;
pub use msg::{Message, MsgFlags, MsgMeta, Payload};

/// Payload serialization formats.
mod codec;
pub use codec::Codec;

/// Named-extension lookup shared by both invoker sides.
mod plugin;
pub use plugin::PluginRegistry;

/// Task lifecycle tracking and in-flight call draining.
mod supervisor;
pub use supervisor::{Inflight, InflightGuard, TaskGuard, TaskSupervisor};

/// Single-shot lifecycle switch for invokers.
mod switch;
pub use switch::{InvokerState, StateSwitch};

/// Lifecycle event stream consumed by metrics.
mod event;
pub use event::{Event, EventReceiver, EventSender, drain_events};

/// Priority-grouped graceful termination.
mod shutdown;
pub use shutdown::{
    DEFAULT_PRIORITY, EXPORTER_PRIORITY, REFER_PRIORITY, Shutdown, ShutdownConfig,
};

/// Pending-call table per channel.
mod waiter;
pub use waiter::{CallReceiver, Waiter};

/// Bulk deadline expiry for pending calls.
mod timewheel;
pub use timewheel::TimeWheel;

/// One duplex connection multiplexing many requests.
mod channel;
pub use channel::{Channel, ChannelConfig, RequestHandler};

/// Shared channel pool with reference counting and reconnect backoff.
mod channel_manager;
pub use channel_manager::{ChannelManager, ChannelOpener, ManagerConfig};

/// Per-channel liveness probing.
mod heartbeat;
pub use heartbeat::{HeartbeatConfig, HeartbeatMode};

/// Framed TCP client and server transports.
mod tcp;
pub use tcp::{TcpClientTransport, TcpServerTransport};

/// Discovery contract and the in-memory reference registry.
mod registry;
pub use registry::{ClusterSnapshot, ConfigSnapshot, MemoryRegistry, Registry, ServiceKey};

/// One provider endpoint with connection state.
mod node;
pub use node::{Node, NodeState};

/// Live provider set per service.
mod cluster;
pub use cluster::{Cluster, OpenWait};

/// Node selection strategies.
mod loadbalance;
pub use loadbalance::{LeastActive, LoadBalance, RoundRobin, WeightedRandom};

/// Address filtering, sticky rules, and balancer composition.
mod route;
pub use route::Route;

/// Call interceptors and the chain around every invoker.
mod filter;
pub use filter::{
    CACHE_ATTACHMENT, CacheFilter, Filter, FilterChain, LimitFilter, TRACE_ATTACHMENT, TraceFilter,
};

/// Per-method options and the published interface surface.
mod descriptor;
pub use descriptor::{InterfaceDescriptor, MethodOptions};

/// Outbound call model shared by filters and transports.
mod request;
pub use request::{Request, Response};

/// Server-side invoker.
mod exporter;
pub use exporter::{ExecutorConfig, Exporter, ExporterConfig, RejectionPolicy, Service};

/// Client-side invoker.
mod refer;
pub use refer::{Refer, ReferConfig};

/// Aggregate process liveness from pluggable doctors.
mod health;
pub use health::{Doctor, HealthProbe, HealthState};
