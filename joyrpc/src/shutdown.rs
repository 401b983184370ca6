use std::{
    future::Future,
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio_util::sync::CancellationToken;

/// Hooks registered without an explicit priority run last.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Consumers unbind before providers so callers stop sending first.
pub const REFER_PRIORITY: i32 = 10;
pub const EXPORTER_PRIORITY: i32 = 20;

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HookFn = Box<dyn Fn() -> HookFuture + Send + Sync>;

struct Hook {
    name: String,
    priority: i32,
    run: HookFn,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ShutdownConfig {
    /// Global deadline for the whole hook pipeline.
    #[serde_inline_default(Duration::from_secs(15))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap_or(Self {
                timeout: Duration::from_secs(15),
            })
    }
}

/// Coordinates graceful process termination.
///
/// Hooks are grouped by priority: groups run serially in ascending priority
/// order, members of one group run concurrently. A global deadline bounds the
/// pipeline; groups that miss it are started anyway and left to finish in the
/// background.
///
/// Constructed explicitly and passed by reference so parallel tests never
/// share one coordinator.
pub struct Shutdown {
    config: ShutdownConfig,
    hooks: Mutex<Vec<Hook>>,
    shutting: AtomicBool,
    done: CancellationToken,
}

impl Shutdown {
    #[must_use]
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            hooks: Mutex::new(Vec::new()),
            shutting: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    /// Registers a hook; append-safe from any task until shutdown starts.
    /// Hooks added afterwards never run.
    pub fn add_hook<F, Fut>(&self, name: &str, priority: i32, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook = Hook {
            name: name.to_string(),
            priority,
            run: Box::new(move || Box::pin(hook())),
        };
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(hook);
        }
    }

    /// Readable by every component so new work can be refused early.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting.load(Ordering::Acquire)
    }

    /// Runs the hook pipeline once; concurrent and repeated calls wait for
    /// the first one to finish.
    pub async fn shutdown(&self) {
        if self.shutting.swap(true, Ordering::AcqRel) {
            self.done.cancelled().await;
            return;
        }

        tracing::info!("shutdown: running hooks");
        let mut hooks = self
            .hooks
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        hooks.sort_by_key(|hook| hook.priority);

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut hooks = hooks.into_iter().peekable();
        while let Some(first) = hooks.next() {
            let priority = first.priority;
            let mut group = vec![first];
            while let Some(hook) = hooks.next_if(|h| h.priority == priority) {
                group.push(hook);
            }

            let names: Vec<_> = group.iter().map(|h| h.name.clone()).collect();
            let handles: Vec<_> = group
                .into_iter()
                .map(|hook| tokio::spawn((hook.run)()))
                .collect();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let wait = async {
                for handle in handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(remaining, wait).await.is_err() {
                tracing::warn!(
                    "shutdown: hook group {priority} ({names:?}) missed the deadline, moving on"
                );
            }
        }

        tracing::info!("shutdown: complete");
        self.done.cancel();
    }

    /// Runs the pipeline when the process receives an interrupt signal.
    pub fn listen_signals(self: &std::sync::Arc<Self>) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.shutdown().await;
            }
        });
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("shutting", &self.is_shutting_down())
            .finish()
    }
}
