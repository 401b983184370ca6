use std::{
    future::Future,
    hash::BuildHasher,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use foldhash::fast::RandomState;

use crate::{
    error::{Error, ErrorKind, Result},
    request::{Request, Response},
};

/// Attachment that opts a request into the result cache.
pub const CACHE_ATTACHMENT: &str = "cache";
/// Attachment carrying the per-call trace id.
pub const TRACE_ATTACHMENT: &str = "trace.id";

/// Ordered, idempotent call interceptor.
///
/// `on_request` runs on the way out and may short-circuit with a synthetic
/// response; `on_response` runs on the way back and observes every outcome,
/// errors included. Ordering is by `priority`, ties broken by name.
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        100
    }

    async fn on_request(&self, request: &mut Request) -> Result<Option<Response>> {
        let _ = request;
        Ok(None)
    }

    async fn on_response(&self, request: &Request, response: &mut Response) -> Result<()> {
        let _ = (request, response);
        Ok(())
    }
}

/// Immutable interceptor pipeline around one invoker.
///
/// Built once per open; a reopen rebuilds it. The terminal network stage is
/// supplied per call, so the same chain serves both invoker sides.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    #[must_use]
    pub fn build(mut filters: Vec<Arc<dyn Filter>>) -> Self {
        filters.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self { filters }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs the request through every filter, the terminal stage, and the
    /// response hooks of the filters that were entered, innermost first.
    ///
    /// A short-circuit or pre-hook error skips the terminal stage but still
    /// unwinds through the filters already passed, so every entered filter
    /// observes the outcome.
    pub async fn invoke<F, Fut>(&self, mut request: Request, terminal: F) -> (Request, Response)
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = (Request, Response)> + Send,
    {
        let mut entered = self.filters.len();
        let mut early: Option<Response> = None;
        for (index, filter) in self.filters.iter().enumerate() {
            match filter.on_request(&mut request).await {
                Ok(None) => {}
                Ok(Some(response)) => {
                    early = Some(response);
                    entered = index;
                    break;
                }
                Err(error) => {
                    early = Some(Response::error(error));
                    entered = index;
                    break;
                }
            }
        }

        let (request, mut response) = match early {
            Some(response) => (request, response),
            None => terminal(request).await,
        };

        for filter in self.filters[..entered].iter().rev() {
            if let Err(error) = filter.on_response(&request, &mut response).await {
                tracing::warn!("filter {} failed on response: {error}", filter.name());
                response = Response::error(error);
            }
        }
        (request, response)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Attaches a trace id and logs the outcome of every call.
#[derive(Default)]
pub struct TraceFilter {
    counter: AtomicU64,
    hasher: RandomState,
}

#[async_trait::async_trait]
impl Filter for TraceFilter {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn priority(&self) -> i32 {
        -100
    }

    async fn on_request(&self, request: &mut Request) -> Result<Option<Response>> {
        if !request.attachments.contains_key(TRACE_ATTACHMENT) {
            let seq = self.counter.fetch_add(1, Ordering::AcqRel);
            let id = self.hasher.hash_one((seq, &request.method));
            request
                .attachments
                .insert(TRACE_ATTACHMENT.to_string(), format!("{id:016x}"));
        }
        Ok(None)
    }

    async fn on_response(&self, request: &Request, response: &mut Response) -> Result<()> {
        match &response.result {
            Ok(_) => tracing::debug!(
                "call {}.{} ok, trace {}",
                request.service,
                request.method,
                request
                    .attachments
                    .get(TRACE_ATTACHMENT)
                    .map_or("-", String::as_str)
            ),
            Err(error) => tracing::debug!(
                "call {}.{} failed with {}, trace {}",
                request.service,
                request.method,
                error.kind.code(),
                request
                    .attachments
                    .get(TRACE_ATTACHMENT)
                    .map_or("-", String::as_str)
            ),
        }
        Ok(())
    }
}

/// Caps calls concurrently past this point of the chain.
pub struct LimitFilter {
    max: i64,
    active: AtomicI64,
}

impl LimitFilter {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max: i64::try_from(max).unwrap_or(i64::MAX),
            active: AtomicI64::default(),
        }
    }
}

#[async_trait::async_trait]
impl Filter for LimitFilter {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn priority(&self) -> i32 {
        -50
    }

    async fn on_request(&self, _request: &mut Request) -> Result<Option<Response>> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        if now > self.max {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Ok(Some(Response::error(Error::new(
                ErrorKind::Overload,
                format!("concurrency limit {} reached", self.max),
            ))));
        }
        Ok(None)
    }

    async fn on_response(&self, _request: &Request, _response: &mut Response) -> Result<()> {
        self.active.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Serves repeated reads from a bounded-lifetime result cache.
///
/// Only requests carrying `cache=true` participate; the invoker sets the
/// attachment from the method options.
pub struct CacheFilter {
    ttl: Duration,
    hasher: RandomState,
    entries: dashmap::DashMap<u64, (tokio::time::Instant, bytes::Bytes, crate::codec::Codec)>,
}

impl CacheFilter {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            hasher: RandomState::default(),
            entries: dashmap::DashMap::new(),
        }
    }

    fn key(&self, request: &Request) -> u64 {
        self.hasher.hash_one((
            &request.service,
            &request.alias,
            &request.method,
            request.payload.as_ref(),
        ))
    }

    fn cacheable(request: &Request) -> bool {
        request
            .attachments
            .get(CACHE_ATTACHMENT)
            .is_some_and(|v| v == "true")
    }
}

#[async_trait::async_trait]
impl Filter for CacheFilter {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn on_request(&self, request: &mut Request) -> Result<Option<Response>> {
        if !Self::cacheable(request) {
            return Ok(None);
        }
        let key = self.key(request);
        if let Some(entry) = self.entries.get(&key) {
            let (stored_at, payload, codec) = entry.value();
            if stored_at.elapsed() < self.ttl {
                let mut response = Response::ok(payload.clone().into(), *codec);
                response
                    .attachments
                    .insert("cache.hit".to_string(), "true".to_string());
                return Ok(Some(response));
            }
        }
        self.entries.remove(&key);
        Ok(None)
    }

    async fn on_response(&self, request: &Request, response: &mut Response) -> Result<()> {
        if Self::cacheable(request)
            && let Ok(payload) = &response.result
        {
            self.entries.insert(
                self.key(request),
                (
                    tokio::time::Instant::now(),
                    bytes::Bytes::copy_from_slice(payload),
                    response.codec,
                ),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::codec::Codec;
    use crate::msg::Payload;

    fn request() -> Request {
        Request::new(
            "io.joyrpc.Echo",
            "",
            "echo",
            Codec::Json,
            &"abc".to_string(),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    struct Recorder {
        tag: &'static str,
        prio: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Filter for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn priority(&self) -> i32 {
            self.prio
        }

        async fn on_request(&self, _request: &mut Request) -> Result<Option<Response>> {
            self.log.lock().unwrap().push(format!("pre-{}", self.tag));
            Ok(None)
        }

        async fn on_response(&self, _request: &Request, _response: &mut Response) -> Result<()> {
            self.log.lock().unwrap().push(format!("post-{}", self.tag));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chain_orders_by_priority_then_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::build(vec![
            Arc::new(Recorder { tag: "b", prio: 10, log: log.clone() }),
            Arc::new(Recorder { tag: "a", prio: 10, log: log.clone() }),
            Arc::new(Recorder { tag: "z", prio: -10, log: log.clone() }),
        ]);
        assert_eq!(chain.names(), ["z", "a", "b"]);

        let (_, response) = chain
            .invoke(request(), |req| async move {
                (req, Response::ok(Payload::Empty, Codec::Json))
            })
            .await;
        assert!(response.is_ok());
        assert_eq!(
            *log.lock().unwrap(),
            ["pre-z", "pre-a", "pre-b", "post-b", "post-a", "post-z"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_unwinds_entered_filters_only() {
        struct Blocker;

        #[async_trait::async_trait]
        impl Filter for Blocker {
            fn name(&self) -> &'static str {
                "blocker"
            }

            async fn on_request(&self, _request: &mut Request) -> Result<Option<Response>> {
                Ok(Some(Response::error(Error::kind(ErrorKind::Overload))))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::build(vec![
            Arc::new(Recorder { tag: "outer", prio: 0, log: log.clone() }),
            Arc::new(Blocker),
        ]);

        let reached_terminal = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = reached_terminal.clone();
        let (_, response) = chain
            .invoke(request(), |req| async move {
                flag.store(true, Ordering::Release);
                (req, Response::ok(Payload::Empty, Codec::Json))
            })
            .await;
        assert!(!reached_terminal.load(Ordering::Acquire));
        assert_eq!(response.result.unwrap_err().kind, ErrorKind::Overload);
        assert_eq!(*log.lock().unwrap(), ["pre-outer", "post-outer"]);
    }

    #[tokio::test]
    async fn test_filters_observe_errors_from_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::build(vec![Arc::new(Recorder {
            tag: "watch",
            prio: 0,
            log: log.clone(),
        })]);

        let (_, response) = chain
            .invoke(request(), |req| async move {
                (req, Response::error(Error::kind(ErrorKind::Timeout)))
            })
            .await;
        assert_eq!(response.result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(*log.lock().unwrap(), ["pre-watch", "post-watch"]);
    }

    #[tokio::test]
    async fn test_limit_filter_sheds_excess_load() {
        let limit = Arc::new(LimitFilter::new(1));
        let chain = Arc::new(FilterChain::build(vec![limit]));

        let slow = {
            let chain = chain.clone();
            tokio::spawn(async move {
                chain
                    .invoke(request(), |req| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        (req, Response::ok(Payload::Empty, Codec::Json))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_, shed) = chain
            .invoke(request(), |req| async move {
                (req, Response::ok(Payload::Empty, Codec::Json))
            })
            .await;
        assert_eq!(shed.result.unwrap_err().kind, ErrorKind::Overload);

        let (_, slow) = slow.await.unwrap();
        assert!(slow.is_ok());

        // the permit was returned; the next call passes.
        let (_, ok) = chain
            .invoke(request(), |req| async move {
                (req, Response::ok(Payload::Empty, Codec::Json))
            })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_cache_filter_serves_fresh_hits() {
        let chain = FilterChain::build(vec![Arc::new(CacheFilter::new(Duration::from_secs(5)))]);
        let calls = Arc::new(AtomicU64::default());

        let mut cached = request();
        cached
            .attachments
            .insert(CACHE_ATTACHMENT.to_string(), "true".to_string());

        for round in 0..3 {
            let calls = calls.clone();
            let (_, response) = chain
                .invoke(cached.clone(), |req| async move {
                    calls.fetch_add(1, Ordering::AcqRel);
                    let payload = Codec::Json.encode(&"fresh".to_string()).unwrap();
                    (req, Response::ok(payload.into(), Codec::Json))
                })
                .await;
            let value: String = response.decode().unwrap();
            assert_eq!(value, "fresh", "round {round}");
        }
        assert_eq!(calls.load(Ordering::Acquire), 1);

        // requests without the attachment bypass the cache.
        let calls2 = calls.clone();
        let (_, _response) = chain
            .invoke(request(), |req| async move {
                calls2.fetch_add(1, Ordering::AcqRel);
                (req, Response::ok(Payload::Empty, Codec::Json))
            })
            .await;
        assert_eq!(calls.load(Ordering::Acquire), 2);
    }
}
