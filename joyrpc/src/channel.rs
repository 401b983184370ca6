use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    error::{Error, ErrorKind, Result},
    msg::{self, Message, MsgFlags, MsgMeta},
    supervisor::TaskSupervisor,
    timewheel::TimeWheel,
    waiter::{CallReceiver, Waiter},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ChannelConfig {
    /// Largest payload accepted for one frame, in bytes.
    #[serde_inline_default(8 << 20)]
    pub payload_limit: usize,
    /// Send-queue high watermark; `ask` fails with `SendFull` beyond it.
    #[serde_inline_default(1024)]
    pub send_queue: usize,
    /// In-flight request cap per channel.
    #[serde_inline_default(8192)]
    pub pending_limit: usize,
    /// Most queued frames coalesced into one write.
    #[serde_inline_default(64)]
    pub write_batch: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap_or(
            Self {
                payload_limit: 8 << 20,
                send_queue: 1024,
                pending_limit: 8192,
                write_batch: 64,
            },
        )
    }
}

impl ChannelConfig {
    /// Applies per-address overrides carried on the url.
    #[must_use]
    pub fn with_url(mut self, url: &crate::url::Url) -> Self {
        if let Some(payload) = url.param(crate::url::params::PAYLOAD)
            && let Ok(payload) = payload.parse()
        {
            self.payload_limit = payload;
        }
        self
    }
}

/// Server-side sink for decoded request frames.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, channel: Channel, msg: Message);
}

pub(crate) struct ChannelOptions {
    pub id: u64,
    pub remote: SocketAddr,
    pub server: bool,
    pub config: ChannelConfig,
    pub wheel: Arc<TimeWheel>,
    pub handler: Option<Arc<dyn RequestHandler>>,
}

struct ChannelInner {
    id: u64,
    remote: SocketAddr,
    server: bool,
    payload_limit: usize,
    write_batch: usize,
    sender: mpsc::Sender<Bytes>,
    waiter: Arc<Waiter>,
    wheel: Arc<TimeWheel>,
    epoch: tokio::time::Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
    heartbeat_seq: AtomicU64,
    last_pong: AtomicU64,
    pong_notify: tokio::sync::Notify,
    drained: AtomicBool,
    close_token: CancellationToken,
    supervisor: TaskSupervisor,
}

/// One duplex connection multiplexing many requests.
///
/// The channel is the only writer to its connection: every outgoing frame
/// goes through one bounded queue consumed by a single send loop, so send
/// order equals wire order. Incoming frames are dispatched to the matching
/// pending call, the heartbeat state, or the server-side request handler.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn spawn<R, W>(options: ChannelOptions, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(options.config.send_queue);
        let inner = Arc::new(ChannelInner {
            id: options.id,
            remote: options.remote,
            server: options.server,
            payload_limit: options.config.payload_limit,
            write_batch: options.config.write_batch,
            sender,
            waiter: Arc::new(Waiter::with_capacity(options.config.pending_limit)),
            wheel: options.wheel,
            epoch: tokio::time::Instant::now(),
            last_read: AtomicU64::default(),
            last_write: AtomicU64::default(),
            heartbeat_seq: AtomicU64::default(),
            last_pong: AtomicU64::default(),
            pong_notify: tokio::sync::Notify::new(),
            drained: AtomicBool::default(),
            close_token: CancellationToken::new(),
            supervisor: TaskSupervisor::create(),
        });
        let channel = Self { inner };

        let guard = channel.inner.supervisor.start_task();
        tokio::spawn({
            let channel = channel.clone();
            async move {
                let mut writer = writer;
                let mut receiver = receiver;
                tokio::select! {
                    () = guard.stopped() => {
                        // flush frames already accepted before going away.
                        channel.flush_pending_writes(&mut writer, &mut receiver).await;
                    }
                    result = channel.send_loop(&mut writer, &mut receiver) => {
                        if let Err(e) = result {
                            channel.close(e);
                        }
                    }
                }
            }
        });

        let guard = channel.inner.supervisor.start_task();
        tokio::spawn({
            let channel = channel.clone();
            let handler = options.handler;
            async move {
                tokio::select! {
                    () = guard.stopped() => {}
                    result = channel.recv_loop(reader, handler) => {
                        if let Err(e) = result {
                            channel.close(e);
                        }
                    }
                }
            }
        });

        channel
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.inner.server
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.close_token.is_cancelled()
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.waiter.len()
    }

    /// Time since the last byte was read or written.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self
            .inner
            .last_read
            .load(Ordering::Acquire)
            .max(self.inner.last_write.load(Ordering::Acquire));
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Resolves once the channel is closed.
    #[must_use]
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.inner.close_token.clone().cancelled_owned()
    }

    /// Submits a request frame and returns its completion handle.
    ///
    /// The request id is allocated here; the deadline is armed on the shared
    /// timing wheel rather than a per-call timer.
    ///
    /// # Errors
    ///
    /// `TransportClosed` when the channel is not open, `OverPayload` when the
    /// payload exceeds the channel cap, `Overload` when the in-flight cap is
    /// reached, and `SendFull` when the send queue is at its high watermark.
    pub fn ask(&self, mut meta: MsgMeta, payload: Bytes, timeout: Duration) -> Result<CallReceiver> {
        self.check_sendable(&payload)?;

        let (msgid, receiver) = self.inner.waiter.alloc()?;
        meta.msgid = msgid;
        meta.flags |= MsgFlags::IsReq;
        let frame = msg::encode_frame(&meta, &payload)?;

        self.inner.wheel.schedule(timeout, &self.inner.waiter, msgid);
        self.enqueue(frame)
            .map_err(|e| e.with_correlation(self.inner.id, msgid))?;
        Ok(receiver)
    }

    /// Submits a one-way frame (response or heartbeat).
    ///
    /// # Errors
    pub fn tell(&self, meta: MsgMeta, payload: Bytes) -> Result<()> {
        self.check_sendable(&payload)?;
        let frame = msg::encode_frame(&meta, &payload)?;
        self.enqueue(frame)
    }

    /// Sends one heartbeat ping and waits for its pong.
    ///
    /// Pings use a dedicated sequence space and a distinct frame type, so
    /// they never occupy a request-id slot reserved for user calls.
    ///
    /// # Errors
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let seq = self.inner.heartbeat_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let meta = MsgMeta {
            msgid: seq,
            flags: MsgFlags::Heartbeat | MsgFlags::IsReq,
            ..MsgMeta::default()
        };
        self.tell(meta, Bytes::new())?;

        let wait = async {
            loop {
                let notified = self.inner.pong_notify.notified();
                if self.inner.last_pong.load(Ordering::Acquire) >= seq {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::new(ErrorKind::Timeout, "heartbeat timed out".to_string())
                .with_correlation(self.inner.id, seq)
        })
    }

    /// Closes the channel and fails every pending call with `error`.
    /// Idempotent and reentrant; later calls are noops.
    pub fn close(&self, error: Error) {
        if self.inner.drained.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            "closing channel {} to {}: {error}",
            self.inner.id,
            self.inner.remote
        );
        self.inner.close_token.cancel();
        self.inner.supervisor.stop();
        self.inner.waiter.drain(&error, self.inner.id);
    }

    fn check_sendable(&self, payload: &Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(
                ErrorKind::TransportClosed,
                "channel is closed".to_string(),
            )
            .with_correlation(self.inner.id, 0));
        }
        if payload.len() > self.inner.payload_limit {
            return Err(Error::new(
                ErrorKind::OverPayload,
                format!(
                    "payload {} exceeds cap {}",
                    payload.len(),
                    self.inner.payload_limit
                ),
            ));
        }
        Ok(())
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        match self.inner.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::new(
                ErrorKind::SendFull,
                "send queue high watermark reached".to_string(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::new(
                ErrorKind::TransportClosed,
                "send loop has stopped".to_string(),
            )),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.inner.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn flush_pending_writes<W>(&self, writer: &mut W, receiver: &mut mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        receiver.close();
        while let Ok(frame) = receiver.try_recv() {
            if writer.write_all(&frame).await.is_err() {
                return;
            }
        }
        let _ = writer.flush().await;
    }

    /// Sole writer to the connection. Waits for one frame, then drains
    /// whatever else is already queued (up to the configured batch) into a
    /// single write, so bursts do not pay one syscall per frame.
    async fn send_loop<W>(&self, writer: &mut W, receiver: &mut mpsc::Receiver<Bytes>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let batch = self.inner.write_batch.max(1);
        let mut buffer = BytesMut::new();
        loop {
            let Some(frame) = receiver.recv().await else {
                return Ok(());
            };

            if receiver.is_empty() {
                writer.write_all(&frame).await?;
            } else {
                buffer.clear();
                buffer.extend_from_slice(&frame);
                let mut coalesced = 1;
                while coalesced < batch {
                    match receiver.try_recv() {
                        Ok(next) => {
                            buffer.extend_from_slice(&next);
                            coalesced += 1;
                        }
                        Err(_) => break,
                    }
                }
                writer.write_all(&buffer).await?;
            }
            self.inner
                .last_write
                .store(self.now_ms(), Ordering::Release);
        }
    }

    async fn recv_loop<R>(&self, mut reader: R, handler: Option<Arc<dyn RequestHandler>>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(1 << 20);
        loop {
            if let Some(frame) = msg::split_frame(&mut buffer)? {
                let msg = Message::parse(frame)?;
                self.dispatch(msg, handler.as_ref()).await;
            } else {
                let n = reader.read_buf(&mut buffer).await?;
                if n == 0 {
                    return Err(Error::new(
                        ErrorKind::TransportClosed,
                        "connection eof".to_string(),
                    ));
                }
                self.inner.last_read.store(self.now_ms(), Ordering::Release);
            }
        }
    }

    async fn dispatch(&self, msg: Message, handler: Option<&Arc<dyn RequestHandler>>) {
        let meta = &msg.meta;
        if meta.is_heartbeat() {
            if meta.is_req() {
                let pong = MsgMeta {
                    msgid: meta.msgid,
                    flags: MsgFlags::Heartbeat | MsgFlags::IsRsp,
                    ..MsgMeta::default()
                };
                let _ = self.tell(pong, Bytes::new());
            } else {
                self.inner.last_pong.fetch_max(meta.msgid, Ordering::AcqRel);
                self.inner.pong_notify.notify_waiters();
            }
        } else if meta.is_rsp() {
            self.inner.waiter.post(meta.msgid, msg);
        } else if meta.is_req() {
            if let Some(handler) = handler {
                handler.on_request(self.clone(), msg).await;
            } else {
                tracing::warn!(
                    "channel {} dropped a request frame without a handler",
                    self.inner.id
                );
            }
        } else {
            tracing::warn!("channel {} received invalid flags {:?}", self.inner.id, meta.flags);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("server", &self.inner.server)
            .field("open", &self.is_open())
            .finish()
    }
}
