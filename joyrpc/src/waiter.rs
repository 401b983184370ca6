use std::sync::{Arc, atomic::AtomicU64};

use foldhash::fast::RandomState;
use tokio::sync::oneshot;

use crate::{
    error::{Error, ErrorKind, Result},
    msg::Message,
};

/// Pending-call table for one channel.
///
/// Correlates request ids with their completion handles. Removal is the only
/// way to complete an entry, so completing twice is a noop; a response or a
/// timeout for an id that is no longer present is silently dropped.
pub struct Waiter {
    index: AtomicU64,
    id_map: dashmap::DashMap<u64, oneshot::Sender<Result<Message>>, RandomState>,
    capacity: usize,
}

/// RAII cleanup for one pending entry.
///
/// Dropping the receiver (caller cancelled or gave up) removes the id from
/// the table, so cancellation never leaks the id slot.
#[derive(Debug)]
pub struct CallGuard {
    waiter: Arc<Waiter>,
    msgid: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.waiter.remove(self.msgid);
    }
}

/// Completion handle returned by [`Waiter::alloc`].
#[derive(Debug)]
pub struct CallReceiver {
    rx: oneshot::Receiver<Result<Message>>,
    _guard: CallGuard,
}

impl CallReceiver {
    /// Resolves with the response, or with the error the entry was failed
    /// with (timeout, channel close).
    ///
    /// # Errors
    pub async fn recv(self) -> Result<Message> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::TransportClosed,
                "completion handle dropped".to_string(),
            )),
        }
    }
}

impl Waiter {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: AtomicU64::default(),
            id_map: dashmap::DashMap::default(),
            capacity,
        }
    }

    /// Allocates a request id and its completion handle.
    ///
    /// Ids already present in the table are skipped, so an id is recycled
    /// only after its entry was removed.
    ///
    /// # Errors
    ///
    /// Fails with `Overload` when the in-flight cap is reached.
    pub fn alloc(self: &Arc<Self>) -> Result<(u64, CallReceiver)> {
        if self.id_map.len() >= self.capacity {
            return Err(Error::new(
                ErrorKind::Overload,
                format!("in-flight cap {} reached", self.capacity),
            ));
        }

        loop {
            let msgid = self
                .index
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match self.id_map.entry(msgid) {
                dashmap::Entry::Occupied(_) => {}
                dashmap::Entry::Vacant(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.insert(tx);
                    return Ok((
                        msgid,
                        CallReceiver {
                            rx,
                            _guard: CallGuard {
                                waiter: self.clone(),
                                msgid,
                            },
                        },
                    ));
                }
            }
        }
    }

    /// Completes the entry with a response. Unknown ids are logged and
    /// discarded; they never destabilize the channel.
    pub fn post(&self, msgid: u64, msg: Message) {
        if let Some((_, tx)) = self.id_map.remove(&msgid) {
            let _ = tx.send(Ok(msg));
        } else {
            tracing::warn!("discarding response for unknown request id {msgid}");
        }
    }

    /// Fails the entry. A noop when the entry already completed, which makes
    /// timer expiry after a response harmless.
    pub fn fail(&self, msgid: u64, error: Error) {
        if let Some((_, tx)) = self.id_map.remove(&msgid) {
            let _ = tx.send(Err(error));
        }
    }

    /// Fails every pending entry in ascending id order.
    pub fn drain(&self, error: &Error, channel_id: u64) {
        let mut ids: Vec<u64> = self.id_map.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        for msgid in ids {
            self.fail(msgid, error.clone().with_correlation(channel_id, msgid));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }

    fn remove(&self, msgid: u64) {
        self.id_map.remove(&msgid);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.len())
            .finish()
    }
}
