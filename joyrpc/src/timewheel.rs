use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use crate::{
    error::{Error, ErrorKind},
    supervisor::TaskSupervisor,
    waiter::Waiter,
};

struct Entry {
    rounds: u32,
    waiter: Weak<Waiter>,
    msgid: u64,
}

/// Hashed timing wheel expiring call deadlines in bulk.
///
/// One wheel serves every channel of a transport; deadlines are bucketed to
/// tick granularity instead of arming one timer per call. Entries hold a weak
/// reference to their pending table, so a closed channel costs nothing to
/// expire.
pub struct TimeWheel {
    slots: Vec<Mutex<Vec<Entry>>>,
    tick: Duration,
    cursor: AtomicUsize,
    supervisor: TaskSupervisor,
}

impl TimeWheel {
    /// Spawns the ticker task; the wheel stops when dropped or on [`stop`].
    ///
    /// [`stop`]: TimeWheel::stop
    #[must_use]
    pub fn create(tick: Duration, slots: usize) -> Arc<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let slots = slots.max(2);
        let wheel = Arc::new(Self {
            slots: (0..slots).map(|_| Mutex::default()).collect(),
            tick,
            cursor: AtomicUsize::default(),
            supervisor: TaskSupervisor::create(),
        });

        let guard = wheel.supervisor.start_task();
        tokio::spawn({
            let wheel = wheel.clone();
            async move {
                let mut interval = tokio::time::interval(wheel.tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = guard.stopped() => break,
                        _ = interval.tick() => wheel.advance(),
                    }
                }
            }
        });

        wheel
    }

    /// Schedules a timeout for a pending entry. Expiry fails the entry with
    /// `Timeout`; entries that completed earlier are unaffected.
    pub fn schedule(&self, delay: Duration, waiter: &Arc<Waiter>, msgid: u64) {
        let ticks = delay
            .as_nanos()
            .div_ceil(self.tick.as_nanos())
            .max(1) as usize;
        let cursor = self.cursor.load(Ordering::Acquire);
        let index = (cursor + ticks) % self.slots.len();
        let rounds = ((ticks - 1) / self.slots.len()) as u32;

        if let Ok(mut slot) = self.slots[index].lock() {
            slot.push(Entry {
                rounds,
                waiter: Arc::downgrade(waiter),
                msgid,
            });
        }
    }

    pub fn stop(&self) {
        self.supervisor.stop();
    }

    fn advance(&self) {
        let cursor = (self.cursor.load(Ordering::Acquire) + 1) % self.slots.len();
        self.cursor.store(cursor, Ordering::Release);

        let Ok(mut slot) = self.slots[cursor].lock() else {
            return;
        };
        slot.retain_mut(|entry| {
            if entry.rounds > 0 {
                entry.rounds -= 1;
                return true;
            }
            if let Some(waiter) = entry.waiter.upgrade() {
                waiter.fail(
                    entry.msgid,
                    Error::new(ErrorKind::Timeout, "deadline elapsed".to_string()),
                );
            }
            false
        });
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TimeWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWheel")
            .field("tick", &self.tick)
            .field("slots", &self.slots.len())
            .finish()
    }
}
