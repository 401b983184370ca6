use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU8, Ordering},
};
use std::time::Duration;

use crate::supervisor::TaskSupervisor;

/// Aggregate process liveness, ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HealthState {
    Healthy = 0,
    Exhausted = 1,
    Dead = 2,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthState::Healthy,
            1 => HealthState::Exhausted,
            _ => HealthState::Dead,
        }
    }
}

/// One pluggable health check.
pub trait Doctor: Send + Sync {
    fn name(&self) -> &'static str;

    fn diagnose(&self) -> HealthState;
}

/// Caches the worst verdict across registered doctors.
///
/// A background task re-diagnoses on a fixed period so readers never pay for
/// the checks; `state` is a single atomic load.
pub struct HealthProbe {
    state: AtomicU8,
    doctors: RwLock<Vec<Arc<dyn Doctor>>>,
    supervisor: TaskSupervisor,
}

impl HealthProbe {
    #[must_use]
    pub fn create(period: Duration) -> Arc<Self> {
        let probe = Arc::new(Self {
            state: AtomicU8::new(HealthState::Healthy as u8),
            doctors: RwLock::new(Vec::new()),
            supervisor: TaskSupervisor::create(),
        });

        let guard = probe.supervisor.start_task();
        tokio::spawn({
            let probe = probe.clone();
            async move {
                let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
                loop {
                    tokio::select! {
                        () = guard.stopped() => return,
                        _ = ticker.tick() => {
                            let state = probe.diagnose();
                            probe.state.store(state as u8, Ordering::Release);
                        }
                    }
                }
            }
        });

        probe
    }

    pub fn register(&self, doctor: Arc<dyn Doctor>) {
        if let Ok(mut doctors) = self.doctors.write() {
            doctors.push(doctor);
        }
    }

    /// Cached verdict from the last diagnosis round.
    #[must_use]
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Runs every doctor now, short-circuiting on the first `Dead`.
    #[must_use]
    pub fn diagnose(&self) -> HealthState {
        let Ok(doctors) = self.doctors.read() else {
            return HealthState::Dead;
        };
        let mut worst = HealthState::Healthy;
        for doctor in doctors.iter() {
            let state = doctor.diagnose();
            if state > worst {
                worst = state;
            }
            if worst == HealthState::Dead {
                tracing::warn!("doctor {} reports dead", doctor.name());
                break;
            }
        }
        worst
    }

    pub fn stop(&self) {
        self.supervisor.stop();
    }
}
