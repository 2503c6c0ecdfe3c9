//! Polling loop that turns sampler results into monitor events.
//!
//! Every `start` spawns one task on the runtime and bumps a generation
//! counter. A tick result is only delivered while its generation is current
//! and the state is `Polling`, so nothing from an older run reaches the
//! observer once `stop` has returned. Sampler calls are serialized per
//! scheduler: a new run waits for a call left behind by an aborted one.
//! Delivery and `stop` share a re-entrant
//! lock: another thread calling `stop` waits for the callback in progress,
//! while the callback itself may call `stop` or `start` freely.

use crate::data::{BusId, GpuSnapshot, MonitorState};
use crate::monitor::{DeviceSampler, SamplerError};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

pub const LOADING_MESSAGE: &str = "Loading NVIDIA kernel modules...";
pub const NOT_LOADED_MESSAGE: &str = "NVIDIA kernel modules not loaded";

#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    DataUpdate(GpuSnapshot),
    TransientInfo(String),
    EscalatedWarning(String),
    Stopped,
}

pub type Observer = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollTiming {
    pub interval: Duration,
    pub grace_period: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum Verdict {
    Update(GpuSnapshot),
    Loading,
    Quiet(String),
    Escalate(String),
}

// `elapsed` is None when the power-on time is unknown
fn classify(
    outcome: Result<Option<GpuSnapshot>, SamplerError>,
    elapsed: Option<Duration>,
    grace_period: Duration,
) -> Verdict {
    let within_grace = elapsed.is_some_and(|elapsed| elapsed < grace_period);
    match outcome {
        Ok(Some(snapshot)) => Verdict::Update(snapshot),
        Ok(None) if within_grace => Verdict::Loading,
        Ok(None) => Verdict::Escalate(NOT_LOADED_MESSAGE.to_string()),
        Err(e) if within_grace => Verdict::Quiet(e.to_string()),
        Err(e) => Verdict::Escalate(e.to_string()),
    }
}

struct Inner {
    state: MonitorState,
    generation: u64,
    bus_id: Option<BusId>,
    observer: Option<Observer>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct Shared {
    delivery: ReentrantMutex<()>,
    inner: Mutex<Inner>,
    // held by the blocking sampler call, which outlives an aborted run
    sampling: Arc<AsyncMutex<()>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.state == MonitorState::Polling
    }

    // Returns whether the run should keep polling
    fn dispatch(&self, generation: u64, verdict: Verdict) -> bool {
        let _delivery = self.delivery.lock();
        let observer = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != MonitorState::Polling {
                return false;
            }
            match &verdict {
                Verdict::Quiet(message) => inner.last_error = Some(message.clone()),
                Verdict::Escalate(message) => {
                    inner.last_error = Some(message.clone());
                    inner.state = MonitorState::Degraded;
                }
                Verdict::Update(_) | Verdict::Loading => {}
            }
            inner.observer.clone()
        };
        let Some(observer) = observer else {
            return false;
        };

        match verdict {
            Verdict::Update(snapshot) => observer(MonitorEvent::DataUpdate(snapshot)),
            Verdict::Loading => observer(MonitorEvent::TransientInfo(LOADING_MESSAGE.to_string())),
            Verdict::Quiet(message) => {
                log::debug!("Sampler failed within grace period: {}", message);
            }
            Verdict::Escalate(message) => {
                log::warn!("Giving up on GPU monitoring: {}", message);
                observer(MonitorEvent::EscalatedWarning(message));
                self.shutdown(Some(generation));
                return false;
            }
        }
        self.is_current(generation)
    }

    // `generation` is Some for the self-stop issued by a tick of that run
    fn shutdown(&self, generation: Option<u64>) {
        let _delivery = self.delivery.lock();
        let (observer, task) = {
            let mut inner = self.inner.lock();
            if generation.is_some_and(|generation| generation != inner.generation) {
                return;
            }
            match inner.state {
                MonitorState::Stopped => return,
                MonitorState::Idle => {
                    inner.state = MonitorState::Stopped;
                    return;
                }
                MonitorState::Polling | MonitorState::Degraded => {}
            }
            inner.state = MonitorState::Stopped;
            inner.generation += 1;
            (inner.observer.take(), inner.task.take())
        };

        // a self-stopping task is already on its way out
        if generation.is_none() {
            if let Some(task) = task {
                task.abort();
            }
        }
        log::info!("GPU monitoring stopped");
        if let Some(observer) = observer {
            observer(MonitorEvent::Stopped);
        }
    }
}

/// Periodic GPU poller with a startup grace period.
///
/// Cloning yields another handle to the same scheduler, which is how an
/// observer gets to stop the run that is calling it.
#[derive(Clone)]
pub struct MonitorScheduler {
    shared: Arc<Shared>,
    sampler: Arc<dyn DeviceSampler>,
    runtime: Handle,
    timing: PollTiming,
}

impl MonitorScheduler {
    pub fn new(runtime: Handle, sampler: Arc<dyn DeviceSampler>, timing: PollTiming) -> Self {
        Self {
            shared: Arc::new(Shared {
                delivery: ReentrantMutex::new(()),
                inner: Mutex::new(Inner {
                    state: MonitorState::Idle,
                    generation: 0,
                    bus_id: None,
                    observer: None,
                    task: None,
                    last_error: None,
                }),
                sampling: Arc::new(AsyncMutex::new(())),
            }),
            sampler,
            runtime,
            timing,
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn state(&self) -> MonitorState {
        self.shared.inner.lock().state
    }

    pub fn bus_id(&self) -> Option<BusId> {
        self.shared.inner.lock().bus_id.clone()
    }

    /// Most recent sampler failure of the current or last run.
    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Starts polling `bus_id`, replacing any run in progress.
    ///
    /// The first poll is issued right away. `enable_at` is the moment the GPU
    /// was powered on; without it the grace period counts as already over.
    pub fn start(&self, bus_id: BusId, enable_at: Option<Instant>, observer: Observer) {
        let _delivery = self.shared.delivery.lock();
        self.shared.shutdown(None);

        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        inner.state = MonitorState::Polling;
        inner.bus_id = Some(bus_id.clone());
        inner.observer = Some(observer);
        inner.last_error = None;
        log::info!("GPU monitoring started for {}", bus_id);

        let task = poll_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.sampler),
            bus_id,
            enable_at,
            self.timing,
            inner.generation,
        );
        inner.task = Some(self.runtime.spawn(task));
    }

    /// Stops polling. Idempotent, and safe to call from the observer.
    pub fn stop(&self) {
        self.shared.shutdown(None);
    }
}

async fn poll_loop(
    shared: Arc<Shared>,
    sampler: Arc<dyn DeviceSampler>,
    bus_id: BusId,
    enable_at: Option<Instant>,
    timing: PollTiming,
    generation: u64,
) {
    let mut ticker = time::interval(timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let tick_at = ticker.tick().await;
        if !shared.is_current(generation) {
            break;
        }

        let permit = Arc::clone(&shared.sampling).lock_owned().await;
        if !shared.is_current(generation) {
            break;
        }
        let outcome = {
            let sampler = Arc::clone(&sampler);
            let bus_id = bus_id.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                sampler.sample(&bus_id)
            })
            .await
        }
        .unwrap_or_else(|e| Err(SamplerError::Failed(e.to_string())));

        let elapsed = enable_at.map(|enabled| tick_at.saturating_duration_since(enabled));
        let verdict = classify(outcome, elapsed, timing.grace_period);
        if !shared.dispatch(generation, verdict) {
            break;
        }
    }
    log::debug!("Polling task for {} finished", bus_id);
}
