use crate::bbswitch::{BbswitchClient, PowerSwitchError};
use crate::config::MonitorConfig;
use crate::data::{BusId, GpuSnapshot, MonitorState};
use crate::format::{format_memory, format_power, format_temperature, format_utilization};
use crate::pci::{read_power_state, PciDevices, PowerState, PowerStateError};
use crate::process::{self, TerminateError};
use crate::reconcile::ProcessTable;
use crate::scheduler::{MonitorEvent, MonitorScheduler, Observer};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Banner {
    Info(String),
    Warning(String),
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryPoint {
    pub at: f64,
    pub utilization: f64,
    pub temperature: f64,
    pub power_percent: Option<f64>,
}

// Everything the window draws, already formatted
#[derive(Clone, Debug)]
pub struct MonitorView {
    pub temperature: String,
    pub power: String,
    pub memory: String,
    pub utilization: String,
    pub modules: Vec<String>,
    pub banner: Option<Banner>,
    pub processes: ProcessTable,
    pub history: VecDeque<HistoryPoint>,
    pub has_data: bool,
    history_seconds: f64,
}

impl MonitorView {
    pub fn new(history_seconds: f64) -> Self {
        Self {
            temperature: String::new(),
            power: String::new(),
            memory: String::new(),
            utilization: String::new(),
            modules: Vec::new(),
            banner: None,
            processes: ProcessTable::default(),
            history: VecDeque::new(),
            has_data: false,
            history_seconds,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.history_seconds);
    }

    pub fn apply(&mut self, event: MonitorEvent, at: f64) {
        match event {
            MonitorEvent::DataUpdate(snapshot) => self.update(&snapshot, at),
            MonitorEvent::TransientInfo(message) => self.banner = Some(Banner::Info(message)),
            MonitorEvent::EscalatedWarning(message) => self.banner = Some(Banner::Warning(message)),
            MonitorEvent::Stopped => {}
        }
    }

    fn update(&mut self, snapshot: &GpuSnapshot, at: f64) {
        self.banner = None;
        self.has_data = true;
        self.temperature = format_temperature(snapshot.temperature);
        self.power = format_power(snapshot.power_draw, snapshot.power_limit);
        self.memory = format_memory(snapshot.memory_used, snapshot.memory_total);
        self.utilization = format_utilization(snapshot.utilization);
        self.modules = snapshot.modules.clone();
        self.processes.sync(&snapshot.processes);

        self.history.push_back(HistoryPoint {
            at,
            utilization: snapshot.utilization as f64,
            temperature: snapshot.temperature as f64,
            power_percent: (snapshot.power_limit > 0.0)
                .then(|| snapshot.power_draw / snapshot.power_limit * 100.0),
        });
        let window_start = at - self.history_seconds;
        while self.history.front().is_some_and(|point| point.at < window_start) {
            self.history.pop_front();
        }
    }

    pub fn module_list(&self) -> String {
        self.modules
            .iter()
            .map(|module| format!("• {}", module))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct SwitchOutcome {
    enabled: bool,
    result: Result<(), PowerSwitchError>,
    at: Instant,
}

/// Ties the power state of the GPU to the monitor and keeps the view current.
pub struct Session {
    scheduler: MonitorScheduler,
    pci: PciDevices,
    bbswitch_path: PathBuf,
    device_index: usize,
    events_tx: Sender<MonitorEvent>,
    events: Receiver<MonitorEvent>,
    wake: Arc<dyn Fn() + Send + Sync>,
    power: Option<PowerState>,
    client: BbswitchClient,
    switch_tx: Sender<SwitchOutcome>,
    switches: Receiver<SwitchOutcome>,
    switch: Option<JoinHandle<()>>,
    switched_on_at: Option<Instant>,
    switch_error: Option<String>,
    gpu_title: String,
    vendor: Option<String>,
    started: Instant,
    view: MonitorView,
}

impl Session {
    /// `wake` is called from the polling task after each event is queued.
    pub fn new(
        scheduler: MonitorScheduler,
        config: &MonitorConfig,
        wake: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (events_tx, events) = unbounded();
        let (switch_tx, switches) = unbounded();
        Self {
            scheduler,
            pci: PciDevices::new(&config.sysfs_pci_path, &config.pci_ids_path),
            bbswitch_path: config.bbswitch_path.clone(),
            device_index: config.device_index,
            events_tx,
            events,
            wake,
            power: None,
            client: BbswitchClient::new(&config.bbswitchd_socket, config.switch_timeout()),
            switch_tx,
            switches,
            switch: None,
            switched_on_at: None,
            switch_error: None,
            gpu_title: String::new(),
            vendor: None,
            started: Instant::now(),
            view: MonitorView::new(config.history_seconds),
        }
    }

    pub fn view(&self) -> &MonitorView {
        &self.view
    }

    pub fn gpu_title(&self) -> &str {
        &self.gpu_title
    }

    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn power(&self) -> Option<&PowerState> {
        self.power.as_ref()
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.scheduler.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.scheduler.last_error()
    }

    pub fn switch_error(&self) -> Option<&str> {
        self.switch_error.as_deref()
    }

    pub fn switch_in_progress(&self) -> bool {
        self.switch.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Asks bbswitchd for its status, which makes it load bbswitch.
    pub fn ping_daemon(&self) {
        let client = self.client.clone();
        self.scheduler.runtime().spawn(async move {
            if let Err(e) = client.send_command("status").await {
                log::warn!("bbswitchd at {}: {}", client.socket_path().display(), e);
            }
        });
    }

    /// Starts switching the GPU power; a second request cancels a pending one.
    pub fn request_power(&mut self, enabled: bool) {
        if let Some(task) = self.switch.take() {
            if !task.is_finished() {
                log::info!("Power switch cancelled");
                task.abort();
                return;
            }
        }

        self.switch_error = None;
        let client = self.client.clone();
        let outcomes = self.switch_tx.clone();
        let wake = Arc::clone(&self.wake);
        self.switch = Some(self.scheduler.runtime().spawn(async move {
            let result = client.set_gpu_state(enabled).await;
            let outcome = SwitchOutcome {
                enabled,
                result,
                at: Instant::now(),
            };
            if outcomes.send(outcome).is_ok() {
                wake();
            }
        }));
    }

    fn finish_switch(&mut self, outcome: SwitchOutcome) {
        match outcome.result {
            Ok(()) => {
                log::info!("GPU switched {}", if outcome.enabled { "ON" } else { "OFF" });
                self.switched_on_at = outcome.enabled.then_some(outcome.at);
            }
            Err(e) => {
                log::error!("{}", e);
                self.switch_error = Some(format!("Failed to switch power state: {}", e));
                self.refresh_power();
            }
        }
    }

    /// Re-reads the power state and starts or stops monitoring on changes.
    pub fn refresh_power(&mut self) {
        match read_power_state(&self.bbswitch_path) {
            Ok(state) => self.observe_power(state),
            Err(PowerStateError::Read(..)) if self.power.is_none() => {
                // no bbswitch: assume the configured GPU is simply on
                match self.pci.resolve_bus_id(self.device_index) {
                    Some(bus_id) => {
                        log::info!("bbswitch not available, monitoring {}", bus_id);
                        self.observe_power(PowerState { bus_id, enabled: true });
                    }
                    None => self.fail(format!("No NVIDIA GPU at index {}", self.device_index)),
                }
            }
            Err(PowerStateError::Read(..)) => {}
            Err(e) => self.fail(e.to_string()),
        }
    }

    pub fn observe_power(&mut self, state: PowerState) {
        let previous = self.power.replace(state.clone());
        if previous.as_ref() == Some(&state) {
            return;
        }

        let switched_on_at = self.switched_on_at.take();
        self.restart_view(&state.bus_id);
        if state.enabled {
            // power-on time is known for switches made here or seen happening
            let enable_at = switched_on_at.or_else(|| {
                previous
                    .filter(|previous| previous.bus_id == state.bus_id && !previous.enabled)
                    .map(|_| Instant::now())
            });
            log::debug!("Adapter {} is ON", state.bus_id);
            self.scheduler.start(state.bus_id, enable_at, self.observer());
        } else {
            log::debug!("Adapter {} is OFF", state.bus_id);
        }
    }

    fn restart_view(&mut self, bus_id: &BusId) {
        self.scheduler.stop();
        // events of the previous run must not land in the fresh view
        while self.events.try_recv().is_ok() {}
        self.view.reset();

        let name = self.pci.gpu_name(bus_id);
        self.gpu_title = name.title(bus_id);
        self.vendor = name.vendor;
    }

    fn fail(&mut self, message: String) {
        if self.view.banner.as_ref() == Some(&Banner::Error(message.clone())) {
            return;
        }
        log::error!("{}", message);
        // the next good read is a change, whatever it says
        self.power = None;
        self.scheduler.stop();
        while self.events.try_recv().is_ok() {}
        self.view.reset();
        self.view.banner = Some(Banner::Error(message));
    }

    fn observer(&self) -> Observer {
        let events = self.events_tx.clone();
        let wake = Arc::clone(&self.wake);
        Arc::new(move |event| {
            if events.send(event).is_ok() {
                wake();
            }
        })
    }

    /// Folds queued monitor events into the view.
    pub fn pump(&mut self) -> usize {
        while let Ok(outcome) = self.switches.try_recv() {
            self.finish_switch(outcome);
        }

        let at = self.started.elapsed().as_secs_f64();
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.view.apply(event, at);
            applied += 1;
        }
        applied
    }

    pub fn toggle(&mut self, pid: u32) {
        self.view.processes.toggle(pid);
    }

    pub fn toggle_all(&mut self) {
        self.view.processes.toggle_all();
    }

    /// Sends SIGKILL to every selected process.
    pub fn kill_selected(&self) -> Vec<TerminateError> {
        self.view
            .processes
            .selected_pids()
            .into_iter()
            .filter_map(|pid| {
                log::info!("Killing process {}", pid);
                process::terminate(pid).err()
            })
            .collect()
    }

    pub fn shutdown(&self) {
        if let Some(bus_id) = self.scheduler.bus_id() {
            log::debug!("Stopping monitor of {}", bus_id);
        }
        if let Some(task) = &self.switch {
            task.abort();
        }
        self.scheduler.stop();
    }
}
