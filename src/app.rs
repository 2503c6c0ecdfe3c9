use crate::config::MonitorConfig;
use crate::data::MonitorState;
use crate::scheduler::MonitorScheduler;
use crate::session::{Banner, HistoryPoint, Session};
use eframe::egui::{self, Color32};
use egui_plot::{Legend, Line, Plot, PlotPoints};
use std::sync::Arc;
use std::time::{Duration, Instant};

// bbswitch has no change notification we can hook into from here
const POWER_REFRESH: Duration = Duration::from_millis(500);

pub struct DgmApp {
    session: Session,
    display_duration: f64,
    last_power_check: Option<Instant>,
    kill_errors: Vec<String>,
}

impl DgmApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        scheduler: MonitorScheduler,
        config: &MonitorConfig,
    ) -> Self {
        let ctx = cc.egui_ctx.clone();
        let session = Session::new(scheduler, config, Arc::new(move || ctx.request_repaint()));
        session.ping_daemon();

        let mut style = (*cc.egui_ctx.style()).clone();
        style.visuals.dark_mode = true;
        cc.egui_ctx.set_style(style);

        Self {
            session,
            display_duration: config.history_seconds,
            last_power_check: None,
            kill_errors: Vec::new(),
        }
    }

    fn refresh_power(&mut self) {
        let due = self
            .last_power_check
            .map_or(true, |checked| checked.elapsed() >= POWER_REFRESH);
        if due {
            self.session.refresh_power();
            self.last_power_check = Some(Instant::now());
        }
    }

    fn header(&mut self, ui: &mut egui::Ui) {
        ui.heading(format!("🚀 {}", self.session.gpu_title()));
        let enabled = self.session.power().map(|state| state.enabled);
        let power = match self.session.power() {
            Some(state) if state.enabled => format!("{} - ON", state.bus_id),
            Some(state) => format!("{} - OFF", state.bus_id),
            None => "No GPU".to_string(),
        };
        ui.horizontal(|ui| {
            match self.session.vendor() {
                Some(vendor) => ui.label(format!("{} - {}", vendor, power)),
                None => ui.label(power),
            };
            if let Some(enabled) = enabled {
                let busy = self.session.switch_in_progress();
                let text = match (busy, enabled) {
                    (true, _) => "Cancel switching",
                    (false, true) => "Power off",
                    (false, false) => "Power on",
                };
                if ui.button(text).clicked() {
                    self.session.request_power(!enabled);
                }
                if busy {
                    ui.spinner();
                }
            }
        });
        if let Some(error) = self.session.switch_error() {
            ui.colored_label(Color32::RED, error);
        }
    }

    fn banner(&self, ui: &mut egui::Ui) {
        let (text, color) = match &self.session.view().banner {
            Some(Banner::Info(message)) => (message.as_str(), Color32::LIGHT_BLUE),
            Some(Banner::Warning(message)) => (message.as_str(), Color32::YELLOW),
            Some(Banner::Error(message)) => (message.as_str(), Color32::RED),
            None => return,
        };
        egui::Frame::group(ui.style()).show(ui, |ui| {
            ui.label(egui::RichText::new(text).color(color).strong());
            if self.session.monitor_state() == MonitorState::Stopped {
                if let Some(error) = self.session.last_error() {
                    ui.label(format!("Last error: {}", error));
                }
            }
        });
    }

    fn readings(&self, ui: &mut egui::Ui) {
        let view = self.session.view();
        if !view.has_data {
            return;
        }
        egui::Frame::group(ui.style()).show(ui, |ui| {
            ui.horizontal(|ui| {
                ui.vertical(|ui| {
                    ui.label(
                        egui::RichText::new(format!("GPU Utilization: {}", view.utilization))
                            .color(Color32::GREEN)
                            .size(22.0)
                            .strong(),
                    );
                    ui.label(format!("Temperature: {}", view.temperature));
                });
                ui.separator();
                ui.vertical(|ui| {
                    ui.label(format!("Memory: {}", view.memory));
                    ui.label(format!("Power: {}", view.power));
                });
                ui.separator();
                ui.vertical(|ui| {
                    ui.label(egui::RichText::new("Kernel modules").strong());
                    ui.label(view.module_list());
                });
            });
        });
    }

    fn plot(&self, ui: &mut egui::Ui) {
        let history = &self.session.view().history;
        let latest = history.back().map_or(0.0, |point| point.at);
        let series = |value: fn(&HistoryPoint) -> Option<f64>| -> PlotPoints {
            history
                .iter()
                .filter_map(|point| value(point).map(|v| [(latest - point.at).max(0.0), v]))
                .collect()
        };

        Plot::new("gpu_metrics_plot")
            .view_aspect(2.5)
            .legend(Legend::default())
            .include_y(0.0)
            .include_y(100.0)
            .include_x(0.0)
            .include_x(self.display_duration)
            .x_axis_label("Seconds Ago (0 = now)")
            .show(ui, |plot_ui| {
                plot_ui.line(
                    Line::new("GPU Utilization", series(|p| Some(p.utilization)))
                        .color(Color32::GREEN),
                );
                plot_ui.line(
                    Line::new("Temperature (°C)", series(|p| Some(p.temperature)))
                        .color(Color32::from_rgb(255, 128, 0)),
                );
                plot_ui.line(
                    Line::new("Power Usage (%)", series(|p| p.power_percent))
                        .color(Color32::from_rgb(255, 0, 128)),
                );
            });
    }

    fn processes(&mut self, ui: &mut egui::Ui) {
        let mut toggled = Vec::new();
        egui::ScrollArea::vertical()
            .max_height(200.0)
            .show(ui, |ui| {
                egui::Grid::new("processes_grid")
                    .striped(true)
                    .spacing([12.0, 6.0])
                    .show(ui, |ui| {
                        ui.label("");
                        ui.label(egui::RichText::new("PID").strong());
                        ui.label(egui::RichText::new("Memory").strong());
                        ui.label(egui::RichText::new("Command").strong());
                        ui.end_row();
                        for row in self.session.view().processes.rows() {
                            let mut selected = row.selected;
                            if ui.checkbox(&mut selected, "").changed() {
                                toggled.push(row.pid);
                            }
                            ui.label(row.pid.to_string());
                            ui.label(&row.memory);
                            ui.label(&row.cmdline);
                            ui.end_row();
                        }
                    });
            });
        for pid in toggled {
            self.session.toggle(pid);
        }

        let processes = &self.session.view().processes;
        let any_selected = !processes.selected_pids().is_empty();
        let any_rows = !processes.is_empty();
        ui.horizontal(|ui| {
            if ui
                .add_enabled(any_selected, egui::Button::new("Kill selected"))
                .clicked()
            {
                self.kill_errors = self
                    .session
                    .kill_selected()
                    .into_iter()
                    .map(|e| e.to_string())
                    .collect();
            }
            if ui
                .add_enabled(any_rows, egui::Button::new("Select all / none"))
                .clicked()
            {
                self.session.toggle_all();
            }
        });
        for error in &self.kill_errors {
            ui.colored_label(Color32::RED, error);
        }
    }
}

impl eframe::App for DgmApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.refresh_power();
        self.session.pump();

        egui::CentralPanel::default().show(ctx, |ui| {
            self.header(ui);
            ui.add_space(8.0);
            self.banner(ui);
            self.readings(ui);

            ui.add_space(12.0);
            ui.separator();
            ui.heading("📈 Real-time GPU Metrics");
            self.plot(ui);

            ui.add_space(12.0);
            ui.separator();
            ui.heading("🧩 GPU Processes");
            self.processes(ui);
        });

        ctx.request_repaint_after(POWER_REFRESH);
    }
}

impl Drop for DgmApp {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}
