#![cfg_attr(target_os = "windows", windows_subsystem = "windows")]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc::Receiver},
    time::Duration,
};

use clap::Parser;
use clipsaver_client::{
    clipboard::ArboardSource,
    logging::init_logging,
    relay::{DisplayState, LogRelay, UiEvent},
    store::{
        self, FolderHistory, load_settings_from_path, persist_settings, settings_for_connect,
    },
    worker::{Controller, StartError, SyncSlot, spawn_sync_init, sync_slot},
};
use clipsaver_core::{AuthMode, SyncSettings};
use eframe::egui;
use tracing::{error, info, warn};

const APP_NAME: &str = "Clipboard Image Saver";
const LOG_POLL: Duration = Duration::from_millis(150);
const READY_STATUS: &str = "Ready. Choose a folder and press Start.";

#[derive(Parser, Debug, Clone)]
#[command(name = "ClipSaver")]
struct ClientArgs {
    /// Folder to save images into.
    #[arg(long)]
    folder: Option<String>,
    /// Start watching immediately (requires --folder).
    #[arg(long, default_value_t = false)]
    start: bool,
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

struct Notice {
    title: String,
    message: String,
}

/// Editable copy of the sync settings while the settings window is open.
struct SettingsForm {
    settings: SyncSettings,
    drive_folder_id: String,
}

impl SettingsForm {
    fn new(settings: &SyncSettings) -> Self {
        Self {
            drive_folder_id: settings.drive_folder_id.clone().unwrap_or_default(),
            settings: settings.clone(),
        }
    }

    fn to_settings(&self) -> SyncSettings {
        SyncSettings {
            drive_folder_id: Some(self.drive_folder_id.clone()),
            ..self.settings.clone()
        }
        .normalized()
    }
}

struct ClipSaverApp {
    controller: Controller,
    events: Receiver<UiEvent>,
    relay: LogRelay,
    display: DisplayState,
    folder: String,
    history: FolderHistory,
    history_path: PathBuf,
    show_history: bool,
    settings: SyncSettings,
    settings_path: PathBuf,
    settings_form: Option<SettingsForm>,
    sync: SyncSlot,
    notice: Option<Notice>,
}

impl ClipSaverApp {
    fn new(args: &ClientArgs) -> Self {
        let (relay, events) = LogRelay::channel();
        let sync = sync_slot();
        let controller = Controller::new(
            Arc::new(ArboardSource),
            relay.clone(),
            Arc::clone(&sync),
            Duration::from_millis(args.poll_interval_ms.max(1)),
        );

        let history_path = store::history_path();
        let settings_path = store::settings_path();
        let (settings, source) =
            load_settings_from_path(&settings_path, |key| std::env::var(key).ok());
        info!(?source, mode = %settings.auth_mode, enabled = settings.enabled, "sync settings loaded");
        spawn_sync_init(settings_for_connect(&settings), Arc::clone(&sync), relay.clone());

        let mut app = Self {
            controller,
            events,
            relay,
            display: DisplayState::new(READY_STATUS),
            folder: args.folder.clone().unwrap_or_default(),
            history: FolderHistory::load_from_path(&history_path),
            history_path,
            show_history: false,
            settings,
            settings_path,
            settings_form: None,
            sync,
            notice: None,
        };
        if args.start {
            app.start();
        }
        app
    }

    fn notify(&mut self, title: &str, message: impl Into<String>) {
        self.notice = Some(Notice {
            title: title.to_owned(),
            message: message.into(),
        });
    }

    fn start(&mut self) {
        match self.controller.start(&self.folder) {
            Ok(true) => self.display.set_status("Running: watching clipboard…"),
            Ok(false) => {}
            Err(err @ StartError::NoFolder) => self.notify("Folder required", err.to_string()),
            Err(err) => {
                error!("start failed: {err}");
                self.notify("Error", err.to_string());
            }
        }
    }

    fn stop(&mut self) {
        if self.controller.stop() {
            self.display.set_status("Stopped.");
        }
    }

    fn choose_folder(&mut self) {
        let Some(folder) = rfd::FileDialog::new()
            .set_title("Select a folder for saving images")
            .pick_folder()
        else {
            return;
        };
        self.folder = folder.display().to_string();
        self.relay.log(format!("Folder chosen: {}", self.folder));
        if !self.history.push(&self.folder) {
            return;
        }
        if let Err(err) = self.history.save_to_path(&self.history_path) {
            warn!(path = %self.history_path.display(), "folder history not saved: {err}");
        }
    }

    fn select_from_history(&mut self, folder: String) {
        self.relay
            .log(format!("Folder selected from history: {folder}"));
        self.folder = folder;
    }

    fn open_folder(&mut self) {
        let folder = self.folder.trim().to_owned();
        if folder.is_empty() {
            self.notify("No folder", "Select a folder first.");
            return;
        }
        if !Path::new(&folder).is_dir() {
            self.notify("Error", "Folder does not exist.");
            return;
        }
        if let Err(err) = open::that(&folder) {
            self.notify("Error", format!("Could not open folder:\n{err}"));
        }
    }

    fn save_settings(&mut self, updated: SyncSettings) {
        if let Err(err) = persist_settings(&self.settings_path, &updated, &self.relay) {
            error!(path = %self.settings_path.display(), "settings not saved: {err}");
            self.notify("Error", format!("Could not save settings:\n{err}"));
        }
        spawn_sync_init(
            settings_for_connect(&updated),
            Arc::clone(&self.sync),
            self.relay.clone(),
        );
        self.settings = updated;
    }

    fn folder_row(&mut self, ui: &mut egui::Ui) {
        let running = self.controller.is_running();
        ui.group(|ui| {
            ui.label("Save folder");
            ui.horizontal(|ui| {
                ui.add_enabled(
                    !running,
                    egui::TextEdit::singleline(&mut self.folder).desired_width(f32::INFINITY),
                );
            });
            ui.horizontal(|ui| {
                if ui
                    .add_enabled(!running, egui::Button::new("Browse…"))
                    .clicked()
                {
                    self.choose_folder();
                }
                if ui
                    .add_enabled(!running, egui::Button::new("History"))
                    .clicked()
                {
                    self.show_history = true;
                }
            });
        });
    }

    fn controls_row(&mut self, ui: &mut egui::Ui) {
        let running = self.controller.is_running();
        ui.horizontal(|ui| {
            if ui.add_enabled(!running, egui::Button::new("Start")).clicked() {
                self.start();
            }
            if ui.add_enabled(running, egui::Button::new("Stop")).clicked() {
                self.stop();
            }
            ui.add_space(16.0);
            if ui.button("Open folder").clicked() {
                self.open_folder();
            }
            if ui.button("Google sync…").clicked() {
                self.relay.log("Opening Google sync settings window.");
                self.settings_form = Some(SettingsForm::new(&self.settings));
            }
        });
    }

    fn log_view(&self, ui: &mut egui::Ui) {
        ui.group(|ui| {
            ui.label("Log");
            egui::ScrollArea::vertical()
                .auto_shrink([false, false])
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for line in self.display.lines() {
                        ui.monospace(line);
                    }
                });
        });
    }

    fn history_window(&mut self, ctx: &egui::Context) {
        if !self.show_history {
            return;
        }
        let mut open = true;
        let mut selected = None;
        egui::Window::new("Folder history")
            .open(&mut open)
            .default_size([400.0, 300.0])
            .show(ctx, |ui| {
                if self.history.is_empty() {
                    ui.label("No folders yet.");
                }
                for folder in self.history.entries() {
                    if ui.button(folder).clicked() {
                        selected = Some(folder.clone());
                    }
                }
            });
        if let Some(folder) = selected {
            self.select_from_history(folder);
            open = false;
        }
        self.show_history = open;
    }

    fn settings_window(&mut self, ctx: &egui::Context) {
        let Some(form) = self.settings_form.as_mut() else {
            return;
        };
        let mut open = true;
        let mut save = false;
        let mut cancel = false;
        egui::Window::new("Google sync settings")
            .open(&mut open)
            .collapsible(false)
            .default_size([460.0, 360.0])
            .show(ctx, |ui| {
                let s = &mut form.settings;
                ui.checkbox(&mut s.enabled, "Enable Google sync");
                ui.label("Auth mode:");
                ui.horizontal(|ui| {
                    ui.radio_value(&mut s.auth_mode, AuthMode::Service, "Service account");
                    ui.radio_value(&mut s.auth_mode, AuthMode::Oauth, "User OAuth");
                });
                let service = s.auth_mode == AuthMode::Service;

                ui.label("Service account JSON:");
                ui.add_enabled_ui(service, |ui| {
                    path_field(ui, &mut s.credentials_file, "Select service account JSON");
                });
                ui.label("OAuth client secret (client_secret.json):");
                ui.add_enabled_ui(!service, |ui| {
                    path_field(ui, &mut s.client_secret_file, "Select OAuth client secret JSON");
                    ui.label("Token file (will be created/refreshed):");
                    ui.text_edit_singleline(&mut s.token_file);
                });

                ui.label("Spreadsheet ID:");
                ui.text_edit_singleline(&mut s.spreadsheet_id);
                ui.label("Sheet name:");
                ui.text_edit_singleline(&mut s.sheet_name);
                ui.label("Search term (cell contains):");
                ui.text_edit_singleline(&mut s.search_term);
                ui.label("Drive folder ID (optional):");
                ui.text_edit_singleline(&mut form.drive_folder_id);

                ui.separator();
                ui.horizontal(|ui| {
                    if ui.button("Cancel").clicked() {
                        cancel = true;
                    }
                    if ui.button("Save").clicked() {
                        save = true;
                    }
                });
            });

        if save {
            let updated = form.to_settings();
            self.settings_form = None;
            self.save_settings(updated);
        } else if cancel || !open {
            self.settings_form = None;
        }
    }

    fn notice_window(&mut self, ctx: &egui::Context) {
        let Some(notice) = &self.notice else {
            return;
        };
        let mut dismissed = false;
        egui::Window::new(notice.title.as_str())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(notice.message.as_str());
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.notice = None;
        }
    }
}

fn path_field(ui: &mut egui::Ui, value: &mut String, title: &str) {
    ui.horizontal(|ui| {
        ui.text_edit_singleline(value);
        if !ui.button("Browse…").clicked() {
            return;
        }
        if let Some(path) = rfd::FileDialog::new()
            .set_title(title)
            .add_filter("JSON files", &["json"])
            .pick_file()
        {
            *value = path.display().to_string();
        }
    });
}

impl eframe::App for ClipSaverApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.display
            .drain(&self.events, self.controller.is_running());

        if ctx.input(|i| i.viewport().close_requested()) {
            self.stop();
        }

        egui::TopBottomPanel::bottom("footer").show(ctx, |ui| {
            ui.label("Saves images that appear in the clipboard (screenshots, copied pictures).");
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.folder_row(ui);
            self.controls_row(ui);
            ui.add_space(6.0);
            ui.label(self.display.status());
            ui.add_space(6.0);
            self.log_view(ui);
        });

        self.history_window(ctx);
        self.settings_window(ctx);
        self.notice_window(ctx);

        ctx.request_repaint_after(LOG_POLL);
    }
}

fn main() {
    let args = ClientArgs::parse();
    init_logging(&store::log_path());
    info!(
        folder = ?args.folder,
        start = args.start,
        poll_interval_ms = args.poll_interval_ms,
        "clipsaver starting"
    );

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(APP_NAME)
            .with_inner_size([720.0, 420.0])
            .with_min_inner_size([640.0, 360.0]),
        ..Default::default()
    };

    let result = eframe::run_native(
        APP_NAME,
        options,
        Box::new(move |_cc| Ok(Box::new(ClipSaverApp::new(&args)))),
    );
    if let Err(err) = result {
        error!("ui exited with error: {err}");
        std::process::exit(1);
    }
}
