use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use clipsaver_client::{
    clipboard::{CaptureError, ImageSource},
    relay::{LogRelay, UiEvent},
    worker::{
        Controller, ImageSync, StartError, TickOutcome, run_tick, spawn_sync_init_with, sync_slot,
    },
};
use clipsaver_core::{ChangeDetector, ClipboardImage, SyncResult, SyncSettings};
use clipsaver_sync::SyncError;

#[derive(Default)]
struct FakeClipboard {
    current: Mutex<Option<ClipboardImage>>,
    fail: Mutex<bool>,
}

impl FakeClipboard {
    fn holding(image: ClipboardImage) -> Arc<Self> {
        let fake = Arc::new(Self::default());
        fake.set(image);
        fake
    }

    fn set(&self, image: ClipboardImage) {
        *self.current.lock().unwrap() = Some(image);
    }

    fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

impl ImageSource for FakeClipboard {
    fn read_image(&self) -> Result<Option<ClipboardImage>, CaptureError> {
        if *self.fail.lock().unwrap() {
            return Err(CaptureError::Unavailable("occupied".to_owned()));
        }
        Ok(self.current.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingSync {
    uploads: Mutex<Vec<PathBuf>>,
    fail: bool,
}

impl ImageSync for RecordingSync {
    fn upload_and_link(&self, image_path: &Path) -> Result<SyncResult, SyncError> {
        self.uploads.lock().unwrap().push(image_path.to_path_buf());
        if self.fail {
            return Err(SyncError::NoMatchingCell {
                term: "add".to_owned(),
                sheet: "Sheet1".to_owned(),
            });
        }
        Ok(SyncResult {
            cell: "Sheet1!B1".to_owned(),
            file_id: "file-1".to_owned(),
            link: "https://drive.google.com/uc?export=view&id=file-1".to_owned(),
        })
    }
}

fn image_a() -> ClipboardImage {
    ClipboardImage::new(1, 1, vec![1, 2, 3, 4]).unwrap()
}

fn image_b() -> ClipboardImage {
    ClipboardImage::new(1, 1, vec![5, 6, 7, 8]).unwrap()
}

fn png_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".png"))
        .collect();
    names.sort();
    names
}

fn logs(rx: &Receiver<UiEvent>) -> Vec<String> {
    rx.try_iter()
        .filter_map(|event| match event {
            UiEvent::Log(line) => Some(line),
            UiEvent::Status(_) => None,
        })
        .collect()
}

fn statuses(rx: &Receiver<UiEvent>) -> Vec<String> {
    rx.try_iter()
        .filter_map(|event| match event {
            UiEvent::Status(status) => Some(status),
            UiEvent::Log(_) => None,
        })
        .collect()
}

#[test]
fn primed_image_is_skipped_and_new_image_saved_once() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_a());
    let (relay, rx) = LogRelay::channel();

    let mut detector = ChangeDetector::primed(clipboard.read_image().unwrap().as_ref());
    assert!(matches!(
        run_tick(dir.path(), &*clipboard, &mut detector, None, &relay),
        TickOutcome::Unchanged
    ));

    clipboard.set(image_b());
    let (path, synced) = match run_tick(dir.path(), &*clipboard, &mut detector, None, &relay) {
        TickOutcome::Saved { path, synced } => (path, synced),
        other => panic!("expected a save, got {other:?}"),
    };
    assert_eq!(path, dir.path().join("img_1.png"));
    assert!(synced.is_none());

    let written = image::open(&path).expect("decode saved png").to_rgba8();
    assert_eq!(written.dimensions(), (1, 1));
    assert_eq!(written.into_raw(), vec![5, 6, 7, 8]);

    assert!(matches!(
        run_tick(dir.path(), &*clipboard, &mut detector, None, &relay),
        TickOutcome::Unchanged
    ));
    assert_eq!(png_files(dir.path()), ["img_1.png"]);

    let lines = logs(&rx);
    assert_eq!(lines, [format!("Saved: {}", path.display())]);
}

#[test]
fn saved_image_is_handed_to_sync_and_failures_are_logged() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_b());
    let (relay, rx) = LogRelay::channel();
    let sync = RecordingSync {
        fail: true,
        ..RecordingSync::default()
    };

    let mut detector = ChangeDetector::default();
    let outcome = run_tick(dir.path(), &*clipboard, &mut detector, Some(&sync as &dyn ImageSync), &relay);
    assert!(matches!(
        outcome,
        TickOutcome::Saved {
            synced: Some(Err(_)),
            ..
        }
    ));
    assert_eq!(
        *sync.uploads.lock().unwrap(),
        vec![dir.path().join("img_1.png")]
    );
    let lines = logs(&rx);
    assert_eq!(
        lines.last().map(String::as_str),
        Some("Google sync error: no cell containing 'add' found in sheet Sheet1")
    );
}

#[test]
fn successful_sync_logs_cell_and_link() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_a());
    let (relay, rx) = LogRelay::channel();
    let sync = RecordingSync::default();

    let mut detector = ChangeDetector::default();
    run_tick(dir.path(), &*clipboard, &mut detector, Some(&sync as &dyn ImageSync), &relay);

    assert!(logs(&rx).contains(
        &"Uploaded to Sheets (Sheet1!B1) via https://drive.google.com/uc?export=view&id=file-1"
            .to_owned()
    ));
}

#[test]
fn save_failure_is_reported_and_not_retried_for_same_image() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let missing = dir.path().join("gone");
    let clipboard = FakeClipboard::holding(image_a());
    let (relay, rx) = LogRelay::channel();

    let mut detector = ChangeDetector::default();
    assert!(matches!(
        run_tick(&missing, &*clipboard, &mut detector, None, &relay),
        TickOutcome::SaveFailed
    ));
    assert!(matches!(
        run_tick(&missing, &*clipboard, &mut detector, None, &relay),
        TickOutcome::Unchanged
    ));
    assert_eq!(statuses(&rx), ["Save error (see log)."]);
}

#[test]
fn clipboard_errors_skip_the_tick() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_a());
    clipboard.set_failing(true);
    let (relay, rx) = LogRelay::channel();

    let mut detector = ChangeDetector::default();
    assert!(matches!(
        run_tick(dir.path(), &*clipboard, &mut detector, None, &relay),
        TickOutcome::NoImage
    ));
    assert!(logs(&rx)[0].starts_with("Clipboard error: clipboard unavailable"));
    assert!(png_files(dir.path()).is_empty());
}

#[test]
fn starting_twice_is_a_no_op() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_a());
    let (relay, rx) = LogRelay::channel();
    let mut controller = Controller::new(
        clipboard,
        relay,
        sync_slot(),
        Duration::from_millis(10),
    );
    let folder = dir.path().display().to_string();

    assert!(controller.start(&folder).unwrap());
    assert!(!controller.start(&folder).unwrap());
    assert!(controller.is_running());

    assert!(controller.stop());
    controller.join();
    let starts = logs(&rx).iter().filter(|l| *l == "=== START ===").count();
    assert_eq!(starts, 1);
}

#[test]
fn stopping_a_never_started_worker_does_nothing() {
    let clipboard = Arc::new(FakeClipboard::default());
    let (relay, rx) = LogRelay::channel();
    let mut controller = Controller::new(clipboard, relay, sync_slot(), Duration::from_millis(10));

    assert!(!controller.stop());
    assert!(!controller.is_running());
    controller.join();
    assert!(rx.try_recv().is_err());
}

#[test]
fn start_requires_a_usable_folder() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let blocker = dir.path().join("a-file");
    std::fs::write(&blocker, b"x").unwrap();
    let (relay, _rx) = LogRelay::channel();
    let mut controller = Controller::new(
        Arc::new(FakeClipboard::default()),
        relay,
        sync_slot(),
        Duration::from_millis(10),
    );

    assert!(matches!(controller.start("   "), Err(StartError::NoFolder)));
    let nested = blocker.join("sub").display().to_string();
    assert!(matches!(
        controller.start(&nested),
        Err(StartError::CreateFolder { .. })
    ));
    assert!(!controller.is_running());
}

#[test]
fn running_worker_saves_new_clipboard_image_once() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let clipboard = FakeClipboard::holding(image_a());
    let (relay, _rx) = LogRelay::channel();
    let mut controller = Controller::new(
        clipboard.clone(),
        relay,
        sync_slot(),
        Duration::from_millis(10),
    );

    controller
        .start(&dir.path().display().to_string())
        .expect("start worker");
    clipboard.set(image_b());

    let deadline = Instant::now() + Duration::from_secs(5);
    while png_files(dir.path()).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    // Give the worker several more ticks with the same image.
    thread::sleep(Duration::from_millis(100));
    controller.stop();
    controller.join();

    assert_eq!(png_files(dir.path()), ["img_1.png"]);
}

#[test]
fn sync_init_reports_each_outcome() {
    let (relay, rx) = LogRelay::channel();
    let slot = sync_slot();

    spawn_sync_init_with(SyncSettings::default(), slot.clone(), relay.clone(), |_| {
        panic!("disabled settings must not connect")
    })
    .join()
    .unwrap();
    assert!(!slot.is_connected());

    let enabled = SyncSettings {
        enabled: true,
        ..SyncSettings::default()
    };
    spawn_sync_init_with(enabled.clone(), slot.clone(), relay.clone(), |_| {
        Ok(Arc::new(RecordingSync::default()) as Arc<dyn ImageSync>)
    })
    .join()
    .unwrap();
    assert!(slot.is_connected());

    spawn_sync_init_with(enabled, slot.clone(), relay, |_| {
        Err(SyncError::CredentialNotFound {
            path: PathBuf::from("missing.json"),
        })
    })
    .join()
    .unwrap();
    assert!(!slot.is_connected());

    assert_eq!(
        logs(&rx),
        [
            "Google Sheets sync disabled (toggle is off).".to_owned(),
            "Google Sheets sync enabled.".to_owned(),
            "Google Sheets sync not started: credential file not found: missing.json".to_owned(),
        ]
    );
}

#[test]
fn slow_setup_for_old_settings_does_not_override_newer_save() {
    let (relay, rx) = LogRelay::channel();
    let slot = sync_slot();
    let enabled = SyncSettings {
        enabled: true,
        ..SyncSettings::default()
    };

    let slow = spawn_sync_init_with(enabled, slot.clone(), relay.clone(), |_| {
        thread::sleep(Duration::from_millis(300));
        Ok(Arc::new(RecordingSync::default()) as Arc<dyn ImageSync>)
    });
    spawn_sync_init_with(SyncSettings::default(), slot.clone(), relay, |_| {
        panic!("disabled settings must not connect")
    })
    .join()
    .unwrap();
    slow.join().unwrap();

    assert!(!slot.is_connected());
    assert_eq!(
        logs(&rx),
        ["Google Sheets sync disabled (toggle is off).".to_owned()]
    );
}

#[test]
fn newest_of_two_enabled_setups_wins_even_if_it_finishes_first() {
    let (relay, _rx) = LogRelay::channel();
    let slot = sync_slot();
    let enabled = SyncSettings {
        enabled: true,
        ..SyncSettings::default()
    };
    let old_client = Arc::new(RecordingSync::default());
    let new_client = Arc::new(RecordingSync::default());

    let old = Arc::clone(&old_client);
    let slow = spawn_sync_init_with(enabled.clone(), slot.clone(), relay.clone(), move |_| {
        thread::sleep(Duration::from_millis(300));
        Ok(old as Arc<dyn ImageSync>)
    });
    let new = Arc::clone(&new_client);
    spawn_sync_init_with(enabled, slot.clone(), relay, move |_| Ok(new as Arc<dyn ImageSync>))
        .join()
        .unwrap();
    slow.join().unwrap();

    let dir = tempfile::tempdir().expect("create tempdir");
    let image = dir.path().join("img_1.png");
    let current = slot.current().expect("a sync client is published");
    current.upload_and_link(&image).unwrap();
    assert_eq!(new_client.uploads.lock().unwrap().len(), 1);
    assert!(old_client.uploads.lock().unwrap().is_empty());
}

/// Holds the first read made on a worker thread until released, and records
/// which worker thread made each read.
struct GatedClipboard {
    image: ClipboardImage,
    worker_reads: Mutex<Vec<ThreadId>>,
    entered: Mutex<Option<Sender<ThreadId>>>,
    release: Mutex<Option<Receiver<()>>>,
}

impl ImageSource for GatedClipboard {
    fn read_image(&self) -> Result<Option<ClipboardImage>, CaptureError> {
        if thread::current().name() == Some("clipsaver-worker") {
            let id = thread::current().id();
            let gate = self.release.lock().unwrap().take();
            if let Some(release) = gate {
                if let Some(entered) = self.entered.lock().unwrap().take() {
                    entered.send(id).unwrap();
                }
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
            self.worker_reads.lock().unwrap().push(id);
        }
        Ok(Some(self.image.clone()))
    }
}

#[test]
fn restart_during_a_blocked_tick_does_not_revive_the_old_worker() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let folder = dir.path().display().to_string();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let clipboard = Arc::new(GatedClipboard {
        image: image_a(),
        worker_reads: Mutex::new(Vec::new()),
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(Some(release_rx)),
    });
    let (relay, _rx) = LogRelay::channel();
    let mut controller = Controller::new(
        clipboard.clone(),
        relay,
        sync_slot(),
        Duration::from_millis(10),
    );

    assert!(controller.start(&folder).unwrap());
    let first = entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first worker reaches the clipboard");

    assert!(controller.stop());
    assert!(controller.start(&folder).unwrap());
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(200));

    let reads = clipboard.worker_reads.lock().unwrap().clone();
    let from_first = reads.iter().filter(|id| **id == first).count();
    let from_second = reads.iter().filter(|id| **id != first).count();
    assert_eq!(from_first, 1, "stopped worker kept polling");
    assert!(from_second > 1, "restarted worker is not polling");

    controller.stop();
    controller.join();
}
