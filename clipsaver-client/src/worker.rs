//! The clipboard polling worker and the controller that owns it.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use clipsaver_core::{ChangeDetector, ClipboardImage, SyncResult, SyncSettings, next_filename};
use clipsaver_sync::{SyncError, blocking::BlockingSheetSync};
use image::{ImageFormat, RgbaImage};
use tracing::{debug, info, warn};

use crate::{clipboard::ImageSource, relay::LogRelay};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Uploads a saved image and links it into the sheet.
pub trait ImageSync: Send + Sync {
    fn upload_and_link(&self, image_path: &Path) -> Result<SyncResult, SyncError>;
}

impl ImageSync for BlockingSheetSync {
    fn upload_and_link(&self, image_path: &Path) -> Result<SyncResult, SyncError> {
        BlockingSheetSync::upload_and_link(self, image_path)
    }
}

/// The sync client currently in effect. Rebuilt off-thread whenever the
/// settings change; the worker looks it up on every tick.
///
/// Each rebuild takes a generation number when it is requested. Only the
/// most recently requested rebuild may publish, so a slow connect for old
/// settings can never replace the client for newer ones.
#[derive(Default)]
pub struct SyncState {
    current: Mutex<Option<Arc<dyn ImageSync>>>,
    generation: AtomicU64,
}

pub type SyncSlot = Arc<SyncState>;

pub fn sync_slot() -> SyncSlot {
    Arc::new(SyncState::default())
}

impl SyncState {
    pub fn current(&self) -> Option<Arc<dyn ImageSync>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns `false` and leaves the slot alone when a newer rebuild has
    /// been requested since `generation` was taken.
    fn publish(&self, generation: u64, sync: Option<Arc<dyn ImageSync>>) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *current = sync;
        true
    }
}

pub fn spawn_sync_init(settings: SyncSettings, slot: SyncSlot, relay: LogRelay) -> JoinHandle<()> {
    spawn_sync_init_with(settings, slot, relay, |settings| {
        BlockingSheetSync::connect(settings).map(|sync| Arc::new(sync) as Arc<dyn ImageSync>)
    })
}

/// Connects in the background so a slow or interactive authorization never
/// blocks the UI thread.
pub fn spawn_sync_init_with<F>(
    settings: SyncSettings,
    slot: SyncSlot,
    relay: LogRelay,
    connect: F,
) -> JoinHandle<()>
where
    F: FnOnce(SyncSettings) -> Result<Arc<dyn ImageSync>, SyncError> + Send + 'static,
{
    let generation = slot.next_generation();
    thread::spawn(move || {
        if !settings.enabled {
            if slot.publish(generation, None) {
                relay.log("Google Sheets sync disabled (toggle is off).");
            }
            return;
        }
        let outcome = connect(settings);
        let connected = outcome.as_ref().ok().cloned();
        if !slot.publish(generation, connected) {
            debug!(generation, "discarding superseded sync setup");
            return;
        }
        match outcome {
            Ok(_) => relay.log("Google Sheets sync enabled."),
            Err(err) => {
                warn!("google sync init failed: {err}");
                relay.log(format!("Google Sheets sync not started: {err}"));
            }
        }
    })
}

/// Cancellation signal for one worker run. The condvar lets the inter-tick
/// sleep end as soon as the flag is set.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelFlag {
    pub fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`. Returns `true` if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Debug)]
pub enum SaveError {
    Allocate(io::Error),
    Buffer { width: u32, height: u32 },
    Encode(image::ImageError),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::Allocate(e) => write!(f, "could not list folder: {e}"),
            SaveError::Buffer { width, height } => {
                write!(f, "pixel buffer does not match {width}x{height}")
            }
            SaveError::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SaveError::Allocate(e) => Some(e),
            SaveError::Encode(e) => Some(e),
            SaveError::Buffer { .. } => None,
        }
    }
}

/// Writes `image` as the next `img_<N>.png` in `folder`.
pub fn save_image(folder: &Path, image: &ClipboardImage) -> Result<PathBuf, SaveError> {
    let name = next_filename(folder).map_err(SaveError::Allocate)?;
    let path = folder.join(name);
    let buffer = RgbaImage::from_raw(image.width, image.height, image.rgba.clone()).ok_or(
        SaveError::Buffer {
            width: image.width,
            height: image.height,
        },
    )?;
    buffer
        .save_with_format(&path, ImageFormat::Png)
        .map_err(SaveError::Encode)?;
    Ok(path)
}

/// Reads the clipboard, turning failures into a log line.
pub fn read_image(source: &dyn ImageSource, relay: &LogRelay) -> Option<ClipboardImage> {
    match source.read_image() {
        Ok(image) => image,
        Err(err) => {
            warn!("{err}");
            relay.log(format!("Clipboard error: {err}"));
            None
        }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    NoImage,
    Unchanged,
    Saved {
        path: PathBuf,
        synced: Option<Result<SyncResult, String>>,
    },
    SaveFailed,
}

/// One poll: read, compare, save, sync. Never fails; every problem becomes
/// a log or status message.
pub fn run_tick(
    folder: &Path,
    source: &dyn ImageSource,
    detector: &mut ChangeDetector,
    sync: Option<&dyn ImageSync>,
    relay: &LogRelay,
) -> TickOutcome {
    let Some(image) = read_image(source, relay) else {
        return TickOutcome::NoImage;
    };
    if !detector.observe(&image) {
        return TickOutcome::Unchanged;
    }
    debug!(
        width = image.width,
        height = image.height,
        digest = %image.digest_hex(),
        "new clipboard image"
    );

    let path = match save_image(folder, &image) {
        Ok(path) => path,
        Err(err) => {
            relay.log(format!("Save error: {err}"));
            relay.status("Save error (see log).");
            return TickOutcome::SaveFailed;
        }
    };
    relay.log(format!("Saved: {}", path.display()));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    relay.status(format!("Saved: {file_name}"));

    let synced = sync.map(|sync| match sync.upload_and_link(&path) {
        Ok(result) => {
            relay.log(format!(
                "Uploaded to Sheets ({}) via {}",
                result.cell, result.link
            ));
            Ok(result)
        }
        Err(err) => {
            relay.log(format!("Google sync error: {err}"));
            Err(err.to_string())
        }
    });
    TickOutcome::Saved { path, synced }
}

#[derive(Debug)]
pub enum StartError {
    NoFolder,
    CreateFolder { path: PathBuf, source: io::Error },
    Spawn(io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::NoFolder => write!(f, "Choose a folder to save images."),
            StartError::CreateFolder { path, source } => {
                write!(f, "Could not create/open folder {}:\n{source}", path.display())
            }
            StartError::Spawn(e) => write!(f, "Could not start the worker thread: {e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::CreateFolder { source, .. } => Some(source),
            StartError::Spawn(e) => Some(e),
            StartError::NoFolder => None,
        }
    }
}

/// Controller-side view of the worker. Only the cancel flag is shared with
/// the worker thread.
#[derive(Debug, Default)]
pub struct WorkerState {
    running: bool,
    folder: Option<PathBuf>,
    cancel: Option<Arc<CancelFlag>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }
}

pub struct Controller {
    source: Arc<dyn ImageSource>,
    relay: LogRelay,
    sync: SyncSlot,
    poll_interval: Duration,
    state: WorkerState,
}

impl Controller {
    pub fn new(
        source: Arc<dyn ImageSource>,
        relay: LogRelay,
        sync: SyncSlot,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            relay,
            sync,
            poll_interval,
            state: WorkerState::default(),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Starts watching `folder`. Returns `Ok(false)` when a worker is already
    /// running.
    pub fn start(&mut self, folder: &str) -> Result<bool, StartError> {
        let folder = folder.trim();
        if folder.is_empty() {
            return Err(StartError::NoFolder);
        }
        let folder = PathBuf::from(folder);
        fs::create_dir_all(&folder).map_err(|source| StartError::CreateFolder {
            path: folder.clone(),
            source,
        })?;
        if self.state.running {
            return Ok(false);
        }

        let mut detector = ChangeDetector::primed(read_image(&*self.source, &self.relay).as_ref());
        let cancel = Arc::new(CancelFlag::default());

        let worker_folder = folder.clone();
        let source = Arc::clone(&self.source);
        let sync = Arc::clone(&self.sync);
        let relay = self.relay.clone();
        let worker_cancel = Arc::clone(&cancel);
        let interval = self.poll_interval;
        self.relay.log("=== START ===");
        let handle = thread::Builder::new()
            .name("clipsaver-worker".to_owned())
            .spawn(move || {
                info!(folder = %worker_folder.display(), "worker started");
                while !worker_cancel.is_cancelled() {
                    let current = sync.current();
                    run_tick(
                        &worker_folder,
                        &*source,
                        &mut detector,
                        current.as_deref(),
                        &relay,
                    );
                    if worker_cancel.wait(interval) {
                        break;
                    }
                }
                info!("worker stopped");
            })
            .map_err(StartError::Spawn)?;

        self.state = WorkerState {
            running: true,
            folder: Some(folder),
            cancel: Some(cancel),
            handle: Some(handle),
        };
        Ok(true)
    }

    /// Signals the worker to stop without waiting for it. Returns `false`
    /// when nothing was running.
    pub fn stop(&mut self) -> bool {
        if !self.state.running {
            return false;
        }
        if let Some(cancel) = self.state.cancel.take() {
            cancel.cancel();
        }
        self.state.running = false;
        self.relay.log("=== STOP ===");
        true
    }

    /// Waits for the last worker thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.state.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.cancel.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn cancel_wakes_a_sleeping_wait() {
        let flag = Arc::new(CancelFlag::default());
        let waiter = Arc::clone(&flag);
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        flag.cancel();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let flag = CancelFlag::default();
        assert!(!flag.wait(Duration::from_millis(5)));
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn start_error_messages_are_user_facing() {
        assert_eq!(
            StartError::NoFolder.to_string(),
            "Choose a folder to save images."
        );
    }
}
