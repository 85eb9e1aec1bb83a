use std::{
    fmt,
    sync::{Mutex, MutexGuard},
};

use arboard::Clipboard;
use clipsaver_core::{ClipboardImage, CoreError};

/// Every clipboard access in the process goes through this lock.
static CLIPBOARD_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug)]
pub enum CaptureError {
    /// Another process holds the clipboard or it could not be opened.
    Unavailable(String),
    Decode(CoreError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Unavailable(msg) => write!(f, "clipboard unavailable: {msg}"),
            CaptureError::Decode(e) => write!(f, "clipboard image unreadable: {e}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Decode(e) => Some(e),
            CaptureError::Unavailable(_) => None,
        }
    }
}

/// Something that can be polled for the current clipboard image.
pub trait ImageSource: Send + Sync {
    /// `Ok(None)` when the clipboard holds no bitmap.
    fn read_image(&self) -> Result<Option<ClipboardImage>, CaptureError>;
}

/// Open clipboard plus the process-wide lock. Both are released on drop.
pub struct ClipboardGuard {
    clipboard: Clipboard,
    _lock: MutexGuard<'static, ()>,
}

impl ClipboardGuard {
    pub fn open() -> Result<Self, CaptureError> {
        // A panic elsewhere while holding the lock leaves no clipboard state behind.
        let lock = CLIPBOARD_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A fresh handle per read: nothing holds the clipboard between ticks.
        // On X11 this costs a short-lived selection server per poll.
        let clipboard = Clipboard::new().map_err(|err| CaptureError::Unavailable(err.to_string()))?;
        Ok(Self {
            clipboard,
            _lock: lock,
        })
    }

    pub fn image(&mut self) -> Result<Option<ClipboardImage>, CaptureError> {
        match self.clipboard.get_image() {
            Ok(data) => ClipboardImage::new(
                data.width as u32,
                data.height as u32,
                data.bytes.into_owned(),
            )
            .map(Some)
            .map_err(CaptureError::Decode),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(err) => Err(CaptureError::Unavailable(err.to_string())),
        }
    }
}

/// Reads the system clipboard through `arboard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArboardSource;

impl ImageSource for ArboardSource {
    fn read_image(&self) -> Result<Option<ClipboardImage>, CaptureError> {
        ClipboardGuard::open()?.image()
    }
}
