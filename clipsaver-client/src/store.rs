use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clipsaver_core::{SettingsSource, SyncSettings};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::relay::LogRelay;

/// Both persisted documents are tiny; anything larger is treated as corrupt.
pub const MAX_STORE_BYTES: u64 = 64 * 1024;

pub const MAX_FOLDER_HISTORY: usize = 10;

pub const CONFIG_DIR_ENV: &str = "CLIPSAVER_CONFIG_DIR";
pub const HISTORY_FILE_NAME: &str = "folder_history.json";
pub const SETTINGS_FILE_NAME: &str = "google_sync_settings.json";

#[derive(Debug)]
pub enum StoreLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for StoreLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            StoreLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            StoreLoadError::Read(e) => write!(f, "read failed: {e}"),
            StoreLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for StoreLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreLoadError::Metadata(e) => Some(e),
            StoreLoadError::Read(e) => Some(e),
            StoreLoadError::Parse(e) => Some(e),
            StoreLoadError::TooLarge { .. } => None,
        }
    }
}

impl StoreLoadError {
    fn is_not_found(&self) -> bool {
        matches!(self, StoreLoadError::Metadata(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug)]
pub enum StoreSaveError {
    Serialize(serde_json::Error),
    CreateDir(io::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for StoreSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            StoreSaveError::CreateDir(e) => write!(f, "create dir failed: {e}"),
            StoreSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            StoreSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for StoreSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreSaveError::Serialize(e) => Some(e),
            StoreSaveError::CreateDir(e) => Some(e),
            StoreSaveError::WriteTmp(e) => Some(e),
            StoreSaveError::Rename(e) => Some(e),
        }
    }
}

/// `$CLIPSAVER_CONFIG_DIR` when set, otherwise the working directory.
pub fn config_dir() -> PathBuf {
    let dir = std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn history_path() -> PathBuf {
    config_dir().join(HISTORY_FILE_NAME)
}

pub fn settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE_NAME)
}

pub fn log_path() -> PathBuf {
    let dir = config_dir().join("logs");
    let _ = fs::create_dir_all(&dir);
    dir.join("clipsaver.log")
}

pub fn read_bounded(path: &Path) -> Result<String, StoreLoadError> {
    let meta = fs::metadata(path).map_err(StoreLoadError::Metadata)?;
    if meta.len() > MAX_STORE_BYTES {
        return Err(StoreLoadError::TooLarge {
            size: meta.len(),
            max: MAX_STORE_BYTES,
        });
    }
    fs::read_to_string(path).map_err(StoreLoadError::Read)
}

pub fn load_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, StoreLoadError> {
    let data = read_bounded(path)?;
    serde_json::from_str(&data).map_err(StoreLoadError::Parse)
}

pub fn save_json_to_path<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreSaveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(StoreSaveError::CreateDir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(value).map_err(StoreSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(StoreSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(StoreSaveError::Rename)?;
    Ok(())
}

pub fn save_json_with_retry<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_json_to_path(path, value) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(path = %path.display(), attempt, "save failed, retrying: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

/// Recently chosen destination folders, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderHistory {
    entries: Vec<String>,
}

impl FolderHistory {
    pub fn from_entries(entries: Vec<String>) -> Self {
        let mut kept: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.trim();
            if !entry.is_empty() && !kept.iter().any(|f| f == entry) {
                kept.push(entry.to_owned());
            }
        }
        kept.truncate(MAX_FOLDER_HISTORY);
        Self { entries: kept }
    }

    /// Missing or unreadable history starts empty.
    pub fn load_from_path(path: &Path) -> Self {
        match load_json_from_path::<Vec<String>>(path) {
            Ok(entries) => Self::from_entries(entries),
            Err(err) => {
                if !err.is_not_found() {
                    warn!(path = %path.display(), "ignoring folder history: {err}");
                }
                Self::default()
            }
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), StoreSaveError> {
        save_json_with_retry(path, &self.entries)
    }

    /// Adds a folder at the front. Folders already listed keep their place.
    /// Returns whether the list changed.
    pub fn push(&mut self, folder: &str) -> bool {
        let folder = folder.trim();
        if folder.is_empty() || self.entries.iter().any(|f| f == folder) {
            return false;
        }
        self.entries.insert(0, folder.to_owned());
        self.entries.truncate(MAX_FOLDER_HISTORY);
        true
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settings file first, then environment variables, then defaults.
pub fn load_settings_from_path<F>(path: &Path, lookup: F) -> (SyncSettings, SettingsSource)
where
    F: Fn(&str) -> Option<String>,
{
    let contents = match read_bounded(path) {
        Ok(data) => Some(data),
        Err(err) => {
            if !err.is_not_found() {
                warn!(path = %path.display(), "ignoring sync settings file: {err}");
            }
            None
        }
    };
    let (settings, source) = SyncSettings::resolve(contents.as_deref(), lookup);
    if contents.is_some() && source != SettingsSource::File {
        warn!(path = %path.display(), ?source, "sync settings file is invalid; using fallback");
    }
    (settings, source)
}

pub fn save_settings_to_path(path: &Path, settings: &SyncSettings) -> Result<(), StoreSaveError> {
    save_json_with_retry(path, settings)
}

/// Saves the settings and reports it in the UI log. Nothing is logged when
/// the write fails.
pub fn persist_settings(
    path: &Path,
    settings: &SyncSettings,
    relay: &LogRelay,
) -> Result<(), StoreSaveError> {
    save_settings_to_path(path, settings)?;
    relay.log(format!(
        "Google sync settings saved (enabled={}, mode={}).",
        settings.enabled, settings.auth_mode
    ));
    Ok(())
}

/// Settings with relative credential and token paths joined onto the config
/// directory.
pub fn settings_for_connect(settings: &SyncSettings) -> SyncSettings {
    settings.rooted_at(&config_dir())
}
