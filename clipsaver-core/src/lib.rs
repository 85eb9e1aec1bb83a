use std::{fmt, fs, io, path::Path};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const IMAGE_FILE_PREFIX: &str = "img_";
pub const IMAGE_FILE_EXTENSION: &str = ".png";

/// Rows and columns fetched when looking for the target cell (`A1:Z200`).
pub const SEARCH_ROWS: u32 = 200;
pub const SEARCH_COLUMNS: u32 = 26;

pub const DEFAULT_TOKEN_FILE: &str = "google_token.json";
pub const DEFAULT_SHEET_NAME: &str = "Sheet1";
pub const DEFAULT_SEARCH_TERM: &str = "add";

/// Access tokens this close to expiry are treated as already expired.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

pub const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive.file",
];

pub const ENV_CREDENTIALS_FILE: &str = "GOOGLE_CREDENTIALS_FILE";
pub const ENV_SPREADSHEET_ID: &str = "GOOGLE_SPREADSHEET_ID";
pub const ENV_SHEET_NAME: &str = "GOOGLE_SHEET_NAME";
pub const ENV_SEARCH_TERM: &str = "GOOGLE_SEARCH_TERM";
pub const ENV_DRIVE_FOLDER_ID: &str = "GOOGLE_DRIVE_FOLDER_ID";
pub const ENV_CLIENT_SECRET_FILE: &str = "GOOGLE_CLIENT_SECRET_FILE";
pub const ENV_TOKEN_FILE: &str = "GOOGLE_TOKEN_FILE";
pub const ENV_AUTH_MODE: &str = "GOOGLE_AUTH_MODE";

const ENV_KEYS: [&str; 8] = [
    ENV_CREDENTIALS_FILE,
    ENV_SPREADSHEET_ID,
    ENV_SHEET_NAME,
    ENV_SEARCH_TERM,
    ENV_DRIVE_FOLDER_ID,
    ENV_CLIENT_SECRET_FILE,
    ENV_TOKEN_FILE,
    ENV_AUTH_MODE,
];

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("column index must be >= 1")]
    InvalidColumn,
    #[error("image buffer has {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    ImageSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("no cell containing '{term}' found in the scanned window")]
    NoMatchingCell { term: String },
    #[error("settings parse error: {0}")]
    Settings(String),
}

/// A decoded RGBA clipboard image. The raw pixel bytes double as the image's
/// signature for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl ClipboardImage {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, CoreError> {
        let expected = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        if rgba.len() != expected {
            return Err(CoreError::ImageSize {
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn signature(&self) -> &[u8] {
        &self.rgba
    }

    /// Short SHA-256 digest of the pixels. Only used for log output; identity
    /// is always decided on the raw bytes.
    pub fn digest_hex(&self) -> String {
        let digest = Sha256::digest(&self.rgba);
        hex::encode(&digest[..8])
    }
}

/// Remembers the signature of the last accepted clipboard image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDetector {
    last: Option<Vec<u8>>,
}

impl ChangeDetector {
    /// Seeds the detector with whatever image is on the clipboard right now so
    /// it is not saved as soon as watching starts.
    pub fn primed(current: Option<&ClipboardImage>) -> Self {
        Self {
            last: current.map(|image| image.signature().to_vec()),
        }
    }

    pub fn is_changed(&self, image: &ClipboardImage) -> bool {
        self.last.as_deref() != Some(image.signature())
    }

    /// Returns `true` and records the new signature when `image` differs from
    /// the last accepted one.
    pub fn observe(&mut self, image: &ClipboardImage) -> bool {
        if !self.is_changed(image) {
            return false;
        }
        self.last = Some(image.signature().to_vec());
        true
    }

    pub fn last_signature(&self) -> Option<&[u8]> {
        self.last.as_deref()
    }
}

/// Extracts `N` from a file name of the exact form `img_<N>.png`.
pub fn parse_image_index(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(IMAGE_FILE_PREFIX)?
        .strip_suffix(IMAGE_FILE_EXTENSION)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn image_file_name(index: u64) -> String {
    format!("{IMAGE_FILE_PREFIX}{index}{IMAGE_FILE_EXTENSION}")
}

pub fn next_filename_from<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let next = names
        .into_iter()
        .filter_map(|name| parse_image_index(name.as_ref()))
        .max()
        .map_or(1, |max| max.saturating_add(1));
    image_file_name(next)
}

/// Picks the next free `img_<N>.png` name in `folder`.
///
/// This only reads the directory. Two processes allocating in the same folder
/// at the same moment can both get the same name.
pub fn next_filename(folder: &Path) -> io::Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    Ok(next_filename_from(names))
}

/// Spreadsheet column letters for a 1-based column index (1 -> A, 27 -> AA).
pub fn column_letters(column: u32) -> Result<String, CoreError> {
    if column == 0 {
        return Err(CoreError::InvalidColumn);
    }
    let mut letters = Vec::new();
    let mut rest = column;
    while rest > 0 {
        let rem = (rest - 1) % 26;
        letters.push(b'A' + rem as u8);
        rest = (rest - 1) / 26;
    }
    letters.reverse();
    Ok(String::from_utf8_lossy(&letters).into_owned())
}

/// A 1-based cell position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: u32,
    pub column: u32,
}

impl CellRef {
    pub fn a1(&self) -> Result<String, CoreError> {
        Ok(format!("{}{}", column_letters(self.column)?, self.row))
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match column_letters(self.column) {
            Ok(letters) => write!(f, "{letters}{}", self.row),
            Err(_) => write!(f, "R{}C{}", self.row, self.column),
        }
    }
}

/// Sheet name as it must appear in an A1 range. Anything beyond letters,
/// digits and `_` needs quoting, with embedded quotes doubled.
pub fn quote_sheet_name(sheet: &str) -> String {
    let plain = !sheet.is_empty() && sheet.chars().all(|c| c.is_alphanumeric() || c == '_');
    if plain {
        sheet.to_owned()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}

pub fn qualified_reference(sheet: &str, a1: &str) -> String {
    format!("{}!{a1}", quote_sheet_name(sheet))
}

/// The rectangular window scanned for the search term.
pub fn search_range(sheet: &str) -> String {
    let last_column = column_letters(SEARCH_COLUMNS).unwrap_or_else(|_| "Z".to_owned());
    qualified_reference(sheet, &format!("A1:{last_column}{SEARCH_ROWS}"))
}

/// First cell, scanning rows top to bottom and each row left to right, whose
/// string value contains `term` case-insensitively. Cells outside the
/// `SEARCH_ROWS` x `SEARCH_COLUMNS` window are never looked at.
pub fn find_matching_cell(
    rows: &[Vec<serde_json::Value>],
    term: &str,
) -> Result<CellRef, CoreError> {
    let needle = term.to_lowercase();
    for (r_idx, row) in rows.iter().take(SEARCH_ROWS as usize).enumerate() {
        for (c_idx, value) in row.iter().take(SEARCH_COLUMNS as usize).enumerate() {
            let Some(text) = value.as_str() else {
                continue;
            };
            if text.to_lowercase().contains(&needle) {
                return Ok(CellRef {
                    row: r_idx as u32 + 1,
                    column: c_idx as u32 + 1,
                });
            }
        }
    }
    Err(CoreError::NoMatchingCell {
        term: term.to_owned(),
    })
}

pub fn public_link(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=view&id={file_id}")
}

pub fn image_formula(link: &str) -> String {
    format!("=IMAGE(\"{}\")", link.replace('"', "\"\""))
}

/// Outcome of one successful upload-and-link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub cell: String,
    pub file_id: String,
    pub link: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Service,
    Oauth,
}

impl AuthMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "service" => Some(AuthMode::Service),
            "oauth" | "user" => Some(AuthMode::Oauth),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Service => "service",
            AuthMode::Oauth => "oauth",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub enabled: bool,
    pub auth_mode: AuthMode,
    pub credentials_file: String,
    pub client_secret_file: String,
    pub token_file: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub search_term: String,
    pub drive_folder_id: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_mode: AuthMode::Service,
            credentials_file: String::new(),
            client_secret_file: String::new(),
            token_file: DEFAULT_TOKEN_FILE.to_owned(),
            spreadsheet_id: String::new(),
            sheet_name: DEFAULT_SHEET_NAME.to_owned(),
            search_term: DEFAULT_SEARCH_TERM.to_owned(),
            drive_folder_id: None,
        }
    }
}

/// Where a loaded `SyncSettings` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSource {
    File,
    Environment,
    Defaults,
}

impl SyncSettings {
    pub fn parse_json(data: &str) -> Result<Self, CoreError> {
        serde_json::from_str::<SyncSettings>(data).map_err(|err| CoreError::Settings(err.to_string()))
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from environment-style key lookups. Sync is enabled
    /// only when a spreadsheet ID and the credential path for the selected
    /// auth mode are both present.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let auth_mode = get(ENV_AUTH_MODE)
            .and_then(|mode| AuthMode::parse(&mode))
            .unwrap_or(defaults.auth_mode);

        let mut settings = Self {
            enabled: false,
            auth_mode,
            credentials_file: get(ENV_CREDENTIALS_FILE).unwrap_or_default(),
            client_secret_file: get(ENV_CLIENT_SECRET_FILE).unwrap_or_default(),
            token_file: get(ENV_TOKEN_FILE).unwrap_or(defaults.token_file),
            spreadsheet_id: get(ENV_SPREADSHEET_ID).unwrap_or_default(),
            sheet_name: get(ENV_SHEET_NAME).unwrap_or(defaults.sheet_name),
            search_term: get(ENV_SEARCH_TERM).unwrap_or(defaults.search_term),
            drive_folder_id: get(ENV_DRIVE_FOLDER_ID),
        };
        settings.enabled = settings.is_configured();
        settings
    }

    /// File contents win when present and parseable, then the environment,
    /// then compiled defaults.
    pub fn resolve<F>(file_contents: Option<&str>, lookup: F) -> (Self, SettingsSource)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(Ok(settings)) = file_contents.map(Self::parse_json) {
            return (settings, SettingsSource::File);
        }

        let any_env = ENV_KEYS
            .iter()
            .any(|key| lookup(key).is_some_and(|v| !v.trim().is_empty()));
        if any_env {
            (Self::from_lookup(lookup), SettingsSource::Environment)
        } else {
            (Self::default(), SettingsSource::Defaults)
        }
    }

    /// Trims every field and fills blank optional ones with their defaults,
    /// the way the settings form saves them.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let or_default = |value: String, fallback: String| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                fallback
            } else {
                trimmed.to_owned()
            }
        };
        Self {
            enabled: self.enabled,
            auth_mode: self.auth_mode,
            credentials_file: self.credentials_file.trim().to_owned(),
            client_secret_file: self.client_secret_file.trim().to_owned(),
            token_file: or_default(self.token_file, defaults.token_file),
            spreadsheet_id: self.spreadsheet_id.trim().to_owned(),
            sheet_name: or_default(self.sheet_name, defaults.sheet_name),
            search_term: or_default(self.search_term, defaults.search_term),
            drive_folder_id: self
                .drive_folder_id
                .map(|id| id.trim().to_owned())
                .filter(|id| !id.is_empty()),
        }
    }

    /// Joins relative credential, client-secret and token paths onto `base`.
    /// Absolute and empty paths are kept as they are.
    pub fn rooted_at(&self, base: &Path) -> Self {
        let root = |value: &str| {
            let trimmed = value.trim();
            if trimmed.is_empty() || Path::new(trimmed).is_absolute() {
                trimmed.to_owned()
            } else {
                base.join(trimmed).display().to_string()
            }
        };
        Self {
            credentials_file: root(&self.credentials_file),
            client_secret_file: root(&self.client_secret_file),
            token_file: root(&self.token_file),
            ..self.clone()
        }
    }

    pub fn is_configured(&self) -> bool {
        let credential = match self.auth_mode {
            AuthMode::Service => &self.credentials_file,
            AuthMode::Oauth => &self.client_secret_file,
        };
        !self.spreadsheet_id.trim().is_empty() && !credential.trim().is_empty()
    }
}

/// Cached interactive-user token, as stored in the token file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserToken {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl UserToken {
    /// A token without an expiry never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|expiry| expiry - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Valid(UserToken),
    /// Needs a refresh (when a refresh token is known) or a full handshake.
    Stale { refresh_token: Option<String> },
}

/// Classifies the contents of a token file. Missing or unreadable files are
/// stale with nothing to refresh from.
pub fn token_state(contents: Option<&str>, now: DateTime<Utc>) -> TokenState {
    let Some(data) = contents else {
        return TokenState::Stale {
            refresh_token: None,
        };
    };
    let token = match serde_json::from_str::<UserToken>(data) {
        Ok(token) => token,
        Err(_) => {
            return TokenState::Stale {
                refresh_token: None,
            };
        }
    };
    if token.token.trim().is_empty() || token.is_expired_at(now) {
        return TokenState::Stale {
            refresh_token: token.refresh_token.filter(|t| !t.trim().is_empty()),
        };
    }
    TokenState::Valid(token)
}
