use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use clipsaver_core::{
    CoreError, SyncResult, SyncSettings, find_matching_cell, image_formula, public_link,
    qualified_reference, search_range,
};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub mod auth;
pub mod blocking;
pub mod loopback;

pub use auth::{AccessToken, Authenticator, AuthorizationRequest, Authorizer};
pub use loopback::LoopbackAuthorizer;

const PNG_MIME: &str = "image/png";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Google sync is disabled")]
    Disabled,
    #[error("credential file not found: {}", path.display())]
    CredentialNotFound { path: PathBuf },
    #[error("invalid credential file {}: {reason}", path.display())]
    InvalidCredentials { path: PathBuf, reason: String },
    #[error("authorization failed: {0}")]
    AuthHandshakeFailed(String),
    #[error("token request failed: {0}")]
    TokenRequestFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("permission grant failed: {0}")]
    PermissionGrantFailed(String),
    #[error("no cell containing '{term}' found in sheet {sheet}")]
    NoMatchingCell { term: String, sheet: String },
    #[error("sheet request failed: {0}")]
    SheetRequestFailed(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Base URLs of the Google APIs the client talks to.
///
/// Token and authorization URIs found in credential files take precedence
/// over the ones here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub auth_uri: String,
    pub token_uri: String,
    pub drive: String,
    pub drive_upload: String,
    pub sheets: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_owned(),
            token_uri: "https://oauth2.googleapis.com/token".to_owned(),
            drive: "https://www.googleapis.com/drive/v3".to_owned(),
            drive_upload: "https://www.googleapis.com/upload/drive/v3".to_owned(),
            sheets: "https://sheets.googleapis.com/v4".to_owned(),
        }
    }
}

impl Endpoints {
    /// All endpoints rooted at one base URL, laid out like Google's paths.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            auth_uri: format!("{base}/o/oauth2/auth"),
            token_uri: format!("{base}/token"),
            drive: format!("{base}/drive/v3"),
            drive_upload: format!("{base}/upload/drive/v3"),
            sheets: format!("{base}/v4"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Uploads saved images to Drive and links them into a spreadsheet cell.
pub struct SheetSync {
    settings: SyncSettings,
    endpoints: Endpoints,
    http: reqwest::Client,
    auth: Authenticator,
}

impl SheetSync {
    pub async fn connect(settings: SyncSettings) -> Result<Self, SyncError> {
        Self::connect_with(
            settings,
            Endpoints::default(),
            Arc::new(LoopbackAuthorizer::default()),
        )
        .await
    }

    /// Resolves credentials up front so a missing or rejected credential
    /// surfaces before any image is processed.
    pub async fn connect_with(
        settings: SyncSettings,
        endpoints: Endpoints,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, SyncError> {
        if !settings.enabled {
            return Err(SyncError::Disabled);
        }
        let http = reqwest::Client::new();
        let auth = Authenticator::resolve(&settings, &endpoints, http.clone(), authorizer).await?;
        info!(
            mode = %settings.auth_mode,
            spreadsheet = %settings.spreadsheet_id,
            "google sync connected"
        );
        Ok(Self {
            settings,
            endpoints,
            http,
            auth,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub async fn upload_and_link(&self, image_path: &Path) -> Result<SyncResult, SyncError> {
        let file_id = self.upload(image_path).await?;
        if let Err(err) = self.grant_public_read(&file_id).await {
            // The parent folder may already be shared.
            warn!(file_id = %file_id, "{}", err);
        }
        let link = public_link(&file_id);
        let cell = self.find_target_cell().await?;
        self.update_cell(&cell, &link).await?;
        info!(cell = %cell, file_id = %file_id, "image linked into sheet");
        Ok(SyncResult {
            cell,
            file_id,
            link,
        })
    }

    /// Creates a new Drive object named after the file, returning its id.
    pub async fn upload(&self, image_path: &Path) -> Result<String, SyncError> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|source| SyncError::Io {
                path: image_path.to_path_buf(),
                source,
            })?;
        let name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_owned());

        let mut metadata = json!({ "name": name });
        if let Some(folder) = self.settings.drive_folder_id.as_deref() {
            metadata["parents"] = json!([folder]);
        }

        let boundary = random_boundary();
        let body = multipart_related(&boundary, &metadata, PNG_MIME, &bytes);
        let url = format!(
            "{}/files?uploadType=multipart&fields=id&supportsAllDrives=true",
            self.endpoints.drive_upload
        );
        let token = self.auth.access_token().await?;

        debug!(file = %name, bytes = bytes.len(), "uploading image to drive");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|err| SyncError::UploadFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::UploadFailed(error_text(response).await));
        }

        let created: CreatedFile = response
            .json()
            .await
            .map_err(|err| SyncError::UploadFailed(format!("bad upload response: {err}")))?;
        Ok(created.id)
    }

    pub async fn grant_public_read(&self, file_id: &str) -> Result<(), SyncError> {
        let url = format!(
            "{}/files/{}/permissions?fields=id&supportsAllDrives=true",
            self.endpoints.drive, file_id
        );
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await
            .map_err(|err| SyncError::PermissionGrantFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::PermissionGrantFailed(error_text(response).await));
        }
        Ok(())
    }

    /// Sheet-qualified reference of the first cell containing the search term.
    pub async fn find_target_cell(&self) -> Result<String, SyncError> {
        let sheet = &self.settings.sheet_name;
        let url = self.values_url(&search_range(sheet))?;
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SyncError::SheetRequestFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::SheetRequestFailed(error_text(response).await));
        }

        let range: ValueRange = response
            .json()
            .await
            .map_err(|err| SyncError::SheetRequestFailed(format!("bad values response: {err}")))?;

        let cell = find_matching_cell(&range.values, &self.settings.search_term).map_err(
            |err| match err {
                CoreError::NoMatchingCell { term } => SyncError::NoMatchingCell {
                    term,
                    sheet: sheet.clone(),
                },
                other => SyncError::SheetRequestFailed(other.to_string()),
            },
        )?;
        Ok(qualified_reference(sheet, &cell.to_string()))
    }

    /// Writes an `=IMAGE(...)` formula so the sheet renders the picture inline.
    pub async fn update_cell(&self, cell: &str, link: &str) -> Result<(), SyncError> {
        let mut url = self.values_url(cell)?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        let body = json!({
            "range": cell,
            "majorDimension": "ROWS",
            "values": [[image_formula(link)]],
        });
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| SyncError::SheetRequestFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::SheetRequestFailed(error_text(response).await));
        }
        Ok(())
    }

    fn values_url(&self, range: &str) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.endpoints.sheets)
            .map_err(|err| SyncError::SheetRequestFailed(format!("bad sheets endpoint: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::SheetRequestFailed("sheets endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend([
                "spreadsheets",
                self.settings.spreadsheet_id.as_str(),
                "values",
                range,
            ]);
        Ok(url)
    }
}

async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    format!("status {status}: {text}")
}

fn random_boundary() -> String {
    let mut bytes = [0_u8; 12];
    rand::rng().fill(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("clipsaver_{suffix}")
}

/// Body of a Drive `uploadType=multipart` request: JSON metadata part
/// followed by the media part.
pub fn multipart_related(
    boundary: &str,
    metadata: &serde_json::Value,
    media_type: &str,
    media: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(media.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {media_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
