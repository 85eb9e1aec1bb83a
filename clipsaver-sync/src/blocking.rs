//! Synchronous facade for callers that live on plain threads.

use std::{path::Path, sync::Arc};

use clipsaver_core::{SyncResult, SyncSettings};
use tokio::runtime::{Builder, Runtime};

use crate::{Authorizer, Endpoints, LoopbackAuthorizer, SheetSync, SyncError};

/// Owns a current-thread runtime so the HTTP connection pool always runs on
/// the runtime that created it.
pub struct BlockingSheetSync {
    runtime: Runtime,
    inner: SheetSync,
}

impl BlockingSheetSync {
    pub fn connect(settings: SyncSettings) -> Result<Self, SyncError> {
        Self::connect_with(
            settings,
            Endpoints::default(),
            Arc::new(LoopbackAuthorizer::default()),
        )
    }

    pub fn connect_with(
        settings: SyncSettings,
        endpoints: Endpoints,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, SyncError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| SyncError::Io {
                path: Default::default(),
                source,
            })?;
        let inner = runtime.block_on(SheetSync::connect_with(settings, endpoints, authorizer))?;
        Ok(Self { runtime, inner })
    }

    pub fn settings(&self) -> &SyncSettings {
        self.inner.settings()
    }

    pub fn upload_and_link(&self, image_path: &Path) -> Result<SyncResult, SyncError> {
        self.runtime.block_on(self.inner.upload_and_link(image_path))
    }
}
