//! Output file lifecycle: registration, download marking, and deletion.
//!
//! Physical deletion goes through the [`ArtifactStorage`] collaborator;
//! only after the bytes are confirmed gone does the `deleted` flag flip.
//! Two overlapping sweeps may select the same file, so "already gone"
//! counts as success.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{Checksum, OutputFile};
use crate::store::{OutputFileStore, Page, PageRequest, StoreError};

/// Physical removal of output-file bytes, addressed by url.
pub trait ArtifactStorage: Send + Sync {
    fn remove<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), ArtifactError>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactError {
    /// The artifact is already gone; deletion treats this as success.
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("output file not found: {0}")]
    NotFound(Uuid),
    /// The flags are left untouched so a later sweep retries.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct OutputFileManager {
    files: Box<dyn OutputFileStore>,
    artifacts: Arc<dyn ArtifactStorage>,
    clock: Arc<dyn Clock>,
}

impl OutputFileManager {
    pub fn new(
        files: Box<dyn OutputFileStore>,
        artifacts: Arc<dyn ArtifactStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            files,
            artifacts,
            clock,
        }
    }

    /// Register an artifact produced by an execution. New files start
    /// `downloaded = false, deleted = false`.
    pub async fn register_output_file(
        &self,
        exec_id: Uuid,
        name: String,
        checksum: Checksum,
        url: String,
        size_bytes: u64,
    ) -> Result<OutputFile, StoreError> {
        let file = OutputFile::new(exec_id, name, checksum, url, size_bytes, self.clock.now());
        self.files.insert(&file).await?;
        info!(file_id = %file.id, exec_id = %exec_id, size_bytes, "output file registered");
        Ok(file)
    }

    /// Idempotent; set by the download-serving collaborator.
    pub async fn mark_downloaded(&self, file_id: Uuid) -> Result<(), StoreError> {
        self.files.set_downloaded(file_id).await
    }

    pub async fn find_downloaded_not_deleted(
        &self,
        tenant: &str,
        page: PageRequest,
    ) -> Result<Page<OutputFile>, StoreError> {
        self.files.find_downloaded_not_deleted(tenant, page).await
    }

    pub async fn find_by_exec_id(&self, exec_id: Uuid) -> Result<Vec<OutputFile>, StoreError> {
        self.files.find_by_exec_id(exec_id).await
    }

    /// Remove the physical artifact, then flip `deleted`. A concurrent
    /// sweep may already have removed the bytes; that is still a success.
    /// On storage failure nothing is flipped and the next sweep retries.
    pub async fn delete_file(&self, file_id: Uuid) -> Result<(), DeleteError> {
        let file = self
            .files
            .get(file_id)
            .await?
            .ok_or(DeleteError::NotFound(file_id))?;
        if file.deleted {
            debug!(file_id = %file_id, "file already deleted, no-op");
            return Ok(());
        }

        match self.artifacts.remove(&file.url).await {
            Ok(()) => {}
            Err(ArtifactError::NotFound(url)) => {
                debug!(file_id = %file_id, %url, "artifact already gone");
            }
            Err(ArtifactError::Unavailable(reason)) => {
                return Err(DeleteError::StorageUnavailable(reason));
            }
        }

        self.files.set_deleted(file_id).await?;
        metrics::counter!("conveyor_files_deleted_total").increment(1);
        info!(file_id = %file_id, url = %file.url, "output file deleted");
        Ok(())
    }
}
