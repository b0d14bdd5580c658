// dumpship/src/backup/sink.rs
use std::fmt;
use tokio_util::sync::CancellationToken;

use super::capture::DumpArtifact;
use super::contents_upload::{GithubContentsClient, RepositoryContentsBackend};
use super::s3_upload::ObjectStoreBackend;
use crate::config::{BackupSettings, UploadTarget};
use crate::errors::{BackupError, Result};

/// Where the uploaded dump can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location(String);

impl Location {
    pub fn new(location: String) -> Self {
        Location(location)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single upload backend of a run.
pub enum UploadSink {
    RepositoryContents(RepositoryContentsBackend),
    ObjectStore(ObjectStoreBackend),
}

impl UploadSink {
    pub async fn for_settings(settings: &BackupSettings) -> Result<Self> {
        match &settings.upload_target {
            UploadTarget::RepositoryContents(target) => {
                let client = GithubContentsClient::new(&target.token)?;
                let message = settings.upload_message();
                Ok(UploadSink::RepositoryContents(RepositoryContentsBackend::new(
                    Box::new(client),
                    target.clone(),
                    message,
                )))
            }
            UploadTarget::ObjectStore(target) => Ok(UploadSink::ObjectStore(
                ObjectStoreBackend::connect(target.clone()).await,
            )),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            UploadSink::RepositoryContents(backend) => backend.describe(),
            UploadSink::ObjectStore(backend) => backend.describe(),
        }
    }

    /// Checks the destination before any dump work starts.
    pub async fn preflight(&self) -> Result<()> {
        match self {
            // The contents API cannot check write access without writing.
            UploadSink::RepositoryContents(_) => Ok(()),
            UploadSink::ObjectStore(backend) => Ok(backend.preflight().await?),
        }
    }

    /// Consumes the artifact. Called at most once per run.
    pub async fn deliver(
        &self,
        artifact: DumpArtifact,
        cancel: &CancellationToken,
    ) -> std::result::Result<Location, BackupError> {
        match self {
            UploadSink::RepositoryContents(backend) => backend.deliver(artifact, cancel).await,
            UploadSink::ObjectStore(backend) => backend.deliver(artifact, cancel).await,
        }
    }
}
