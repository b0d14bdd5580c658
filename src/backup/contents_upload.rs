// dumpship/src/backup/contents_upload.rs
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

use super::capture::DumpArtifact;
use super::sink::Location;
use crate::config::GithubTarget;
use crate::errors::{BackupError, UploadError};

/// Above this the single-request contents API is likely to refuse the payload.
pub const CONTENTS_API_SOFT_LIMIT: u64 = 50 * 1024 * 1024;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Body of the create-file request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PutFileRequest {
    pub message: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Transport for the contents API. Returns the HTTP status of the create-file call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentsApi: Send + Sync {
    async fn put_file(&self, url: &Url, request: &PutFileRequest) -> Result<u16, UploadError>;
}

pub struct GithubContentsClient {
    client: reqwest::Client,
    token: String,
}

impl GithubContentsClient {
    pub fn new(token: &str) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(GithubContentsClient {
            client,
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl ContentsApi for GithubContentsClient {
    async fn put_file(&self, url: &Url, request: &PutFileRequest) -> Result<u16, UploadError> {
        let response = self
            .client
            .put(url.clone())
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(ACCEPT, "application/vnd.github+json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                body = %body.chars().take(512).collect::<String>(),
                "Contents API rejected the upload"
            );
        }
        Ok(status.as_u16())
    }
}

/// Uploads a completed dump as one base64 payload through a repository contents API.
pub struct RepositoryContentsBackend {
    api: Box<dyn ContentsApi>,
    target: GithubTarget,
    message: String,
}

impl RepositoryContentsBackend {
    pub fn new(api: Box<dyn ContentsApi>, target: GithubTarget, message: String) -> Self {
        RepositoryContentsBackend {
            api,
            target,
            message,
        }
    }

    /// Path of the file inside the repository.
    pub fn repo_path(&self, artifact_name: &str) -> String {
        match &self.target.path_prefix {
            Some(prefix) => format!("{}/{}", prefix, artifact_name),
            None => artifact_name.to_string(),
        }
    }

    /// `{api}/repos/{owner}/{repo}/contents/{path}`
    pub fn contents_url(&self, artifact_name: &str) -> Result<Url, UploadError> {
        let mut url = self.target.api_url.clone();
        let repo_path = self.repo_path(artifact_name);
        url.path_segments_mut()
            .map_err(|_| {
                UploadError::Transport(format!(
                    "API URL {} cannot carry a path",
                    self.target.api_url
                ))
            })?
            .pop_if_empty()
            .extend(["repos", &self.target.owner, &self.target.repo, "contents"])
            .extend(repo_path.split('/'));
        Ok(url)
    }

    pub fn describe(&self) -> String {
        format!(
            "GitHub repository {}/{} via {}",
            self.target.owner, self.target.repo, self.target.api_url
        )
    }

    pub async fn deliver(
        &self,
        artifact: DumpArtifact,
        cancel: &CancellationToken,
    ) -> Result<Location, BackupError> {
        let file = match artifact {
            DumpArtifact::File(file) => file,
            DumpArtifact::Stream(live) => {
                live.terminate().await;
                return Err(UploadError::StreamingUnsupported.into());
            }
        };

        if file.len > CONTENTS_API_SOFT_LIMIT {
            warn!(
                bytes = file.len,
                limit = CONTENTS_API_SOFT_LIMIT,
                "Dump is larger than the contents API comfortably accepts in one request"
            );
        }

        info!(path = %file.path.display(), "Encoding file to Base64");
        let content = tokio::fs::read(&file.path).await.map_err(UploadError::Io)?;
        let request = PutFileRequest {
            message: self.message.clone(),
            content: STANDARD.encode(&content),
            branch: self.target.branch.clone(),
        };
        drop(content);

        let url = self.contents_url(&file.name)?;
        info!(
            owner = %self.target.owner,
            repo = %self.target.repo,
            path = %self.repo_path(&file.name),
            "Uploading encoded backup to GitHub repository"
        );

        let status = tokio::select! {
            status = self.api.put_file(&url, &request) => status?,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled.into()),
        };
        if status != 201 {
            return Err(UploadError::HttpStatus {
                http_status: status,
            }
            .into());
        }

        info!(location = %url, "Successfully uploaded encoded backup to GitHub");
        Ok(Location::new(url.to_string()))
    }
}
