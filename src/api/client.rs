//! HTTP client for the chat server's REST endpoints

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot read {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entry of the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(alias = "conversation_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The server answers with either a bare list or a wrapped one
#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationList {
    Bare(Vec<ConversationSummary>),
    Wrapped {
        conversations: Vec<ConversationSummary>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(default, alias = "file_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /api/conversations, optionally scoped to a project
    pub async fn list_conversations(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = format!("{}/api/conversations", self.base_url);
        let mut request = self.http.get(&url);
        if let Some(project_id) = project_id {
            request = request.query(&[("project_id", project_id)]);
        }
        debug!(url = %url, project_id = ?project_id, "Listing conversations");

        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;
        let response = check_status(&url, response).await?;
        let list: ConversationList = response
            .json()
            .await
            .map_err(|source| ApiError::Decode { url, source })?;
        Ok(match list {
            ConversationList::Bare(items) => items,
            ConversationList::Wrapped { conversations } => conversations,
        })
    }

    /// Multipart POST /api/upload attaching a file to a conversation
    pub async fn upload_file(
        &self,
        path: &Path,
        conversation_id: Option<&str>,
    ) -> Result<UploadedFile, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mut form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.clone()));
        if let Some(conversation_id) = conversation_id {
            form = form.text("conversation_id", conversation_id.to_string());
        }

        let url = format!("{}/api/upload", self.base_url);
        debug!(url = %url, file = %file_name, conversation_id = ?conversation_id, "Uploading file");
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response).await?;
        response
            .json()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }
}

async fn check_status(url: &str, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}
