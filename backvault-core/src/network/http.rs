/*!
HTTP network adapter.

Speaks the client files API:

- `GET  {base}/api/check-health`
- `POST {base}/api/clients/v1/files[?directory_id=..]` (multipart field `file`)
- `GET  {base}/api/clients/v1/files/{id}`, falling back to `.../{id}/download` on HTTP 400

and, outside the [`NetworkAdapter`] contract, the remote directories that group uploads:

- `GET    {base}/api/clients/v1/directories`
- `POST   {base}/api/clients/v1/directories` (JSON `name`, `description`)
- `GET    {base}/api/clients/v1/directories/{id}` (includes the directory's files)
- `DELETE {base}/api/clients/v1/directories/{id}`

Every request carries `Client-ID` / `Client-Secret` headers and is bounded by a
per-attempt timeout.
*/

use async_trait::async_trait;
use backvault_retry::{permanent_error, transient_error, with_retry, RetryError, RetryPolicy};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::NetworkAdapter;
use crate::{BackupError, Result};

const HEALTH_ENDPOINT: &str = "/api/check-health";
const FILES_ENDPOINT: &str = "/api/clients/v1/files";
const DIRECTORIES_ENDPOINT: &str = "/api/clients/v1/directories";

/// Connection settings for [`HttpNetwork`]
#[derive(Clone)]
pub struct HttpNetworkConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub directory_id: Option<String>,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for HttpNetworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("directory_id", &self.directory_id)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
struct UploadData {
    #[serde(default)]
    id: String,
    #[serde(default)]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    data: UploadData,
}

/// A remote directory as reported by the directories API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDirectory {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub total_size: u64,
}

/// A file stored in a remote directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryDetail {
    #[serde(flatten)]
    directory: RemoteDirectory,
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct CreateDirectoryRequest<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Pull a human readable message out of an error response body
fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(error),
            code: Some(code),
            ..
        }) => format!("API error {code}: {error}"),
        Ok(ErrorBody {
            error: Some(msg), ..
        })
        | Ok(ErrorBody {
            message: Some(msg), ..
        }) => format!("API error (status {}): {msg}", status.as_u16()),
        _ => format!("status {}: {}", status.as_u16(), body.trim()),
    }
}

/// Map a transport-level failure to a retry classification
fn classify_transport(operation: &'static str, err: reqwest::Error) -> RetryError {
    if err.is_builder() {
        permanent_error!(operation, BackupError::client(None, err.to_string()))
    } else {
        transient_error!(operation, BackupError::transient(operation, err.to_string()))
    }
}

/// Accept 2xx; 5xx is transient, anything else permanent
async fn check_status(operation: &'static str, response: Response) -> std::result::Result<Response, RetryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(status, &body);
    if status.is_server_error() {
        Err(transient_error!(operation, BackupError::transient(operation, message)))
    } else {
        Err(permanent_error!(
            operation,
            BackupError::client(Some(status.as_u16()), message)
        ))
    }
}

/// [`NetworkAdapter`] over the HTTP files API
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    config: HttpNetworkConfig,
}

impl HttpNetwork {
    pub fn new(config: HttpNetworkConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(BackupError::config("api base URL must not be empty"));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackupError::config(format!("failed to build HTTP client: {e}")))?;

        info!(base_url = %config.base_url, "Initialized HTTP network adapter");
        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Client-ID", &self.config.client_id)
            .header("Client-Secret", &self.config.client_secret)
    }

    /// Send a request built fresh for every attempt, under the retry policy
    async fn send<F>(&self, operation: &'static str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = with_retry(operation, &self.config.retry, |attempt| {
            if attempt > 1 {
                #[cfg(feature = "metrics")]
                crate::observability::BackupMetrics::global().record_retry();
            }
            let request = self.authorized(build());
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| classify_transport(operation, e))?;
                check_status(operation, response).await
            }
        })
        .await?;

        Ok(response)
    }

    async fn read_body(operation: &'static str, response: Response) -> Result<Bytes> {
        response
            .bytes()
            .await
            .map_err(|e| BackupError::transient(operation, format!("failed to read response body: {e}")))
    }

    async fn read_data<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: Response,
    ) -> Result<T> {
        let body = Self::read_body(operation, response).await?;
        let envelope: DataEnvelope<T> = serde_json::from_slice(&body).map_err(|e| {
            BackupError::client(None, format!("failed to parse {operation} response: {e}"))
        })?;
        Ok(envelope.data)
    }

    /// Directory uploads are filed under, if any
    pub fn directory_id(&self) -> Option<&str> {
        self.config.directory_id.as_deref().filter(|d| !d.is_empty())
    }

    /// File subsequent uploads under `directory_id`
    pub fn set_directory_id(&mut self, directory_id: impl Into<String>) {
        self.config.directory_id = Some(directory_id.into());
    }

    pub async fn list_directories(&self) -> Result<Vec<RemoteDirectory>> {
        let url = self.url(DIRECTORIES_ENDPOINT);
        let response = self.send("list_directories", || self.client.get(&url)).await?;
        let directories: Option<Vec<RemoteDirectory>> =
            Self::read_data("list_directories", response).await?;
        Ok(directories.unwrap_or_default())
    }

    pub async fn create_directory(&self, name: &str, description: &str) -> Result<RemoteDirectory> {
        if name.trim().is_empty() {
            return Err(BackupError::validation("directory name must not be empty"));
        }

        let url = self.url(DIRECTORIES_ENDPOINT);
        let request = CreateDirectoryRequest { name, description };
        let response = self
            .send("create_directory", || self.client.post(&url).json(&request))
            .await?;
        let directory: RemoteDirectory = Self::read_data("create_directory", response).await?;
        if directory.id.is_empty() {
            return Err(BackupError::client(
                None,
                "create directory response did not include an id",
            ));
        }

        info!(id = %directory.id, name = %directory.name, "Created remote directory");
        Ok(directory)
    }

    /// Files stored in the directory `id`
    pub async fn directory_files(&self, id: &str) -> Result<Vec<RemoteFile>> {
        let url = self.url(&format!("{DIRECTORIES_ENDPOINT}/{id}"));
        let response = self.send("get_directory", || self.client.get(&url)).await?;
        let detail: DirectoryDetail = Self::read_data("get_directory", response).await?;
        debug!(id, name = %detail.directory.name, files = detail.files.len(), "Fetched directory");
        Ok(detail.files)
    }

    pub async fn delete_directory(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("{DIRECTORIES_ENDPOINT}/{id}"));
        self.send("delete_directory", || self.client.delete(&url))
            .await?;
        info!(id, "Removed remote directory");
        Ok(())
    }

    /// Look up the remote id of the file whose hash is `hash` in the configured directory
    pub async fn find_file_by_hash(&self, hash: &str) -> Result<String> {
        let directory_id = self
            .directory_id()
            .ok_or_else(|| BackupError::config("api.directory_id is not set"))?;

        self.directory_files(directory_id)
            .await?
            .into_iter()
            .find(|file| file.hash == hash)
            .map(|file| file.id)
            .ok_or_else(|| {
                BackupError::client(
                    Some(404),
                    format!("file with hash {hash} not found in directory {directory_id}"),
                )
            })
    }
}

#[async_trait]
impl NetworkAdapter for HttpNetwork {
    async fn upload(&self, path: &Path, data: Bytes, size: u64, checksum: &str) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let url = self.url(FILES_ENDPOINT);

        debug!(path = %path.display(), size, checksum, "Uploading file");

        let response = self
            .send("upload", || {
                let part = Part::stream_with_length(data.clone(), size).file_name(file_name.clone());
                let mut request = self.client.post(&url).multipart(Form::new().part("file", part));
                if let Some(directory_id) = self.directory_id() {
                    request = request.query(&[("directory_id", directory_id)]);
                }
                request
            })
            .await?;

        let body = Self::read_body("upload", response).await?;
        let parsed: UploadResponse = serde_json::from_slice(&body)
            .map_err(|e| BackupError::client(None, format!("failed to parse upload response: {e}")))?;

        let remote_id = if parsed.data.id.is_empty() {
            parsed.data.hash
        } else {
            parsed.data.id
        };
        if remote_id.is_empty() {
            return Err(BackupError::client(
                None,
                "upload response did not include a file id",
            ));
        }

        debug!(path = %path.display(), remote_id = %remote_id, "Upload accepted");
        Ok(remote_id)
    }

    async fn download(&self, remote_id: &str) -> Result<Bytes> {
        let primary = self.url(&format!("{FILES_ENDPOINT}/{remote_id}"));

        match self.send("download", || self.client.get(&primary)).await {
            Ok(response) => Self::read_body("download", response).await,
            Err(BackupError::PermanentClient {
                status: Some(400),
                message,
            }) => {
                let fallback = self.url(&format!("{FILES_ENDPOINT}/{remote_id}/download"));
                debug!(remote_id, endpoint = %fallback, "Trying alternative download endpoint");

                match self.send("download", || self.client.get(&fallback)).await {
                    Ok(response) => Self::read_body("download", response).await,
                    Err(e) => {
                        warn!(remote_id, error = %e, "Alternative download endpoint failed");
                        Err(BackupError::client(Some(400), message))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let url = self.url(HEALTH_ENDPOINT);
        let response = self.send("health_check", || self.client.get(&url)).await?;
        let body = Self::read_body("health_check", response).await?;

        let health: HealthResponse = serde_json::from_slice(&body).unwrap_or_default();
        info!(status = %health.status, "API health check successful");
        Ok(())
    }
}
