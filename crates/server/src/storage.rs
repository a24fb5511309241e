use std::path::Path;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use common::StorageRef;

use crate::config::ServerConfig;

/// HTTP object-store client. Uploads are best-effort: when the remote is
/// disabled, unconfigured, or failing, assets fall back to locally-served
/// files and the server stays fully functional.
#[derive(Clone)]
pub struct RemoteStorage {
    client: Client,
    enabled: bool,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

pub struct StoredObject {
    pub url: String,
    pub storage_ref: StorageRef,
}

pub fn local_media_url(base_url: &str, file_name: &str) -> String {
    format!("{}/media/{}", base_url, file_name)
}

pub fn local_cover_url(base_url: &str, file_name: &str) -> String {
    format!("{}/covers/{}", base_url, file_name)
}

impl RemoteStorage {
    pub fn new(config: &ServerConfig) -> Result<RemoteStorage, reqwest::Error> {
        let client = Client::builder().user_agent("tonefall/0.1").build()?;
        Ok(RemoteStorage {
            client,
            enabled: config.storage_enabled,
            endpoint: config.storage_endpoint.trim().trim_end_matches('/').to_string(),
            api_key: config.storage_api_key.clone(),
            timeout: Duration::from_secs(config.storage_timeout_secs),
        })
    }

    /// Pushes a local file to the remote store. On success the local copy
    /// is removed and the asset points at the remote object; on any
    /// failure the local file stays and `local_url` becomes the playable
    /// address.
    pub async fn store_media(
        &self,
        folder: &str,
        local_path: &Path,
        file_name: &str,
        local_url: String,
    ) -> StoredObject {
        match self.upload(folder, local_path, file_name).await {
            Ok(url) => {
                if let Err(err) = tokio::fs::remove_file(local_path).await {
                    warn!("Failed to remove {} after upload: {}", local_path.display(), err);
                }
                info!("Stored {}/{} remotely", folder, file_name);
                StoredObject {
                    url,
                    storage_ref: StorageRef::Remote {
                        id: format!("{}/{}", folder, file_name),
                    },
                }
            }
            Err(err) => {
                if self.enabled {
                    warn!("Remote upload of {} failed ({}); serving local copy", file_name, err);
                }
                StoredObject {
                    url: local_url,
                    storage_ref: StorageRef::Local {
                        file_name: file_name.to_string(),
                    },
                }
            }
        }
    }

    async fn upload(&self, folder: &str, path: &Path, file_name: &str) -> Result<String, String> {
        if !self.enabled || self.endpoint.is_empty() {
            return Err("remote storage not configured".to_string());
        }
        let data = tokio::fs::read(path).await.map_err(|err| err.to_string())?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let url = format!("{}/{}/{}", self.endpoint, folder, file_name);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, mime.as_ref())
            .timeout(self.timeout)
            .body(data)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }
        Ok(url)
    }

    /// Removes the stored bytes behind a ref: remote objects get a DELETE
    /// call, local files are unlinked from `local_dir`.
    pub async fn delete(&self, storage_ref: &StorageRef, local_dir: &Path) -> Result<(), String> {
        match storage_ref {
            StorageRef::Remote { id } => {
                if self.endpoint.is_empty() {
                    return Err("remote storage not configured".to_string());
                }
                let url = format!("{}/{}", self.endpoint, id);
                let response = self
                    .client
                    .delete(&url)
                    .bearer_auth(&self.api_key)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|err| err.to_string())?;
                if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
                    Ok(())
                } else {
                    Err(format!("unexpected status {}", response.status()))
                }
            }
            StorageRef::Local { file_name } => {
                tokio::fs::remove_file(local_dir.join(file_name))
                    .await
                    .map_err(|err| err.to_string())
            }
        }
    }
}
