//! HTTP surface of the coordination server.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{config::SessionConfig, error::ServerError, protocol::Blob};

pub type Result<T> = std::result::Result<T, ServerError>;

/// A unit of work handed out by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Assignment {
    /// Train on the batch found at `url`.
    Train { url: String },
    /// Measure the accuracy of model `version` on test batch `batch`.
    #[serde(alias = "Test")]
    Validate {
        version: u32,
        batch: u32,
        url: String,
        model_url: String,
    },
}

/// Accuracy reported back for a validation assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub version: u32,
    pub batch: u32,
    pub accuracy: f64,
}

/// One shot registration that yields the training socket's url.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register_training_worker(&self) -> Result<String>;
}

/// The task and model endpoints the orchestration loop consumes.
#[async_trait]
pub trait PlaygroundServer: Registrar {
    async fn assign(&self) -> Result<Assignment>;

    async fn submit_validation(&self, result: &ValidationResult) -> Result<()>;

    /// Storage bytes of the most recent model version.
    async fn most_recent_model(&self) -> Result<Vec<u8>>;

    /// Blob url of the best scoring model.
    async fn best_model_url(&self) -> Result<String>;

    /// Blob url of the model configuration.
    async fn model_config_url(&self) -> Result<String>;

    /// Downloads the blob behind a `prefix|path` url.
    async fn fetch_blob(&self, url: &str) -> Result<Blob>;
}

/// `reqwest` backed client.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    blob_base_url: String,
}

impl ServerClient {
    /// Creates a new `ServerClient`.
    ///
    /// # Arguments
    /// * `config` - Provides the server and blob store base urls.
    ///
    /// # Returns
    /// A new `ServerClient` instance.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.server_url().trim_end_matches('/').to_string(),
            blob_base_url: config.blob_url().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        debug!("GET {url}");
        let response = self.http.get(url).send().await?;
        check_status(url, response)
    }

    /// Resolves a `prefix|path` blob url into a plain http url.
    ///
    /// # Errors
    /// `ServerError::UnsupportedPrefix` for storage backends this client
    /// can't reach.
    pub fn resolve_blob_url(&self, url: &str) -> Result<String> {
        let Some((prefix, path)) = url.split_once('|') else {
            if url.starts_with("http://") || url.starts_with("https://") {
                return Ok(url.to_string());
            }

            return Err(ServerError::UnsupportedPrefix(url.to_string()));
        };

        match prefix {
            "local" => {
                let path = path.strip_prefix('/').unwrap_or(path);
                Ok(format!("{}/{path}", self.blob_base_url))
            }
            "http" | "https" => Ok(path.to_string()),
            other => Err(ServerError::UnsupportedPrefix(other.to_string())),
        }
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(ServerError::Status {
            url: url.to_string(),
            status,
        });
    }

    Ok(response)
}

#[async_trait]
impl Registrar for ServerClient {
    async fn register_training_worker(&self) -> Result<String> {
        let url = self.endpoint("register");
        let text = self.get(&url).await?.text().await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl PlaygroundServer for ServerClient {
    async fn assign(&self) -> Result<Assignment> {
        let url = self.endpoint("assign");
        Ok(self.get(&url).await?.json().await?)
    }

    async fn submit_validation(&self, result: &ValidationResult) -> Result<()> {
        let url = self.endpoint("submit_test");
        debug!("POST {url}");
        let response = self.http.post(&url).json(result).send().await?;
        check_status(&url, response)?;
        Ok(())
    }

    async fn most_recent_model(&self) -> Result<Vec<u8>> {
        let url = self.endpoint("recent");
        Ok(self.get(&url).await?.bytes().await?.to_vec())
    }

    async fn best_model_url(&self) -> Result<String> {
        let url = self.endpoint("best");
        Ok(self.get(&url).await?.json().await?)
    }

    async fn model_config_url(&self) -> Result<String> {
        let url = self.endpoint("config");
        Ok(self.get(&url).await?.json().await?)
    }

    async fn fetch_blob(&self, url: &str) -> Result<Blob> {
        let resolved = self.resolve_blob_url(url)?;
        let bytes = self.get(&resolved).await?.bytes().await?;
        Ok(Blob::from(&bytes[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ServerClient {
        let config = SessionConfig::default()
            .with_server_url("http://localhost:8000/")
            .with_blob_url("http://localhost:9900");
        ServerClient::new(&config)
    }

    #[test]
    fn resolves_local_blob_urls() {
        let client = client();
        assert_eq!(
            client.resolve_blob_url("local|/digits/train_3.bin").unwrap(),
            "http://localhost:9900/digits/train_3.bin"
        );
        assert_eq!(
            client.resolve_blob_url("local|digits/model.xml").unwrap(),
            "http://localhost:9900/digits/model.xml"
        );
        assert_eq!(client.endpoint("assign"), "http://localhost:8000/assign");
    }

    #[test]
    fn rejects_unknown_storage_prefixes() {
        let err = client()
            .resolve_blob_url("azure-fs|share/model.bin")
            .unwrap_err();
        assert!(matches!(err, ServerError::UnsupportedPrefix(p) if p == "azure-fs"));
        assert!(client().resolve_blob_url("https://cdn/x.bin").is_ok());
    }

    #[test]
    fn parses_assignments() {
        let train: Assignment =
            serde_json::from_str(r#"{"type":"Train","url":"local|digits/0.bin"}"#).unwrap();
        assert_eq!(
            train,
            Assignment::Train {
                url: "local|digits/0.bin".into()
            }
        );

        let test: Assignment = serde_json::from_str(
            r#"{"type":"Test","version":3,"batch":1,"url":"local|t/1.bin","model_url":"local|m/3.bin"}"#,
        )
        .unwrap();
        assert!(matches!(test, Assignment::Validate { version: 3, batch: 1, .. }));
    }
}
