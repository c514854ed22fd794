use std::time::Duration;

use async_trait::async_trait;
use tasklane_store::Database;

/// One dependency check behind `GET /health`. Errors are plain messages.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

pub struct DatabaseProbe {
    db: Database,
}

impl DatabaseProbe {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    async fn check(&self) -> Result<(), String> {
        let db = self.db.clone();
        match tokio::task::spawn_blocking(move || db.ping()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Checks the object store by issuing a GET against its endpoint. Without a
/// configured endpoint there is nothing to check.
pub struct ObjectStoreProbe {
    url: Option<String>,
    client: reqwest::Client,
}

impl ObjectStoreProbe {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[async_trait]
impl HealthProbe for ObjectStoreProbe {
    async fn check(&self) -> Result<(), String> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("endpoint returned {status}"))
        }
    }
}
