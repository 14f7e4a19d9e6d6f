//! HTTP implementation of [`ConnectionBackend`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use keyscope_shared::{Connection, ConnectionId, ConnectionParams};

use crate::error::BackendError;
use crate::recovery::ConnectionBackend;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `POST /api/connections`.
#[derive(Debug, Serialize)]
struct CreateConnectionRequest<'a> {
    #[serde(flatten)]
    params: &'a ConnectionParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a ConnectionId>,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/connections{}", self.base_url, path)
    }
}

#[async_trait]
impl ConnectionBackend for HttpBackend {
    async fn connection_exists(&self, id: &ConnectionId) -> Result<bool, BackendError> {
        let resp = self.client.get(self.url(&format!("/{id}"))).send().await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(BackendError::Status {
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn create_connection(
        &self,
        params: &ConnectionParams,
        id: Option<&ConnectionId>,
    ) -> Result<Connection, BackendError> {
        debug!(name = %params.name, requested = ?id, "Creating backend connection");

        let resp = self
            .client
            .post(self.url(""))
            .json(&CreateConnectionRequest { params, id })
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            let id = id.cloned().unwrap_or_else(|| ConnectionId::from(""));
            return Err(BackendError::IdConflict(id));
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json::<Connection>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}
