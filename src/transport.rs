use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// HTTP verb used to deliver results to their upload URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    #[default]
    Put,
    Post,
}

impl std::fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMethod::Put => write!(f, "PUT"),
            UploadMethod::Post => write!(f, "POST"),
        }
    }
}

/// Sends one result body and reports the HTTP status.
///
/// Implementations are shared by every upload of a job, so they must not
/// hold per-job state. Per-attempt timeouts are applied by the caller.
pub trait UploadTransport: Send + Sync {
    fn send(
        &self,
        method: UploadMethod,
        url: &str,
        body: &[u8],
    ) -> impl Future<Output = Result<u16, TransportError>> + Send;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    /// Reuse an existing client (and its connection pool).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl UploadTransport for ReqwestTransport {
    async fn send(
        &self,
        method: UploadMethod,
        url: &str,
        body: &[u8],
    ) -> Result<u16, TransportError> {
        let request = match method {
            UploadMethod::Put => self.client.put(url),
            UploadMethod::Post => self.client.post(url),
        };
        let response = request.body(body.to_vec()).send().await?;
        Ok(response.status().as_u16())
    }
}
