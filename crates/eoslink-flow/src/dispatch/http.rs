//! Reqwest-backed webhook delivery.

use std::time::Duration;

use async_trait::async_trait;

use super::{WebhookRequest, WebhookSender};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Production webhook sender over HTTP.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    /// Creates a sender with a shared connection pool.
    ///
    /// # Errors
    ///
    /// Returns a dispatch error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::dispatch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, request: WebhookRequest) -> Result<u16> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| Error::dispatch(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body)
            .timeout(Duration::from_secs(request.timeout_seconds));

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("webhook request failed: {e}")))?;

        Ok(response.status().as_u16())
    }
}
