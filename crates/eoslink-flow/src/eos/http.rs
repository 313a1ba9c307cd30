//! HTTP implementation of the EOS optimizer client.
//!
//! Thin, timeout-bounded `reqwest` wrapper over the optimizer's REST
//! surface. Every call carries an explicit request timeout
//! (`EOS_HTTP_TIMEOUT_SECONDS`); connect failures, timeouts, and 5xx
//! responses surface as [`EosError::Transient`], 404 as
//! [`EosError::NotFound`], anything else as [`EosError::Fatal`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{EosClient, EosError, EosHealth, EosResult, Fetched, PredictionProvider};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for the EOS optimizer.
#[derive(Debug, Clone)]
pub struct HttpEosClient {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpEosClient {
    /// Creates a client for the optimizer at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> EosResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EosError::fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json(&self, path: &str) -> EosResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        read_json(response).await
    }

    async fn get_optional_json(&self, path: &str) -> EosResult<Fetched<Value>> {
        match self.get_json(path).await {
            Ok(value) => Ok(Fetched::Found(value)),
            Err(EosError::NotFound { message }) => Ok(Fetched::NotFound { detail: message }),
            Err(err) => Err(err),
        }
    }

    async fn put_json(&self, path: &str, body: &Value) -> EosResult<Value> {
        let response = self
            .client
            .put(self.url(path))
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        read_json(response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> EosResult<Value> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        read_json(response).await
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> EosError {
    if err.is_timeout() || err.is_connect() {
        EosError::transient(format!("EOS unreachable: {err}"))
    } else {
        EosError::fatal(format!("EOS request failed: {err}"))
    }
}

async fn read_json(response: reqwest::Response) -> EosResult<Value> {
    let status = response.status();

    if status == reqwest::StatusCode::NOT_FOUND {
        let body = response.text().await.unwrap_or_default();
        return Err(EosError::not_found(format!("404: {body}")));
    }
    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(EosError::transient(format!("status={status}: {body}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EosError::fatal(format!("status={status}: {body}")));
    }

    response
        .json()
        .await
        .map_err(|e| EosError::fatal(format!("malformed EOS response body: {e}")))
}

#[async_trait]
impl EosClient for HttpEosClient {
    async fn health(&self) -> EosResult<EosHealth> {
        let doc = self.get_json("/v1/health").await?;
        let last_run_datetime = doc
            .get("last_run_datetime")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(EosHealth {
            ok: doc
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|s| s.eq_ignore_ascii_case("alive") || s.eq_ignore_ascii_case("ok")),
            last_run_datetime,
        })
    }

    async fn get_config(&self) -> EosResult<Value> {
        self.get_json("/v1/config").await
    }

    async fn set_run_interval(&self, seconds: u64) -> EosResult<()> {
        self.put_json("/v1/config/ems/interval", &json!({ "interval": seconds }))
            .await
            .map(|_| ())
    }

    async fn get_plan(&self) -> EosResult<Fetched<Value>> {
        self.get_optional_json("/v1/energy-management/plan").await
    }

    async fn get_solution(&self) -> EosResult<Fetched<Value>> {
        self.get_optional_json("/v1/energy-management/optimization/solution")
            .await
    }

    async fn refresh_prediction(&self, provider: PredictionProvider) -> EosResult<Value> {
        self.post_json(
            &format!("/v1/prediction/update/{provider}"),
            &json!({}),
        )
        .await
    }

    async fn optimize(&self, request: Value) -> EosResult<Value> {
        self.post_json("/optimize", &request).await
    }
}
