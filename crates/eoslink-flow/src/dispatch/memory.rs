//! In-memory webhook sender for testing.
//!
//! Records every request and returns scripted responses, so engine
//! tests can assert exactly which outbound calls were made.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{WebhookRequest, WebhookSender};
use crate::error::{Error, Result};

/// A scripted response for the next delivery attempt.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Respond with this HTTP status.
    Status(u16),
    /// Fail at the transport level with this message.
    TransportError(String),
}

#[derive(Debug, Default)]
struct Inner {
    requests: Vec<WebhookRequest>,
    script: VecDeque<ScriptedResponse>,
}

/// Recording webhook sender.
///
/// Responds `200` once the script is exhausted.
#[derive(Debug, Default)]
pub struct MemoryWebhookSender {
    inner: Mutex<Inner>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("lock poisoned")
}

impl MemoryWebhookSender {
    /// Creates a sender that answers every request with `200`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a scripted response for the next attempt.
    pub fn push_response(&self, response: ScriptedResponse) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.script.push_back(response);
        }
    }

    /// Returns all requests made so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn requests(&self) -> Result<Vec<WebhookRequest>> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.requests.clone())
    }

    /// Returns the number of requests made so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn request_count(&self) -> Result<usize> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.requests.len())
    }
}

#[async_trait]
impl WebhookSender for MemoryWebhookSender {
    async fn send(&self, request: WebhookRequest) -> Result<u16> {
        let response = {
            let mut inner = self.inner.lock().map_err(poison_err)?;
            inner.requests.push(request);
            inner.script.pop_front()
        };

        match response {
            None | Some(ScriptedResponse::Status(200)) => Ok(200),
            Some(ScriptedResponse::Status(status)) => Ok(status),
            Some(ScriptedResponse::TransportError(message)) => Err(Error::dispatch(message)),
        }
    }
}
