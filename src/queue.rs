//! Downstream work queue. Messages sharing an ordering key are delivered in
//! submission order; nothing is promised across keys.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::QueueError;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, content: &str, ordering_key: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub body: String,
    pub ordering_key: String,
}

/// Serialize forwarded text into the payload the downstream consumer reads.
pub fn encode_body(content: &str) -> Result<String, QueueError> {
    Ok(serde_json::to_string(&json!({ "content": content }))?)
}

/// Posts messages to a FIFO queue front-end over HTTP.
#[derive(Debug, Clone)]
pub struct HttpWorkQueue {
    client: Client,
    url: String,
}

impl HttpWorkQueue {
    pub fn new(url: impl Into<String>) -> Result<Self, QueueError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WorkQueue for HttpWorkQueue {
    async fn enqueue(&self, content: &str, ordering_key: &str) -> Result<(), QueueError> {
        let message = QueuedMessage {
            body: encode_body(content)?,
            ordering_key: ordering_key.to_string(),
        };
        let response = self.client.post(&self.url).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(QueueError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        tracing::info!(
            target = "case_bridge::queue",
            ordering_key = %ordering_key,
            "content enqueued"
        );
        Ok(())
    }
}

/// Stands in when no queue endpoint is configured: every forward is
/// refused, so callers see the failure instead of a silent drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledWorkQueue;

#[async_trait]
impl WorkQueue for DisabledWorkQueue {
    async fn enqueue(&self, _content: &str, ordering_key: &str) -> Result<(), QueueError> {
        tracing::warn!(
            target = "case_bridge::queue",
            ordering_key = %ordering_key,
            "no queue configured, forward refused"
        );
        Err(QueueError::Closed)
    }
}

/// Keeps every message in memory. Test double for the downstream queue.
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.messages.lock().clone()
    }

    pub fn drain(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, content: &str, ordering_key: &str) -> Result<(), QueueError> {
        let message = QueuedMessage {
            body: encode_body(content)?,
            ordering_key: ordering_key.to_string(),
        };
        self.messages.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use super::{DisabledWorkQueue, HttpWorkQueue, MemoryWorkQueue, WorkQueue};
    use crate::error::QueueError;

    #[tokio::test]
    async fn http_queue_posts_body_and_ordering_key() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST).path("/enqueue").json_body(json!({
                "body": "{\"content\":\"how do I rotate keys?\"}",
                "ordering_key": "om_1"
            }));
            then.status(200);
        });

        let queue = HttpWorkQueue::new(server.url("/enqueue")).unwrap();
        queue.enqueue("how do I rotate keys?", "om_1").await.unwrap();
        send.assert();
    }

    #[tokio::test]
    async fn http_queue_reports_rejection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/enqueue");
            then.status(503).body("throttled");
        });

        let queue = HttpWorkQueue::new(server.url("/enqueue")).unwrap();
        let err = queue.enqueue("x", "om_1").await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected { status: 503, ref message } if message == "throttled"));
    }

    #[tokio::test]
    async fn memory_queue_keeps_submission_order() {
        let queue = MemoryWorkQueue::new();
        queue.enqueue("first", "om_1").await.unwrap();
        queue.enqueue("second", "om_1").await.unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, "{\"content\":\"first\"}");
        assert_eq!(drained[1].body, "{\"content\":\"second\"}");
        assert!(queue.messages().is_empty());
    }

    #[tokio::test]
    async fn disabled_queue_refuses_forwards() {
        let err = DisabledWorkQueue.enqueue("x", "om_1").await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
