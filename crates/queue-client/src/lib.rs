//! Thin client crate wrapping the external queue transport (C11), grounded
//! on the shape of the retrieved `tx-sitter-client` crate: one struct
//! holding the transport handle, every public method `#[instrument]`'d,
//! wire types split into their own `data` module.
//!
//! Two implementations share the [`Queue`] trait: [`SqsQueueClient`] for
//! production and [`InMemoryQueue`] for tests. At-least-once delivery is
//! the queue's responsibility; the Anchor Service's idempotent persistence
//! (Anchor Store conflict-ignore + Request Store upsert-by-cid) is what
//! makes redelivery safe.

pub mod data;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use tracing::instrument;

pub use data::BatchDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue transport error: {0}")]
    Transport(String),
    #[error("malformed queue message body: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single in-flight message. Exactly one of `ack`/`nack` must be called;
/// dropping it without either leaves it to the queue's own visibility
/// timeout to redeliver.
#[async_trait]
pub trait Message: Send + Sync {
    fn data(&self) -> &BatchDescriptor;
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Returns at most one in-flight message, waiting up to
    /// `visibility_timeout` for one to arrive. `None` means nothing was
    /// available within that window.
    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<Box<dyn Message>>>;
}

/// Production backend: Amazon SQS via `aws-sdk-sqs`.
pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
}

impl SqsQueueClient {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub async fn from_env(queue_url: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), queue_url)
    }
}

struct SqsMessage {
    client: Client,
    queue_url: String,
    receipt_handle: String,
    descriptor: BatchDescriptor,
}

#[async_trait]
impl Message for SqsMessage {
    fn data(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self), fields(batch_id = %self.descriptor.batch_id))]
    async fn ack(self: Box<Self>) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(batch_id = %self.descriptor.batch_id))]
    async fn nack(self: Box<Self>) -> Result<()> {
        // Visibility timeout 0 makes the message immediately eligible for
        // redelivery instead of waiting out its original timeout.
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Queue for SqsQueueClient {
    #[instrument(skip(self))]
    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<Box<dyn Message>>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .visibility_timeout(visibility_timeout.as_secs() as i32)
            .wait_time_seconds(0)
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        let Some(message) = response.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let body = message.body.unwrap_or_default();
        let descriptor: BatchDescriptor = serde_json::from_str(&body)?;
        let receipt_handle = message
            .receipt_handle
            .ok_or_else(|| Error::Transport("message had no receipt handle".to_string()))?;

        Ok(Some(Box::new(SqsMessage {
            client: self.client.clone(),
            queue_url: self.queue_url.clone(),
            receipt_handle,
            descriptor,
        })))
    }
}

/// In-memory backend for tests: a FIFO of pending descriptors, shared via
/// `Arc` so in-flight messages can nack themselves back onto it without
/// borrowing the queue.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    pending: std::sync::Arc<Mutex<VecDeque<BatchDescriptor>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, descriptor: BatchDescriptor) {
        self.pending.lock().expect("queue mutex poisoned").push_back(descriptor);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct InMemoryMessage {
    pending: std::sync::Arc<Mutex<VecDeque<BatchDescriptor>>>,
    descriptor: BatchDescriptor,
}

#[async_trait]
impl Message for InMemoryMessage {
    fn data(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.pending
            .lock()
            .expect("queue mutex poisoned")
            .push_front(self.descriptor.clone());
        Ok(())
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn receive(&self, _visibility_timeout: Duration) -> Result<Option<Box<dyn Message>>> {
        let descriptor = self.pending.lock().expect("queue mutex poisoned").pop_front();
        Ok(descriptor.map(|descriptor| -> Box<dyn Message> {
            Box::new(InMemoryMessage {
                pending: self.pending.clone(),
                descriptor,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn descriptor(batch_id: &str) -> BatchDescriptor {
        BatchDescriptor {
            batch_id: batch_id.to_string(),
            request_ids: vec![Uuid::new_v4()],
        }
    }

    #[tokio::test]
    async fn receive_then_ack_drains_the_queue() {
        let queue = InMemoryQueue::new();
        queue.push(descriptor("b1"));

        let message = queue.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(message.data().batch_id, "b1");
        message.ack().await.unwrap();

        assert!(queue.is_empty());
        assert!(queue.receive(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_returns_message_to_the_front() {
        let queue = InMemoryQueue::new();
        queue.push(descriptor("b1"));
        queue.push(descriptor("b2"));

        let first = queue.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.data().batch_id, "b1");
        first.nack().await.unwrap();

        let redelivered = queue.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(redelivered.data().batch_id, "b1");
    }
}
