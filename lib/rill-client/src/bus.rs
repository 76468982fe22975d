// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Core-bus contract and the NATS implementation.
//!
//! The session layer consumes the bus through the narrow [`Bus`] trait:
//! fire-and-forget publish, request/reply with a deadline, subject
//! subscriptions delivered as streams, and inbox generation. Tests run the
//! whole session against an in-memory implementation of the same trait.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{Error, Result};

/// A single message delivered by the core bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message arrived on.
    pub subject: String,
    /// Reply subject, when the sender expects a response.
    pub reply: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
}

/// Messages for one bus subscription, in arrival order.
///
/// Dropping the stream detaches the subscription on the bus side.
pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// The connectionless pub/sub transport the session is multiplexed over.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;

    /// Publish carrying a reply subject for the receiver to respond on.
    async fn publish_with_reply(
        &self,
        subject: String,
        reply: String,
        payload: Bytes,
    ) -> Result<()>;

    /// Request/reply with a deadline. Yields [`Error::RequestTimeout`] when
    /// no reply (or no responder) arrives in time.
    async fn request(&self, subject: String, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: String) -> Result<BusStream>;

    /// A unique inbox subject.
    fn new_inbox(&self) -> String;

    /// Whether the bus connection has been severed.
    fn is_closed(&self) -> bool;

    /// Whether the bus is between servers, trying to reconnect.
    fn is_reconnecting(&self) -> bool;

    /// Flush buffered publishes, when the implementation buffers at all.
    async fn flush(&self) -> Result<()>;
}

/// Production [`Bus`] over an [`async_nats::Client`].
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to one or more NATS servers (comma-separated URLs).
    pub async fn connect(urls: &str) -> Result<Self> {
        let client = async_nats::connect(urls)
            .await
            .map_err(|e| anyhow::Error::new(e).context("failed to connect to NATS"))?;
        Ok(Self { client })
    }

    /// Adopt a caller-supplied client.
    ///
    /// The client must still be connected; handing over a severed connection
    /// is a configuration error. Callers should build the client with bounded
    /// internal buffering — a publish queued while the connection is down is
    /// only ever resolved here by the session's ack-wait timers.
    pub fn from_client(client: async_nats::Client) -> Result<Self> {
        if matches!(
            client.connection_state(),
            async_nats::connection::State::Disconnected
        ) {
            return Err(Error::config("supplied bus connection is disconnected"));
        }
        Ok(Self { client })
    }

    /// The wrapped NATS client.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| anyhow::Error::new(e).context("nats publish failed"))?;
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: String,
        reply: String,
        payload: Bytes,
    ) -> Result<()> {
        self.client
            .publish_with_reply(subject, reply, payload)
            .await
            .map_err(|e| anyhow::Error::new(e).context("nats publish failed"))?;
        Ok(())
    }

    async fn request(&self, subject: String, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.client.request(subject, payload)).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(e)) => match e.kind() {
                async_nats::RequestErrorKind::TimedOut
                | async_nats::RequestErrorKind::NoResponders => Err(Error::RequestTimeout),
                _ => Err(anyhow::Error::new(e).context("nats request failed").into()),
            },
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    async fn subscribe(&self, subject: String) -> Result<BusStream> {
        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .map_err(|e| anyhow::Error::new(e).context("nats subscribe failed"))?;
        let stream = subscriber.map(|msg| BusMessage {
            subject: msg.subject.to_string(),
            reply: msg.reply.map(|r| r.to_string()),
            payload: msg.payload,
        });
        Ok(Box::pin(stream))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Disconnected
        )
    }

    fn is_reconnecting(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Pending
        )
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| anyhow::Error::new(e).context("nats flush failed"))?;
        Ok(())
    }
}
