// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the session layer.

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Operation on a closed (or never-opened) session.
    #[error("connection closed")]
    ConnectionClosed,

    /// The pinger declared the session lost. Carries the server-supplied
    /// reason when one was reported (e.g. the client has been replaced).
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Why the session was declared lost.
        reason: String,
    },

    /// The server refused the handshake (e.g. duplicate client id).
    #[error("connect request failed: {reason}")]
    ConnectRequest {
        /// Server-supplied refusal reason.
        reason: String,
    },

    /// No handshake reply within the connect timeout.
    #[error("no response from the streaming server for cluster {cluster_id}")]
    ConnectTimeout {
        /// Cluster the discovery request was addressed to.
        cluster_id: String,
    },

    /// No ack for a publish within the ack timeout.
    #[error("publish ack timed out for {guid}")]
    PublishTimeout {
        /// GUID of the publish that timed out.
        guid: String,
    },

    /// The server acked a publish with an error.
    #[error("publish {guid} failed: {reason}")]
    Publish {
        /// GUID of the failed publish.
        guid: String,
        /// Server-supplied failure reason.
        reason: String,
    },

    /// The server refused a subscription, unsubscribe, or close request.
    #[error("subscription request failed: {reason}")]
    SubscribeRequest {
        /// Server-supplied refusal reason.
        reason: String,
    },

    /// No reply to a subscription request within the request deadline.
    #[error("subscription request timed out")]
    SubscribeTimeout,

    /// Operation on a subscription that was unsubscribed or closed.
    #[error("invalid subscription")]
    BadSubscription,

    /// [`Message::ack`](crate::Message::ack) on an auto-ack subscription.
    #[error("cannot manually ack in auto-ack mode")]
    ManualAck,

    /// The handshake did not advertise support for the requested feature.
    #[error("server does not support {feature}")]
    NoServerSupport {
        /// The missing capability.
        feature: &'static str,
    },

    /// An option was out of range or contradictory.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// A bus request did not complete within its deadline.
    #[error("bus request timed out")]
    RequestTimeout,

    /// The wire codec rejected a payload.
    #[error(transparent)]
    Proto(#[from] rill_proto::ProtoError),

    /// Failure reported by the underlying bus.
    #[error("bus error: {0}")]
    Bus(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
