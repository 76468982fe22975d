// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol for the Rill streaming session layer.
//!
//! Every exchange between a client session and the streaming server is one of
//! the message shapes below, carried as the payload of a core-bus message.
//! Records are encoded with bincode's standard configuration (varint lengths,
//! little-endian integers), so strings and byte fields are length-delimited
//! on the wire.
//!
//! Subjects: a client discovers a cluster on
//! `<discover_prefix>.<cluster_id>`; every other subject (publish prefix,
//! subscription requests, close, pings) is handed out by the server in
//! [`ConnectResponse`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Session protocol version advertised in [`ConnectRequest`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Default discovery subject prefix. Must match the server configuration.
pub const DEFAULT_DISCOVER_PREFIX: &str = "_STAN.discover";

/// Build the discovery subject for a cluster.
pub fn discover_subject(prefix: &str, cluster_id: &str) -> String {
    format!("{prefix}.{cluster_id}")
}

/// Failures in the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A protocol message could not be encoded.
    #[error("failed to encode protocol message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// An inbound payload did not decode as the expected message.
    #[error("failed to decode protocol message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Encode a protocol message into its wire form.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, ProtoError> {
    let buf = bincode::serde::encode_to_vec(msg, bincode::config::standard())?;
    Ok(Bytes::from(buf))
}

/// Decode a protocol message from an inbound payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtoError> {
    let (msg, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
    Ok(msg)
}

/// Where a new subscription starts in a channel's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPosition {
    /// Only messages published after the subscription is created.
    NewOnly,
    /// The last message received on the channel, then everything after it.
    LastReceived,
    /// That far back in time; the delta rides in
    /// [`SubscriptionRequest::start_time_delta_ns`].
    TimeDeltaStart,
    /// A specific sequence, carried in [`SubscriptionRequest::start_sequence`].
    SequenceStart,
    /// The beginning of the channel.
    First,
}

/// Opens a session. Sent to the discovery subject with a reply inbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_id: String,
    /// Inbox the server beacons on; the client replies to prove liveness.
    pub heartbeat_inbox: String,
    pub protocol: u32,
    /// Requested ping cadence. The server may negotiate it down.
    pub ping_interval_ms: u32,
    /// Requested consecutive-failure threshold. The server may lower it.
    pub ping_max_out: u32,
}

/// Handshake reply. A non-empty `error` means the session was refused and
/// every other field is meaningless.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Prefix for publishes: `<pub_prefix>.<subject>`.
    pub pub_prefix: String,
    /// Subject for subscription requests.
    pub sub_requests: String,
    /// Subject for unsubscribe requests.
    pub unsub_requests: String,
    /// Subject for session close requests.
    pub close_requests: String,
    /// Subject for durable subscription close requests. Empty when the
    /// server does not support closing a subscription without unsubscribing.
    pub sub_close_requests: String,
    /// Subject the client pings.
    pub ping_requests: String,
    /// Negotiated ping cadence; zero means "use what you asked for".
    pub ping_interval_ms: u32,
    /// Negotiated failure threshold; zero means "use what you asked for".
    pub ping_max_out: u32,
    /// Opaque session token echoed in every [`Ping`] so the server can tell
    /// a stale session from the one that replaced it.
    pub conn_id: Vec<u8>,
    pub error: String,
}

/// One published message, sent to `<pub_prefix>.<subject>` with the
/// session's ack inbox as the core-bus reply subject.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PubMsg {
    pub client_id: String,
    /// 16 random bytes, lowercase hex. Correlates the [`PubAck`].
    pub guid: String,
    pub subject: String,
    pub data: Vec<u8>,
}

/// Server acknowledgement for one [`PubMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PubAck {
    pub guid: String,
    pub error: String,
}

/// Creates (or resumes) a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub client_id: String,
    pub subject: String,
    /// Empty when the subscription is not part of a queue group.
    pub queue_group: String,
    /// Inbox the server delivers [`MsgProto`]s to.
    pub inbox: String,
    pub max_in_flight: u32,
    pub ack_wait_ms: u32,
    pub start_position: StartPosition,
    pub start_sequence: u64,
    pub start_time_delta_ns: i64,
    /// Empty for non-durable subscriptions.
    pub durable_name: String,
}

impl Default for StartPosition {
    fn default() -> Self {
        StartPosition::NewOnly
    }
}

/// Reply to a [`SubscriptionRequest`], an unsubscribe, or a durable close.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    /// Subject the client acks delivered messages on.
    pub ack_inbox: String,
    pub error: String,
}

/// Removes a subscription, or closes it while preserving durable state
/// (distinguished by the subject it is sent to).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub client_id: String,
    pub subject: String,
    pub inbox: String,
    pub durable_name: String,
}

/// Orderly session close.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloseRequest {
    pub client_id: String,
}

/// Reply to a [`CloseRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloseResponse {
    pub error: String,
}

/// Client acknowledgement for one delivered [`MsgProto`], published to the
/// subscription's ack inbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {
    pub subject: String,
    pub sequence: u64,
}

/// One message delivered to a subscription inbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgProto {
    /// Monotonically increasing per channel, starting at 1.
    pub sequence: u64,
    pub subject: String,
    pub data: Vec<u8>,
    pub timestamp_ns: i64,
    pub redelivered: bool,
    pub redelivery_count: u32,
    /// Populated by servers that checksum payloads; surfaced, not verified.
    pub crc32: u32,
}

/// Liveness probe sent to [`ConnectResponse::ping_requests`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping {
    pub conn_id: Vec<u8>,
}

/// Reply to a [`Ping`]. A non-empty `error` means the server no longer
/// recognises the session (typically it has been replaced).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingResponse {
    pub error: String,
}
