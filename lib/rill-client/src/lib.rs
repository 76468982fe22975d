// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session-layer client for the Rill streaming server.
//!
//! Rill layers acked, exactly-once-in-order-per-channel publishes and
//! durable, acknowledged subscriptions on top of core NATS. One
//! [`Connection`] is one logical session — a `(cluster_id, client_id)` pair
//! the server tracks — multiplexed over a single bus connection.
//!
//! # Architecture
//!
//! A session is a handful of cooperating tasks around shared state:
//!
//! - the **publisher** assigns each publish a GUID, admits it through a
//!   bounded in-flight gate (count and payload bytes), arms an ack-wait
//!   timer, and sends it to the server's publish prefix;
//! - the **ack dispatcher** consumes the session's private ack inbox and
//!   terminates records by GUID; user ack callbacks run off the bus path on
//!   a bounded pool — concurrent across records, so a slow callback stalls
//!   neither ack flow nor other records' notifications;
//! - each **subscription** owns a private inbox the server delivers to in
//!   sequence order; the delivery task invokes the handler and acks
//!   (automatically, or on demand via [`Message::ack`]);
//! - the **pinger** probes the server on the negotiated cadence and, after
//!   enough consecutive failures, declares the session lost exactly once,
//!   failing every in-flight publish and detaching every subscription.
//!
//! Every publish record terminates exactly once: server ack, ack-wait
//! timeout, or session teardown. Failed publishes are *not* retried here —
//! retry policy belongs to the application.
//!
//! # Example
//!
//! ```ignore
//! use rill_client::{ConnectOptions, Connection, SubscriptionOptions};
//!
//! let conn = Connection::connect("test-cluster", "me", ConnectOptions::new()).await?;
//!
//! let sub = conn
//!     .subscribe(
//!         "orders",
//!         None,
//!         SubscriptionOptions::new().deliver_all_available(),
//!         |msg| println!("seq {}: {} bytes", msg.sequence(), msg.data().len()),
//!     )
//!     .await?;
//!
//! let guid = conn.publish("orders", &b"hello"[..]).await?;
//! println!("acked {guid}");
//!
//! sub.unsubscribe().await?;
//! conn.close().await?;
//! ```

mod ack;
mod bus;
mod connection;
mod error;
mod options;
mod ping;
mod publisher;
mod subscription;

pub use bus::{Bus, BusMessage, BusStream, NatsBus};
pub use connection::Connection;
pub use error::{Error, Result};
pub use options::{
    ConnectOptions, ConnectionLostHandler, DEFAULT_ACK_TIMEOUT, DEFAULT_ACK_WAIT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_PUB_ACKS_IN_FLIGHT,
    DEFAULT_NATS_URL, DEFAULT_PING_INTERVAL, DEFAULT_PING_MAX_OUT, StartPosition,
    SubscriptionOptions,
};
pub use publisher::{AckAwaiter, AckCallback};
pub use subscription::{Message, MessageHandler, Subscription};
