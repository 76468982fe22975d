// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Subscriptions: per-inbox delivery tasks, acking, and the registry that
//! ties subscription lifecycles to the session.
//!
//! Each subscription owns a bus subscription on a private inbox. The server
//! delivers messages there in sequence order; the delivery task invokes the
//! user handler and acks (automatically or on demand). The registry tracks
//! live subscriptions so session teardown can detach them locally without
//! server round-trips.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Bus, BusStream};
use crate::connection::{ConnectionInner, REQUEST_TIMEOUT, Status};
use crate::error::{Error, Result};
use crate::options::SubscriptionOptions;

/// User callback for delivered messages. Runs on the subscription's delivery
/// task with no session locks held.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Whether a teardown removes server-side state or preserves durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownMode {
    Unsubscribe,
    Close,
}

pub(crate) struct SubShared {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) inbox: String,
    pub(crate) ack_inbox: String,
    pub(crate) opts: SubscriptionOptions,
    pub(crate) handler: MessageHandler,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) session: Weak<ConnectionInner>,
    pub(crate) closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl SubShared {
    /// Detach without talking to the server: mark closed and stop delivery.
    /// Used on session teardown; the server forgets the client as a whole.
    pub(crate) fn detach_local(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    async fn teardown(&self, mode: TeardownMode) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Err(Error::ConnectionClosed);
        };
        let target = {
            let state = session.state.read();
            if state.status != Status::Open {
                return Err(session.close_error());
            }
            match mode {
                TeardownMode::Unsubscribe => state.subjects.unsub_requests.clone(),
                TeardownMode::Close => {
                    if state.subjects.sub_close_requests.is_empty() {
                        return Err(Error::NoServerSupport {
                            feature: "subscription close",
                        });
                    }
                    state.subjects.sub_close_requests.clone()
                }
            }
        };
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::BadSubscription);
        }

        let request = rill_proto::UnsubscribeRequest {
            client_id: session.client_id.clone(),
            subject: self.subject.clone(),
            inbox: self.inbox.clone(),
            durable_name: self.opts.durable_name.clone().unwrap_or_default(),
        };
        let payload = rill_proto::encode(&request)?;
        let reply = match self.bus.request(target, payload, REQUEST_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                // The server never saw the request; the subscription stays
                // usable and the caller may retry.
                self.closed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let response: rill_proto::SubscriptionResponse = match rill_proto::decode(&reply) {
            Ok(response) => response,
            Err(e) => {
                self.closed.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        if !response.error.is_empty() {
            self.closed.store(false, Ordering::Release);
            return Err(Error::SubscribeRequest {
                reason: response.error,
            });
        }

        session.registry.remove(&self.inbox);
        self.cancel.cancel();
        debug!(subject = %self.subject, inbox = %self.inbox, ?mode, "subscription torn down");
        Ok(())
    }
}

/// A live subscription created by
/// [`Connection::subscribe`](crate::Connection::subscribe).
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubShared>,
}

impl Subscription {
    /// Channel subject the subscription delivers from.
    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Queue group, when part of one.
    pub fn queue_group(&self) -> Option<&str> {
        self.inner.queue_group.as_deref()
    }

    /// Durable name, when the subscription is durable.
    pub fn durable_name(&self) -> Option<&str> {
        self.inner.opts.durable_name.as_deref()
    }

    /// Remove the subscription. The server forgets its state, durable or
    /// not; a durable of the same name would start over.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.inner.teardown(TeardownMode::Unsubscribe).await
    }

    /// Stop delivery but leave durable state on the server, so a later
    /// subscribe with the same durable name resumes where acks stopped.
    /// Fails with [`Error::NoServerSupport`] when the handshake did not
    /// advertise a close subject.
    pub async fn close(&self) -> Result<()> {
        self.inner.teardown(TeardownMode::Close).await
    }

    /// Tear down honouring the `leave_open` option: a durable-preserving
    /// close when it was set, a full unsubscribe otherwise.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.opts.leave_open {
            self.close().await
        } else {
            self.unsubscribe().await
        }
    }
}

/// Live subscriptions keyed by inbox subject.
///
/// A subscription's delivery task is attached exactly while its record is in
/// here: insertion follows the server's subscribe reply, removal precedes
/// cancellation on every teardown path.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subs: DashMap<String, Arc<SubShared>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subs: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, sub: Arc<SubShared>) {
        self.subs.insert(sub.inbox.clone(), sub);
    }

    pub(crate) fn remove(&self, inbox: &str) {
        self.subs.remove(inbox);
    }

    /// Detach every subscription locally (no server round-trips).
    pub(crate) fn detach_all(&self) {
        for entry in self.subs.iter() {
            entry.value().detach_local();
        }
        self.subs.clear();
    }
}

/// One delivered message. Immutable; `ack` is the only operation.
pub struct Message {
    sequence: u64,
    subject: String,
    data: Bytes,
    timestamp_ns: i64,
    redelivered: bool,
    redelivery_count: u32,
    crc32: u32,
    acked: AtomicBool,
    sub: Arc<SubShared>,
}

impl Message {
    fn from_proto(proto: rill_proto::MsgProto, sub: Arc<SubShared>) -> Self {
        Self {
            sequence: proto.sequence,
            subject: proto.subject,
            data: Bytes::from(proto.data),
            timestamp_ns: proto.timestamp_ns,
            redelivered: proto.redelivered,
            redelivery_count: proto.redelivery_count,
            crc32: proto.crc32,
            acked: AtomicBool::new(false),
            sub,
        }
    }

    /// Position in the channel, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Channel subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Server-side arrival timestamp, nanoseconds since the epoch.
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    /// Whether the server has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// How many times the server has redelivered it.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    /// Server-computed payload checksum, zero when the server does not
    /// checksum. Surfaced verbatim, never verified here.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// The local subscription this message was delivered to. With queue
    /// groups, this is how an application tells the members apart.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            inner: self.sub.clone(),
        }
    }

    /// Acknowledge the message. Only valid in manual-ack mode; acking twice
    /// is a no-op.
    pub async fn ack(&self) -> Result<()> {
        if !self.sub.opts.manual_acks {
            return Err(Error::ManualAck);
        }
        if self.acked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ack = rill_proto::Ack {
            subject: self.sub.subject.clone(),
            sequence: self.sequence,
        };
        self.sub
            .bus
            .publish(self.sub.ack_inbox.clone(), rill_proto::encode(&ack)?)
            .await
    }
}

/// Drive one subscription: decode inbound messages, invoke the handler in
/// sequence order, auto-ack when the subscription is not manual.
///
/// The ack is sent even when the handler panics — the server reads a missing
/// ack as back-pressure, and a handler failure must not stall the channel.
/// The panic still propagates once the ack is on the wire. Applications that
/// want redelivery after a failed handler use manual acks.
pub(crate) fn spawn_delivery(inner: Arc<SubShared>, mut stream: BusStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let bus_msg = tokio::select! {
                _ = inner.cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let proto: rill_proto::MsgProto = match rill_proto::decode(&bus_msg.payload) {
                Ok(proto) => proto,
                Err(e) => {
                    warn!(inbox = %inner.inbox, "dropping undecodable delivery: {e}");
                    continue;
                }
            };
            let sequence = proto.sequence;
            let message = Message::from_proto(proto, inner.clone());

            let handler = inner.handler.clone();
            let outcome = catch_unwind(AssertUnwindSafe(move || handler(message)));

            if !inner.opts.manual_acks {
                let ack = rill_proto::Ack {
                    subject: inner.subject.clone(),
                    sequence,
                };
                match rill_proto::encode(&ack) {
                    Ok(payload) => {
                        if let Err(e) = inner.bus.publish(inner.ack_inbox.clone(), payload).await {
                            debug!(subject = %inner.subject, sequence, "auto-ack failed: {e}");
                        }
                    }
                    Err(e) => warn!("failed to encode ack: {e}"),
                }
            }

            if let Err(panic) = outcome {
                resume_unwind(panic);
            }
        }
    })
}
