// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The session orchestrator: handshake, component wiring, and lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ack;
use crate::bus::{Bus, BusStream, NatsBus};
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, SubscriptionOptions};
use crate::ping::{self, PingerConfig};
use crate::publisher::{AckAwaiter, ClosedCause, Publisher, PublishShared};
use crate::subscription::{
    Message, SubShared, Subscription, SubscriptionRegistry, spawn_delivery,
};

/// Deadline for subscribe, unsubscribe, and close round-trips.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    Closing,
    Closed,
}

/// Per-session subjects handed out by the server at handshake.
pub(crate) struct ServerSubjects {
    pub(crate) sub_requests: String,
    pub(crate) unsub_requests: String,
    pub(crate) close_requests: String,
    pub(crate) sub_close_requests: String,
}

pub(crate) struct SessionState {
    pub(crate) status: Status,
    pub(crate) subjects: ServerSubjects,
}

pub(crate) struct ConnectionInner {
    pub(crate) cluster_id: String,
    pub(crate) client_id: String,
    pub(crate) bus: Arc<dyn Bus>,
    owns_bus: bool,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) registry: SubscriptionRegistry,
    publisher: Publisher,
    pub(crate) shared: Arc<PublishShared>,
    cancel: CancellationToken,
    lost_reported: AtomicBool,
    options: ConnectOptions,
}

impl ConnectionInner {
    /// The error public operations fail with once the session left `Open`.
    pub(crate) fn close_error(&self) -> Error {
        self.shared.close_error()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.read().status {
            Status::Open => Ok(()),
            _ => Err(self.close_error()),
        }
    }

    /// Pinger-declared loss. Reported at most once per session; a session
    /// already closing cleanly ignores it. Tears everything down locally —
    /// the server has already forgotten us, so no round-trips.
    pub(crate) async fn session_lost(&self, reason: String) {
        if self.lost_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.write();
            if state.status != Status::Open {
                return;
            }
            state.status = Status::Closed;
        }
        warn!(%reason, client = %self.client_id, "session lost");
        self.cancel.cancel();
        self.publisher
            .shutdown(ClosedCause::Lost(reason.clone()));
        self.registry.detach_all();
        if let Some(handler) = &self.options.connection_lost_handler {
            let handler = handler.clone();
            let error = Error::ConnectionLost { reason };
            tokio::spawn(async move { handler(error) });
        }
    }
}

/// One logical session with a streaming cluster.
///
/// Cheap to clone; every clone drives the same session. Created with
/// [`Connection::connect`], ended with [`Connection::close`] (or by the
/// server side going away, in which case the connection-lost handler fires).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a session as `client_id` on the cluster named `cluster_id`.
    ///
    /// Performs the discovery handshake, installs the heartbeat responder
    /// and ack dispatcher, and starts the pinger with the server-negotiated
    /// cadence. The server rejects a `client_id` already in use.
    pub async fn connect(
        cluster_id: impl Into<String>,
        client_id: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let client_id = client_id.into();
        if cluster_id.is_empty() || client_id.is_empty() {
            return Err(Error::config("cluster id and client id must be non-empty"));
        }

        let (bus, owns_bus): (Arc<dyn Bus>, bool) = match options.bus.clone() {
            Some(bus) => {
                if bus.is_closed() {
                    return Err(Error::config("supplied bus connection is closed"));
                }
                (bus, false)
            }
            None => (Arc::new(NatsBus::connect(&options.nats_url).await?), true),
        };

        // The heartbeat subscription must exist before the server learns the
        // inbox, or the first beacon could go unanswered.
        let heartbeat_inbox = bus.new_inbox();
        let heartbeat_stream = bus.subscribe(heartbeat_inbox.clone()).await?;

        let request = rill_proto::ConnectRequest {
            client_id: client_id.clone(),
            heartbeat_inbox,
            protocol: rill_proto::PROTOCOL_VERSION,
            ping_interval_ms: options.ping_interval.as_millis() as u32,
            ping_max_out: options.ping_max_out,
        };
        let discover = rill_proto::discover_subject(&options.discover_prefix, &cluster_id);
        let reply = match bus
            .request(discover, rill_proto::encode(&request)?, options.connect_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(Error::RequestTimeout) => return Err(Error::ConnectTimeout { cluster_id }),
            Err(e) => return Err(e),
        };
        let response: rill_proto::ConnectResponse = rill_proto::decode(&reply)?;
        if !response.error.is_empty() {
            return Err(Error::ConnectRequest {
                reason: response.error,
            });
        }

        // The server's ping parameters are authoritative when present.
        let ping_interval = if response.ping_interval_ms > 0 {
            Duration::from_millis(response.ping_interval_ms as u64)
        } else {
            options.ping_interval
        };
        let ping_max_out = if response.ping_max_out > 0 {
            response.ping_max_out
        } else {
            options.ping_max_out
        };

        let ack_inbox = bus.new_inbox();
        let ack_stream = bus.subscribe(ack_inbox.clone()).await?;

        let (publisher, completion_rx) = Publisher::new(
            bus.clone(),
            client_id.clone(),
            response.pub_prefix.clone(),
            ack_inbox,
            options.ack_timeout,
            options.max_pub_acks_in_flight,
            options.pending_message_limit,
            options.pending_bytes_limit,
        );
        let shared = publisher.shared();

        let cancel = CancellationToken::new();
        let inner = Arc::new(ConnectionInner {
            cluster_id,
            client_id,
            bus: bus.clone(),
            owns_bus,
            state: RwLock::new(SessionState {
                status: Status::Open,
                subjects: ServerSubjects {
                    sub_requests: response.sub_requests,
                    unsub_requests: response.unsub_requests,
                    close_requests: response.close_requests,
                    sub_close_requests: response.sub_close_requests,
                },
            }),
            registry: SubscriptionRegistry::new(),
            publisher,
            shared: shared.clone(),
            cancel: cancel.clone(),
            lost_reported: AtomicBool::new(false),
            options,
        });

        spawn_heartbeat_responder(bus.clone(), heartbeat_stream, cancel.child_token());
        ack::spawn_callback_worker(completion_rx);
        ack::spawn_ack_dispatcher(ack_stream, shared, cancel.child_token());
        ping::spawn_pinger(
            bus,
            PingerConfig {
                subject: response.ping_requests,
                conn_id: response.conn_id,
                interval: ping_interval,
                max_out: ping_max_out,
            },
            Arc::downgrade(&inner),
            cancel.child_token(),
        );

        debug!(
            cluster = %inner.cluster_id,
            client = %inner.client_id,
            "session opened"
        );
        Ok(Self { inner })
    }

    /// Publish and wait for the server's ack. Returns the publish GUID.
    pub async fn publish(&self, subject: &str, data: impl Into<Bytes>) -> Result<String> {
        self.inner.ensure_open()?;
        self.inner.publisher.publish_sync(subject, data.into()).await
    }

    /// Publish, returning the GUID as soon as the message is on the wire.
    /// The outcome — the same GUID, plus the error if the record failed —
    /// is delivered to `on_ack` from the session's callback worker.
    pub async fn publish_with_ack(
        &self,
        subject: &str,
        data: impl Into<Bytes>,
        on_ack: impl FnOnce(&str, Option<Error>) + Send + 'static,
    ) -> Result<String> {
        self.inner.ensure_open()?;
        self.inner
            .publisher
            .publish_with_ack(subject, data.into(), Box::new(on_ack))
            .await
    }

    /// Publish, returning an [`AckAwaiter`] that resolves when the record
    /// terminates. Lets a caller pipeline publishes and collect acks later.
    pub async fn publish_deferred(
        &self,
        subject: &str,
        data: impl Into<Bytes>,
    ) -> Result<AckAwaiter> {
        self.inner.ensure_open()?;
        self.inner
            .publisher
            .publish_deferred(subject, data.into())
            .await
    }

    /// Subscribe to a channel. `queue_group` members share load-balanced
    /// delivery. The handler runs on the subscription's delivery task, in
    /// sequence order, with no session locks held.
    pub async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        options: SubscriptionOptions,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if subject.is_empty() {
            return Err(Error::config("subject must be non-empty"));
        }

        let sub_requests = {
            let state = inner.state.read();
            if state.status != Status::Open {
                return Err(inner.close_error());
            }
            state.subjects.sub_requests.clone()
        };

        // Attach the inbox before asking the server to deliver to it; early
        // deliveries park in the stream until the loop below starts.
        let inbox = inner.bus.new_inbox();
        let stream = inner.bus.subscribe(inbox.clone()).await?;

        let (start_position, start_sequence, start_time_delta_ns) = options.start.to_wire();
        let request = rill_proto::SubscriptionRequest {
            client_id: inner.client_id.clone(),
            subject: subject.to_string(),
            queue_group: queue_group.unwrap_or_default().to_string(),
            inbox: inbox.clone(),
            max_in_flight: options.max_in_flight,
            ack_wait_ms: options.ack_wait.as_millis() as u32,
            start_position,
            start_sequence,
            start_time_delta_ns,
            durable_name: options.durable_name.clone().unwrap_or_default(),
        };
        let reply = match inner
            .bus
            .request(sub_requests, rill_proto::encode(&request)?, REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(Error::RequestTimeout) => return Err(Error::SubscribeTimeout),
            Err(e) => return Err(e),
        };
        let response: rill_proto::SubscriptionResponse = rill_proto::decode(&reply)?;
        if !response.error.is_empty() {
            return Err(Error::SubscribeRequest {
                reason: response.error,
            });
        }

        let sub = Arc::new(SubShared {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            inbox,
            ack_inbox: response.ack_inbox,
            opts: options,
            handler: Arc::new(handler),
            bus: inner.bus.clone(),
            session: Arc::downgrade(inner),
            closed: AtomicBool::new(false),
            cancel: inner.cancel.child_token(),
        });
        inner.registry.insert(sub.clone());
        spawn_delivery(sub.clone(), stream);
        debug!(subject = %sub.subject, inbox = %sub.inbox, "subscribed");
        Ok(Subscription { inner: sub })
    }

    /// Close the session. Idempotent: the first call releases server-side
    /// state (best effort), fails every in-flight publish with the closed
    /// error, detaches all subscriptions, and flushes queued ack
    /// notifications; later calls return immediately.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            match state.status {
                Status::Closing | Status::Closed => return Ok(()),
                Status::Open => state.status = Status::Closing,
            }
        }

        inner.cancel.cancel();
        inner.publisher.shutdown(ClosedCause::Closed);
        inner.registry.detach_all();

        let close_subject = inner.state.read().subjects.close_requests.clone();
        if !close_subject.is_empty() {
            let request = rill_proto::CloseRequest {
                client_id: inner.client_id.clone(),
            };
            match rill_proto::encode(&request) {
                Ok(payload) => {
                    match inner.bus.request(close_subject, payload, REQUEST_TIMEOUT).await {
                        Ok(reply) => {
                            if let Ok(response) = rill_proto::decode::<rill_proto::CloseResponse>(&reply)
                                && !response.error.is_empty()
                            {
                                debug!(error = %response.error, "server reported close error");
                            }
                        }
                        Err(e) => debug!("close request failed: {e}"),
                    }
                }
                Err(e) => debug!("failed to encode close request: {e}"),
            }
        }

        // Every notification queued by the teardown is dispatched before
        // close returns.
        inner.shared.flush_callbacks().await;

        if inner.owns_bus {
            let _ = inner.bus.flush().await;
        }
        inner.state.write().status = Status::Closed;
        debug!(client = %inner.client_id, "session closed");
        Ok(())
    }

    /// The underlying bus, or `None` once the session has closed.
    pub fn bus(&self) -> Option<Arc<dyn Bus>> {
        match self.inner.state.read().status {
            Status::Open => Some(self.inner.bus.clone()),
            _ => None,
        }
    }

    /// Client id this session connected as.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Cluster this session is joined to.
    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }
}

/// Answer server liveness beacons with an empty payload.
fn spawn_heartbeat_responder(
    bus: Arc<dyn Bus>,
    mut beats: BusStream,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = beats.next() => {
                    let Some(msg) = next else { break };
                    if let Some(reply) = msg.reply
                        && let Err(e) = bus.publish(reply, Bytes::new()).await
                    {
                        debug!("heartbeat reply failed: {e}");
                    }
                }
            }
        }
    })
}
