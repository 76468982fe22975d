// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Publish pipeline: GUID assignment, bounded in-flight admission, ack-wait
//! timers, and terminal notification of every publish record.
//!
//! A record lives in the in-flight map from enqueue until exactly one of its
//! terminal paths claims it: the ack dispatcher (server acked), its ack-wait
//! timer (deadline elapsed), or session teardown (closed or lost). Claiming
//! is removal from the map, so late arrivals on the other paths find nothing
//! and do nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::{Error, Result};

/// Callback form of publish completion: the GUID and, on failure, the error.
pub type AckCallback = Box<dyn FnOnce(&str, Option<Error>) + Send + 'static>;

/// How a record's terminal state reaches the caller.
pub(crate) enum RecordHandler {
    /// A task awaiting the outcome ([`AckAwaiter`] or the synchronous form).
    Waiter(oneshot::Sender<Result<String>>),
    /// A user callback, run on the session's callback worker.
    Callback(AckCallback),
}

/// Work for the callback worker.
pub(crate) enum Completion {
    /// A record reached its terminal state.
    Terminal {
        guid: String,
        outcome: Option<Error>,
        handler: RecordHandler,
    },
    /// Drain barrier: acked once everything queued before it has been
    /// dispatched.
    Flush(oneshot::Sender<()>),
}

/// Why the pipeline was shut down.
#[derive(Debug, Clone)]
pub(crate) enum ClosedCause {
    /// Orderly close.
    Closed,
    /// Pinger-declared session loss.
    Lost(String),
}

struct PubRecord {
    handler: RecordHandler,
    enqueued_at: Instant,
    _permit: OwnedSemaphorePermit,
    _slot: GateSlot,
}

/// Admission gate bounding in-flight publishes by count and payload bytes.
///
/// The count bound is a FIFO semaphore, so parked publishers are admitted in
/// arrival order. The message/byte limits are checked under a short-lived
/// lock and waiters requeue on every release.
pub(crate) struct FlowGate {
    sem: Arc<Semaphore>,
    state: Mutex<GateState>,
    released: Notify,
    message_limit: Option<usize>,
    bytes_limit: Option<usize>,
    closed: AtomicBool,
}

#[derive(Default)]
struct GateState {
    messages: usize,
    bytes: usize,
}

impl FlowGate {
    pub(crate) fn new(
        max_in_flight: usize,
        message_limit: Option<usize>,
        bytes_limit: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sem: Arc::new(Semaphore::new(max_in_flight)),
            state: Mutex::new(GateState::default()),
            released: Notify::new(),
            message_limit,
            bytes_limit,
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for an in-flight slot. Errors once the gate is closed.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        size: usize,
    ) -> Result<(OwnedSemaphorePermit, GateSlot)> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        loop {
            let released = self.released.notified();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            {
                let mut state = self.state.lock();
                let messages_fit = self.message_limit.is_none_or(|l| state.messages < l);
                // An oversize payload is admitted when it is alone, otherwise
                // it could never enter at all.
                let bytes_fit = self
                    .bytes_limit
                    .is_none_or(|l| state.bytes + size <= l || state.messages == 0);
                if messages_fit && bytes_fit {
                    state.messages += 1;
                    state.bytes += size;
                    return Ok((
                        permit,
                        GateSlot {
                            gate: self.clone(),
                            size,
                        },
                    ));
                }
            }
            released.await;
        }
    }

    /// Fail all parked waiters and reject future admissions.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sem.close();
        self.released.notify_waiters();
    }

    #[cfg(test)]
    fn in_flight(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.messages, state.bytes)
    }
}

/// Releases the gate's message/byte accounting on drop.
pub(crate) struct GateSlot {
    gate: Arc<FlowGate>,
    size: usize,
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        {
            let mut state = self.gate.state.lock();
            state.messages -= 1;
            state.bytes -= self.size;
        }
        self.gate.released.notify_waiters();
    }
}

/// State shared between the publisher, the ack dispatcher, the ack-wait
/// timers, and session teardown.
pub(crate) struct PublishShared {
    records: Mutex<HashMap<String, PubRecord>>,
    completions: flume::Sender<Completion>,
    cause: Mutex<Option<ClosedCause>>,
}

impl PublishShared {
    /// Terminate `guid`. The first caller wins; returns whether this call
    /// claimed the record.
    pub(crate) fn complete(&self, guid: &str, outcome: Option<Error>) -> bool {
        let Some(record) = self.records.lock().remove(guid) else {
            return false;
        };
        debug!(
            %guid,
            elapsed_ms = record.enqueued_at.elapsed().as_millis() as u64,
            ok = outcome.is_none(),
            "publish terminated"
        );
        let _ = self.completions.send(Completion::Terminal {
            guid: guid.to_string(),
            outcome,
            handler: record.handler,
        });
        true
    }

    /// Record why the pipeline is going down. First cause wins; must be set
    /// before any waiter can observe the teardown, so the error it reads
    /// reflects the real reason.
    pub(crate) fn set_cause(&self, cause: ClosedCause) {
        let mut stored = self.cause.lock();
        if stored.is_none() {
            *stored = Some(cause);
        }
    }

    /// Terminate every live record with the teardown error.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<(String, PubRecord)> = {
            let mut records = self.records.lock();
            records.drain().collect()
        };
        for (guid, record) in drained {
            let outcome = Some(self.close_error());
            let _ = self.completions.send(Completion::Terminal {
                guid,
                outcome,
                handler: record.handler,
            });
        }
    }

    /// The error operations fail with after teardown.
    pub(crate) fn close_error(&self) -> Error {
        match &*self.cause.lock() {
            Some(ClosedCause::Lost(reason)) => Error::ConnectionLost {
                reason: reason.clone(),
            },
            _ => Error::ConnectionClosed,
        }
    }

    fn is_shut_down(&self) -> bool {
        self.cause.lock().is_some()
    }

    /// Push a drain barrier through the callback worker and wait for it, so
    /// every completion queued before this call has been delivered.
    pub(crate) async fn flush_callbacks(&self) {
        let (tx, rx) = oneshot::channel();
        if self.completions.send(Completion::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The session's publish pipeline.
pub(crate) struct Publisher {
    bus: Arc<dyn Bus>,
    client_id: String,
    pub_prefix: String,
    ack_inbox: String,
    ack_timeout: Duration,
    gate: Arc<FlowGate>,
    shared: Arc<PublishShared>,
}

impl Publisher {
    /// Build the pipeline. The returned receiver feeds the callback worker.
    pub(crate) fn new(
        bus: Arc<dyn Bus>,
        client_id: String,
        pub_prefix: String,
        ack_inbox: String,
        ack_timeout: Duration,
        max_pub_acks_in_flight: usize,
        pending_message_limit: Option<usize>,
        pending_bytes_limit: Option<usize>,
    ) -> (Self, flume::Receiver<Completion>) {
        let (completions, completion_rx) = flume::unbounded();
        let shared = Arc::new(PublishShared {
            records: Mutex::new(HashMap::new()),
            completions,
            cause: Mutex::new(None),
        });
        let gate = FlowGate::new(
            max_pub_acks_in_flight,
            pending_message_limit,
            pending_bytes_limit,
        );
        (
            Self {
                bus,
                client_id,
                pub_prefix,
                ack_inbox,
                ack_timeout,
                gate,
                shared,
            },
            completion_rx,
        )
    }

    pub(crate) fn shared(&self) -> Arc<PublishShared> {
        self.shared.clone()
    }

    /// Tear the pipeline down: reject admissions, fail every live record.
    /// The cause is recorded before the gate wakes any parked admission, so
    /// every unblocked waiter sees the real teardown error.
    pub(crate) fn shutdown(&self, cause: ClosedCause) {
        self.shared.set_cause(cause);
        self.gate.close();
        self.shared.fail_all();
    }

    /// Publish and wait for the ack. Returns the GUID on success.
    pub(crate) async fn publish_sync(&self, subject: &str, data: Bytes) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(subject, data, RecordHandler::Waiter(tx))
            .await?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.shared.close_error()),
        }
    }

    /// Publish and deliver the outcome to `on_ack`; returns the GUID as soon
    /// as the record is on the wire.
    pub(crate) async fn publish_with_ack(
        &self,
        subject: &str,
        data: Bytes,
        on_ack: AckCallback,
    ) -> Result<String> {
        self.enqueue(subject, data, RecordHandler::Callback(on_ack))
            .await
    }

    /// Publish and hand back an awaiter for the outcome.
    pub(crate) async fn publish_deferred(&self, subject: &str, data: Bytes) -> Result<AckAwaiter> {
        let (tx, rx) = oneshot::channel();
        let guid = self
            .enqueue(subject, data, RecordHandler::Waiter(tx))
            .await?;
        Ok(AckAwaiter { guid, rx })
    }

    async fn enqueue(&self, subject: &str, data: Bytes, handler: RecordHandler) -> Result<String> {
        if self.shared.is_shut_down() {
            return Err(self.shared.close_error());
        }
        let guid = Uuid::new_v4().as_simple().to_string();

        // Admission may not outlive the ack deadline the record would have
        // had; a publish that cannot even enter the in-flight set times out.
        let admission = tokio::time::timeout(self.ack_timeout, self.gate.acquire(data.len())).await;
        let (permit, slot) = match admission {
            Ok(Ok(entry)) => entry,
            Ok(Err(_)) => return Err(self.shared.close_error()),
            Err(_) => return Err(Error::PublishTimeout { guid }),
        };

        self.shared.records.lock().insert(
            guid.clone(),
            PubRecord {
                handler,
                enqueued_at: Instant::now(),
                _permit: permit,
                _slot: slot,
            },
        );
        self.spawn_ack_timer(guid.clone());

        let msg = rill_proto::PubMsg {
            client_id: self.client_id.clone(),
            guid: guid.clone(),
            subject: subject.to_string(),
            data: data.to_vec(),
        };
        let payload = match rill_proto::encode(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                self.retract(&guid);
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .bus
            .publish_with_reply(
                format!("{}.{}", self.pub_prefix, subject),
                self.ack_inbox.clone(),
                payload,
            )
            .await
        {
            if self.retract(&guid) {
                return Err(e);
            }
            // The record already terminated on another path (its deadline
            // elapsed mid-publish); that path delivered the notification.
            return Ok(guid);
        }
        Ok(guid)
    }

    /// Remove a record without notifying; the enqueue error is the caller's
    /// single terminal notification. Returns whether the record was live.
    fn retract(&self, guid: &str) -> bool {
        self.shared.records.lock().remove(guid).is_some()
    }

    fn spawn_ack_timer(&self, guid: String) {
        let shared = self.shared.clone();
        let wait = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let timeout = Error::PublishTimeout { guid: guid.clone() };
            shared.complete(&guid, Some(timeout));
        });
    }
}

/// Handle for an in-flight publish created with
/// [`Connection::publish_deferred`](crate::Connection::publish_deferred).
pub struct AckAwaiter {
    guid: String,
    rx: oneshot::Receiver<Result<String>>,
}

impl AckAwaiter {
    /// GUID of the publish this awaiter tracks.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Wait for the record to terminate, yielding the GUID on ack.
    pub async fn recv(self) -> Result<String> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}
