// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process test fixtures: an in-memory bus and a mock streaming server
//! speaking the rill wire protocol, so session behaviour can be exercised
//! end-to-end without external infrastructure.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;

use rill_client::{Bus, BusMessage, BusStream, ConnectOptions, Error, Result};

/// In-memory subject router implementing the [`Bus`] contract.
///
/// Exact-match subjects plus a trailing `.>` wildcard, which is all the
/// session protocol uses. Subscribers whose streams have been dropped are
/// pruned on the next delivery.
pub struct MockBus {
    subs: DashMap<String, Vec<flume::Sender<BusMessage>>>,
    inbox_counter: AtomicU64,
    closed: AtomicBool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: DashMap::new(),
            inbox_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Mark the bus severed; `is_closed` reports it from then on.
    pub fn sever(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn deliver(&self, subject: &str, reply: Option<String>, payload: Bytes) {
        for mut entry in self.subs.iter_mut() {
            if !subject_matches(entry.key(), subject) {
                continue;
            }
            entry.value_mut().retain(|tx| {
                tx.send(BusMessage {
                    subject: subject.to_string(),
                    reply: reply.clone(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
    }

    fn attach(&self, subject: String) -> flume::Receiver<BusMessage> {
        let (tx, rx) = flume::unbounded();
        self.subs.entry(subject).or_default().push(tx);
        rx
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix(".>") {
        Some(prefix) => subject
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == subject,
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Bus(anyhow::anyhow!("bus severed")));
        }
        self.deliver(&subject, None, payload);
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: String,
        reply: String,
        payload: Bytes,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Bus(anyhow::anyhow!("bus severed")));
        }
        self.deliver(&subject, Some(reply), payload);
        Ok(())
    }

    async fn request(&self, subject: String, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let inbox = self.new_inbox();
        let rx = self.attach(inbox.clone());
        self.deliver(&subject, Some(inbox.clone()), payload);
        let outcome = tokio::time::timeout(timeout, rx.recv_async()).await;
        self.subs.remove(&inbox);
        match outcome {
            Ok(Ok(msg)) => Ok(msg.payload),
            _ => Err(Error::RequestTimeout),
        }
    }

    async fn subscribe(&self, subject: String) -> Result<BusStream> {
        let rx = self.attach(subject);
        Ok(Box::pin(rx.into_stream()))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", self.inbox_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_reconnecting(&self) -> bool {
        false
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

const SERVER_PREFIX: &str = "_RILLD";

#[derive(Clone)]
struct StoredMsg {
    sequence: u64,
    data: Vec<u8>,
    timestamp_ns: i64,
}

struct SubEntry {
    client_id: String,
    subject: String,
    queue_group: Option<String>,
    inbox: String,
    ack_inbox: String,
    durable: Option<String>,
    /// Delivered-but-unacked sequences and how often each was redelivered.
    pending: Mutex<BTreeMap<u64, u32>>,
}

struct ClientSession {
    conn_id: Vec<u8>,
}

struct ServerState {
    bus: Arc<MockBus>,
    clients: DashMap<String, ClientSession>,
    channels: DashMap<String, Vec<StoredMsg>>,
    subs: Mutex<Vec<Arc<SubEntry>>>,
    /// `client|durable|subject` → last acked sequence.
    durables: DashMap<String, u64>,
    group_cursor: DashMap<String, AtomicUsize>,
    acking: AtomicBool,
    pending_acks: Mutex<Vec<(String, rill_proto::PubAck)>>,
    publish_failure: Mutex<Option<String>>,
    conn_counter: AtomicU64,
    ack_inbox_counter: AtomicU64,
    support_sub_close: bool,
}

impl ServerState {
    fn durable_key(client_id: &str, durable: &str, subject: &str) -> String {
        format!("{client_id}|{durable}|{subject}")
    }

    fn now_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as i64
    }

    async fn send_to_sub(&self, sub: &SubEntry, stored: &StoredMsg) {
        sub.pending.lock().insert(stored.sequence, 0);
        let msg = rill_proto::MsgProto {
            sequence: stored.sequence,
            subject: sub.subject.clone(),
            data: stored.data.clone(),
            timestamp_ns: stored.timestamp_ns,
            redelivered: false,
            redelivery_count: 0,
            crc32: 0,
        };
        if let Ok(payload) = rill_proto::encode(&msg) {
            let _ = self.bus.publish(sub.inbox.clone(), payload).await;
        }
    }

    /// Fan a new message out: every standalone subscription gets it, each
    /// queue group gets it once (round-robin across members).
    async fn fan_out(&self, subject: &str, stored: &StoredMsg) {
        let subs: Vec<Arc<SubEntry>> = self
            .subs
            .lock()
            .iter()
            .filter(|s| s.subject == subject)
            .cloned()
            .collect();

        let mut groups: BTreeMap<String, Vec<Arc<SubEntry>>> = BTreeMap::new();
        for sub in subs {
            match &sub.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push(sub),
                None => self.send_to_sub(&sub, stored).await,
            }
        }
        for (group, members) in groups {
            let key = format!("{subject}|{group}");
            let pick = {
                let cursor = self
                    .group_cursor
                    .entry(key)
                    .or_insert_with(|| AtomicUsize::new(0));
                cursor.fetch_add(1, Ordering::Relaxed) % members.len()
            };
            self.send_to_sub(&members[pick], stored).await;
        }
    }
}

/// In-process streaming server for tests.
pub struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub async fn start(bus: Arc<MockBus>, cluster_id: &str) -> Self {
        Self::start_inner(bus, cluster_id, true).await
    }

    /// A server whose handshake omits the subscription-close subject.
    pub async fn start_without_sub_close(bus: Arc<MockBus>, cluster_id: &str) -> Self {
        Self::start_inner(bus, cluster_id, false).await
    }

    async fn start_inner(bus: Arc<MockBus>, cluster_id: &str, support_sub_close: bool) -> Self {
        let state = Arc::new(ServerState {
            bus: bus.clone(),
            clients: DashMap::new(),
            channels: DashMap::new(),
            subs: Mutex::new(Vec::new()),
            durables: DashMap::new(),
            group_cursor: DashMap::new(),
            acking: AtomicBool::new(true),
            pending_acks: Mutex::new(Vec::new()),
            publish_failure: Mutex::new(None),
            conn_counter: AtomicU64::new(1),
            ack_inbox_counter: AtomicU64::new(1),
            support_sub_close,
        });

        let discover =
            rill_proto::discover_subject(rill_proto::DEFAULT_DISCOVER_PREFIX, cluster_id);
        spawn_handler(state.clone(), bus.subscribe(discover).await.unwrap(), handle_connect);
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.pub.>")).await.unwrap(),
            handle_publish,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.sub")).await.unwrap(),
            handle_subscribe,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.unsub")).await.unwrap(),
            handle_unsubscribe,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.subclose")).await.unwrap(),
            handle_sub_close,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.close")).await.unwrap(),
            handle_close,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.ping")).await.unwrap(),
            handle_ping,
        );
        spawn_handler(
            state.clone(),
            bus.subscribe(format!("{SERVER_PREFIX}.acks.>")).await.unwrap(),
            handle_sub_ack,
        );

        Self { state }
    }

    /// Hold publish acks until [`resume_acks`](Self::resume_acks).
    pub fn pause_acks(&self) {
        self.state.acking.store(false, Ordering::Release);
    }

    /// Release every held publish ack.
    pub async fn resume_acks(&self) {
        self.state.acking.store(true, Ordering::Release);
        let held: Vec<(String, rill_proto::PubAck)> =
            self.state.pending_acks.lock().drain(..).collect();
        for (reply, ack) in held {
            if let Ok(payload) = rill_proto::encode(&ack) {
                let _ = self.state.bus.publish(reply, payload).await;
            }
        }
    }

    /// Make the server ack every publish with the given error.
    pub fn fail_publishes(&self, reason: &str) {
        *self.state.publish_failure.lock() = Some(reason.to_string());
    }

    /// Simulate the client being replaced by a new session: the old
    /// session's pings stop matching and are rejected.
    pub fn replace_client(&self, client_id: &str) {
        if let Some(mut session) = self.state.clients.get_mut(client_id) {
            let next = self.state.conn_counter.fetch_add(1, Ordering::Relaxed);
            session.conn_id = format!("conn-{next}").into_bytes();
        }
    }

    /// Redeliver every delivered-but-unacked message on `subject`, with the
    /// redelivered flag set and the per-message redelivery count bumped.
    pub async fn redeliver_pending(&self, subject: &str) {
        let subs: Vec<Arc<SubEntry>> = self
            .state
            .subs
            .lock()
            .iter()
            .filter(|s| s.subject == subject)
            .cloned()
            .collect();
        for sub in subs {
            let pending: Vec<(u64, u32)> = {
                let mut pending = sub.pending.lock();
                pending
                    .iter_mut()
                    .map(|(seq, count)| {
                        *count += 1;
                        (*seq, *count)
                    })
                    .collect()
            };
            for (sequence, redelivery_count) in pending {
                let stored = self.state.channels.get(subject).and_then(|msgs| {
                    msgs.iter().find(|m| m.sequence == sequence).cloned()
                });
                let Some(stored) = stored else { continue };
                let msg = rill_proto::MsgProto {
                    sequence,
                    subject: subject.to_string(),
                    data: stored.data,
                    timestamp_ns: stored.timestamp_ns,
                    redelivered: true,
                    redelivery_count,
                    crc32: 0,
                };
                if let Ok(payload) = rill_proto::encode(&msg) {
                    let _ = self.state.bus.publish(sub.inbox.clone(), payload).await;
                }
            }
        }
    }

    /// Last acked sequence recorded for a durable subscription.
    pub fn last_acked(&self, client_id: &str, durable: &str, subject: &str) -> Option<u64> {
        self.state
            .durables
            .get(&ServerState::durable_key(client_id, durable, subject))
            .map(|v| *v)
    }

    /// Delivered-but-unacked messages across all subscriptions on `subject`.
    pub fn pending_count(&self, subject: &str) -> usize {
        self.state
            .subs
            .lock()
            .iter()
            .filter(|s| s.subject == subject)
            .map(|s| s.pending.lock().len())
            .sum()
    }
}

fn spawn_handler<F, Fut>(state: Arc<ServerState>, mut stream: BusStream, handle: F)
where
    F: Fn(Arc<ServerState>, BusMessage) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            handle(state.clone(), msg).await;
        }
    });
}

async fn reply_to(state: &ServerState, msg: &BusMessage, payload: Bytes) {
    if let Some(reply) = &msg.reply {
        let _ = state.bus.publish(reply.clone(), payload).await;
    }
}

async fn handle_connect(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(request) = rill_proto::decode::<rill_proto::ConnectRequest>(&msg.payload) else {
        return;
    };
    let response = if state.clients.contains_key(&request.client_id) {
        rill_proto::ConnectResponse {
            error: format!("clientID already registered: {}", request.client_id),
            ..Default::default()
        }
    } else {
        let next = state.conn_counter.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("conn-{next}").into_bytes();
        state.clients.insert(
            request.client_id.clone(),
            ClientSession {
                conn_id: conn_id.clone(),
            },
        );
        rill_proto::ConnectResponse {
            pub_prefix: format!("{SERVER_PREFIX}.pub"),
            sub_requests: format!("{SERVER_PREFIX}.sub"),
            unsub_requests: format!("{SERVER_PREFIX}.unsub"),
            close_requests: format!("{SERVER_PREFIX}.close"),
            sub_close_requests: if state.support_sub_close {
                format!("{SERVER_PREFIX}.subclose")
            } else {
                String::new()
            },
            ping_requests: format!("{SERVER_PREFIX}.ping"),
            ping_interval_ms: 0,
            ping_max_out: 0,
            conn_id,
            error: String::new(),
        }
    };
    if let Ok(payload) = rill_proto::encode(&response) {
        reply_to(&state, &msg, payload).await;
    }
}

async fn handle_publish(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(pub_msg) = rill_proto::decode::<rill_proto::PubMsg>(&msg.payload) else {
        return;
    };

    let ack = match state.publish_failure.lock().clone() {
        Some(reason) => rill_proto::PubAck {
            guid: pub_msg.guid.clone(),
            error: reason,
        },
        None => rill_proto::PubAck {
            guid: pub_msg.guid.clone(),
            error: String::new(),
        },
    };

    if ack.error.is_empty() {
        let stored = {
            let mut channel = state.channels.entry(pub_msg.subject.clone()).or_default();
            let stored = StoredMsg {
                sequence: channel.len() as u64 + 1,
                data: pub_msg.data,
                timestamp_ns: ServerState::now_ns(),
            };
            channel.push(stored.clone());
            stored
        };
        state.fan_out(&pub_msg.subject, &stored).await;
    }

    let Some(reply) = msg.reply else { return };
    if state.acking.load(Ordering::Acquire) {
        if let Ok(payload) = rill_proto::encode(&ack) {
            let _ = state.bus.publish(reply, payload).await;
        }
    } else {
        state.pending_acks.lock().push((reply, ack));
    }
}

async fn handle_subscribe(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(request) = rill_proto::decode::<rill_proto::SubscriptionRequest>(&msg.payload) else {
        return;
    };
    if !state.clients.contains_key(&request.client_id) {
        let response = rill_proto::SubscriptionResponse {
            ack_inbox: String::new(),
            error: format!("unknown clientID: {}", request.client_id),
        };
        if let Ok(payload) = rill_proto::encode(&response) {
            reply_to(&state, &msg, payload).await;
        }
        return;
    }

    let next = state.ack_inbox_counter.fetch_add(1, Ordering::Relaxed);
    let durable = (!request.durable_name.is_empty()).then(|| request.durable_name.clone());
    let sub = Arc::new(SubEntry {
        client_id: request.client_id.clone(),
        subject: request.subject.clone(),
        queue_group: (!request.queue_group.is_empty()).then(|| request.queue_group.clone()),
        inbox: request.inbox.clone(),
        ack_inbox: format!("{SERVER_PREFIX}.acks.{next}"),
        durable: durable.clone(),
        pending: Mutex::new(BTreeMap::new()),
    });
    state.subs.lock().push(sub.clone());

    let response = rill_proto::SubscriptionResponse {
        ack_inbox: sub.ack_inbox.clone(),
        error: String::new(),
    };
    if let Ok(payload) = rill_proto::encode(&response) {
        reply_to(&state, &msg, payload).await;
    }

    // Initial replay. A durable that already has acked progress resumes
    // from there, whatever start position the request carries.
    let resume_after = durable.as_ref().and_then(|name| {
        state
            .durables
            .get(&ServerState::durable_key(&request.client_id, name, &request.subject))
            .map(|v| *v)
    });
    let replay: Vec<StoredMsg> = {
        let Some(channel) = state.channels.get(&request.subject) else {
            return;
        };
        match resume_after {
            Some(acked) => channel.iter().filter(|m| m.sequence > acked).cloned().collect(),
            None => match request.start_position {
                rill_proto::StartPosition::First => channel.iter().cloned().collect(),
                rill_proto::StartPosition::SequenceStart => channel
                    .iter()
                    .filter(|m| m.sequence >= request.start_sequence)
                    .cloned()
                    .collect(),
                rill_proto::StartPosition::LastReceived => {
                    channel.iter().last().cloned().into_iter().collect()
                }
                rill_proto::StartPosition::TimeDeltaStart => {
                    let cutoff = ServerState::now_ns() - request.start_time_delta_ns;
                    channel
                        .iter()
                        .filter(|m| m.timestamp_ns >= cutoff)
                        .cloned()
                        .collect()
                }
                rill_proto::StartPosition::NewOnly => Vec::new(),
            },
        }
    };
    for stored in replay {
        state.send_to_sub(&sub, &stored).await;
    }
}

async fn handle_unsubscribe(state: Arc<ServerState>, msg: BusMessage) {
    remove_sub(state, msg, true).await;
}

async fn handle_sub_close(state: Arc<ServerState>, msg: BusMessage) {
    remove_sub(state, msg, false).await;
}

async fn remove_sub(state: Arc<ServerState>, msg: BusMessage, forget_durable: bool) {
    let Ok(request) = rill_proto::decode::<rill_proto::UnsubscribeRequest>(&msg.payload) else {
        return;
    };
    let removed = {
        let mut subs = state.subs.lock();
        let before = subs.len();
        subs.retain(|s| s.inbox != request.inbox);
        before != subs.len()
    };
    if removed && forget_durable && !request.durable_name.is_empty() {
        state.durables.remove(&ServerState::durable_key(
            &request.client_id,
            &request.durable_name,
            &request.subject,
        ));
    }
    let response = rill_proto::SubscriptionResponse {
        ack_inbox: String::new(),
        error: if removed {
            String::new()
        } else {
            "unknown subscription".to_string()
        },
    };
    if let Ok(payload) = rill_proto::encode(&response) {
        reply_to(&state, &msg, payload).await;
    }
}

async fn handle_close(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(request) = rill_proto::decode::<rill_proto::CloseRequest>(&msg.payload) else {
        return;
    };
    let known = state.clients.remove(&request.client_id).is_some();
    state
        .subs
        .lock()
        .retain(|s| s.client_id != request.client_id);
    let response = rill_proto::CloseResponse {
        error: if known {
            String::new()
        } else {
            format!("unknown clientID: {}", request.client_id)
        },
    };
    if let Ok(payload) = rill_proto::encode(&response) {
        reply_to(&state, &msg, payload).await;
    }
}

async fn handle_ping(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(ping) = rill_proto::decode::<rill_proto::Ping>(&msg.payload) else {
        return;
    };
    let known = state
        .clients
        .iter()
        .any(|entry| entry.value().conn_id == ping.conn_id);
    let response = rill_proto::PingResponse {
        error: if known {
            String::new()
        } else {
            "client has been replaced".to_string()
        },
    };
    if let Ok(payload) = rill_proto::encode(&response) {
        reply_to(&state, &msg, payload).await;
    }
}

async fn handle_sub_ack(state: Arc<ServerState>, msg: BusMessage) {
    let Ok(ack) = rill_proto::decode::<rill_proto::Ack>(&msg.payload) else {
        return;
    };
    let sub = state
        .subs
        .lock()
        .iter()
        .find(|s| s.ack_inbox == msg.subject)
        .cloned();
    let Some(sub) = sub else { return };
    sub.pending.lock().remove(&ack.sequence);
    if let Some(durable) = &sub.durable {
        let key = ServerState::durable_key(&sub.client_id, durable, &sub.subject);
        let mut entry = state.durables.entry(key).or_insert(0);
        if ack.sequence > *entry {
            *entry = ack.sequence;
        }
    }
}

/// Bus + server + ready-to-use options with short timeouts for tests.
pub async fn start_fixture(cluster_id: &str) -> (Arc<MockBus>, MockServer, ConnectOptions) {
    let bus = MockBus::new();
    let server = MockServer::start(bus.clone(), cluster_id).await;
    let options = test_options(bus.clone());
    (bus, server, options)
}

/// Options wired to the given bus, with timeouts suited to tests.
pub fn test_options(bus: Arc<MockBus>) -> ConnectOptions {
    ConnectOptions::new()
        .bus(bus)
        .connect_timeout(Duration::from_millis(500))
        .unwrap()
        .ack_timeout(Duration::from_secs(2))
        .unwrap()
}
