// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session and subscription configuration.
//!
//! Setters validate their input immediately, so an out-of-range value is a
//! [`Error::Config`] at the call site rather than a surprise at connect time.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bus::Bus;
use crate::error::{Error, Result};

/// Callback invoked (once per session) when the pinger declares the session
/// lost. Runs on its own task with no session locks held.
pub type ConnectionLostHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Default bus URL when no bus is injected.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
/// Default handshake reply deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default per-publish ack deadline.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on unacked publishes.
pub const DEFAULT_MAX_PUB_ACKS_IN_FLIGHT: usize = 16384;
/// Default ping cadence.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
/// Default consecutive-failure threshold before the session is declared lost.
pub const DEFAULT_PING_MAX_OUT: u32 = 3;
/// Default server-side delivery window per subscription.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 1024;
/// Default server-side redelivery deadline per subscription.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Configuration for [`Connection::connect`](crate::Connection::connect).
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) nats_url: String,
    pub(crate) bus: Option<Arc<dyn Bus>>,
    pub(crate) connect_timeout: Duration,
    pub(crate) ack_timeout: Duration,
    pub(crate) discover_prefix: String,
    pub(crate) max_pub_acks_in_flight: usize,
    pub(crate) pending_message_limit: Option<usize>,
    pub(crate) pending_bytes_limit: Option<usize>,
    pub(crate) ping_interval: Duration,
    pub(crate) ping_max_out: u32,
    pub(crate) connection_lost_handler: Option<ConnectionLostHandler>,
}

impl ConnectOptions {
    /// Options with the documented defaults.
    pub fn new() -> Self {
        Self {
            nats_url: DEFAULT_NATS_URL.to_string(),
            bus: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            discover_prefix: rill_proto::DEFAULT_DISCOVER_PREFIX.to_string(),
            max_pub_acks_in_flight: DEFAULT_MAX_PUB_ACKS_IN_FLIGHT,
            pending_message_limit: None,
            pending_bytes_limit: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_max_out: DEFAULT_PING_MAX_OUT,
            connection_lost_handler: None,
        }
    }

    /// Bus URL(s), comma-separated, used when no bus is injected.
    pub fn nats_url(mut self, url: impl Into<String>) -> Self {
        self.nats_url = url.into();
        self
    }

    /// Inject a pre-built bus. The session will not close it on teardown.
    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Handshake reply deadline. Must be non-zero.
    pub fn connect_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::config("connect timeout must be greater than zero"));
        }
        self.connect_timeout = timeout;
        Ok(self)
    }

    /// Per-publish ack deadline. Must be non-zero.
    pub fn ack_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::config("ack timeout must be greater than zero"));
        }
        self.ack_timeout = timeout;
        Ok(self)
    }

    /// Discovery subject prefix; must match the server's.
    pub fn discover_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(Error::config("discover prefix must be non-empty"));
        }
        self.discover_prefix = prefix;
        Ok(self)
    }

    /// Bound on unacked publishes. Must be non-zero.
    pub fn max_pub_acks_in_flight(mut self, max: usize) -> Result<Self> {
        if max == 0 {
            return Err(Error::config(
                "max pub acks in flight must be greater than zero",
            ));
        }
        self.max_pub_acks_in_flight = max;
        Ok(self)
    }

    /// Admission limit on in-flight publish count. Negative means unlimited;
    /// zero is rejected.
    pub fn pending_message_limit(mut self, limit: i64) -> Result<Self> {
        self.pending_message_limit = Self::pending_limit(limit, "pending message limit")?;
        Ok(self)
    }

    /// Admission limit on in-flight payload bytes. Negative means unlimited;
    /// zero is rejected.
    pub fn pending_bytes_limit(mut self, limit: i64) -> Result<Self> {
        self.pending_bytes_limit = Self::pending_limit(limit, "pending bytes limit")?;
        Ok(self)
    }

    fn pending_limit(limit: i64, what: &str) -> Result<Option<usize>> {
        match limit {
            0 => Err(Error::config(format!("{what} must not be zero"))),
            n if n < 0 => Ok(None),
            n => Ok(Some(n as usize)),
        }
    }

    /// Ping cadence. Must be non-zero; the server may shorten it.
    pub fn ping_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::config("ping interval must be greater than zero"));
        }
        self.ping_interval = interval;
        Ok(self)
    }

    /// Consecutive failed pings before the session is declared lost.
    /// Must be at least 3 so a single dropped ping is forgiven.
    pub fn ping_max_out(mut self, max_out: u32) -> Result<Self> {
        if max_out < 3 {
            return Err(Error::config("ping max out must be at least 3"));
        }
        self.ping_max_out = max_out;
        Ok(self)
    }

    /// Callback for the single session-lost report.
    pub fn connection_lost_handler(
        mut self,
        handler: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        self.connection_lost_handler = Some(Arc::new(handler));
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a new subscription starts in the channel's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published from now on.
    NewOnly,
    /// The last message received on the channel, if any, then everything
    /// after it. Valid on an empty channel (waits for the first message).
    LastReceived,
    /// Replay the channel from the beginning.
    AllAvailable,
    /// Start at the given sequence number.
    Sequence(u64),
    /// Start that far back in time.
    TimeDelta(Duration),
    /// Start at the given wall-clock instant. Converted to a
    /// duration-before-now when the subscription is created, so the server
    /// only ever sees a delta; instants in the future degenerate to "now".
    Time(SystemTime),
}

impl StartPosition {
    /// Wire representation: `(position, start_sequence, start_time_delta_ns)`.
    pub(crate) fn to_wire(self) -> (rill_proto::StartPosition, u64, i64) {
        match self {
            StartPosition::NewOnly => (rill_proto::StartPosition::NewOnly, 0, 0),
            StartPosition::LastReceived => (rill_proto::StartPosition::LastReceived, 0, 0),
            StartPosition::AllAvailable => (rill_proto::StartPosition::First, 0, 0),
            StartPosition::Sequence(seq) => (rill_proto::StartPosition::SequenceStart, seq, 0),
            StartPosition::TimeDelta(delta) => (
                rill_proto::StartPosition::TimeDeltaStart,
                0,
                delta.as_nanos() as i64,
            ),
            StartPosition::Time(instant) => {
                let delta = SystemTime::now()
                    .duration_since(instant)
                    .unwrap_or(Duration::ZERO);
                (
                    rill_proto::StartPosition::TimeDeltaStart,
                    0,
                    delta.as_nanos() as i64,
                )
            }
        }
    }
}

/// Configuration for [`Connection::subscribe`](crate::Connection::subscribe).
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub(crate) durable_name: Option<String>,
    pub(crate) max_in_flight: u32,
    pub(crate) ack_wait: Duration,
    pub(crate) manual_acks: bool,
    pub(crate) start: StartPosition,
    pub(crate) leave_open: bool,
}

impl SubscriptionOptions {
    /// Options with the documented defaults: new-only start, auto ack.
    pub fn new() -> Self {
        Self {
            durable_name: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            ack_wait: DEFAULT_ACK_WAIT,
            manual_acks: false,
            start: StartPosition::NewOnly,
            leave_open: false,
        }
    }

    /// Name the subscription's durable state on the server. A later
    /// subscribe with the same name resumes from where acks stopped.
    pub fn durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    /// Server-side delivery window: unacked messages it will send before
    /// pausing. Must be non-zero.
    pub fn max_in_flight(mut self, max: u32) -> Result<Self> {
        if max == 0 {
            return Err(Error::config("max in flight must be greater than zero"));
        }
        self.max_in_flight = max;
        Ok(self)
    }

    /// How long the server waits for an ack before redelivering.
    /// Must be at least one second.
    pub fn ack_wait(mut self, wait: Duration) -> Result<Self> {
        if wait < Duration::from_secs(1) {
            return Err(Error::config("ack wait must be at least one second"));
        }
        self.ack_wait = wait;
        Ok(self)
    }

    /// Disable auto-ack; the application calls
    /// [`Message::ack`](crate::Message::ack) on each message.
    pub fn manual_acks(mut self) -> Self {
        self.manual_acks = true;
        self
    }

    /// Start position in the channel's history.
    pub fn start_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    /// Replay everything already in the channel. Shorthand for
    /// [`start_at(StartPosition::AllAvailable)`](Self::start_at).
    pub fn deliver_all_available(self) -> Self {
        self.start_at(StartPosition::AllAvailable)
    }

    /// Make [`Subscription::shutdown`](crate::Subscription::shutdown)
    /// preserve durable state (close) instead of unsubscribing.
    pub fn leave_open(mut self) -> Self {
        self.leave_open = true;
        self
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new()
    }
}
