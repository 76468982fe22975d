// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session liveness: periodic pings and the single session-lost report.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::bus::Bus;
use crate::connection::ConnectionInner;

pub(crate) struct PingerConfig {
    /// Server subject pings are sent to.
    pub(crate) subject: String,
    /// Session token from the handshake, echoed in every ping.
    pub(crate) conn_id: Vec<u8>,
    /// Cadence; also the per-ping reply deadline.
    pub(crate) interval: Duration,
    /// Consecutive failures before the session is declared lost.
    pub(crate) max_out: u32,
}

/// Ping the server every `interval`. A reply with an empty error resets the
/// failure counter; a reply carrying an error (the server no longer knows
/// this session) or no reply at all increments it. At `max_out` the session
/// is declared lost exactly once and the task exits. A clean close cancels
/// the token, so the pinger never outlives the session.
pub(crate) fn spawn_pinger(
    bus: Arc<dyn Bus>,
    config: PingerConfig,
    session: Weak<ConnectionInner>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ping = rill_proto::Ping {
            conn_id: config.conn_id,
        };
        let payload = match rill_proto::encode(&ping) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode ping: {e}");
                return;
            }
        };

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        let mut outstanding: u32 = 0;
        let mut server_reason: Option<String> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = bus.request(config.subject.clone(), payload.clone(), config.interval) => outcome,
            };
            match outcome {
                Ok(reply) => match rill_proto::decode::<rill_proto::PingResponse>(&reply) {
                    Ok(response) if response.error.is_empty() => {
                        outstanding = 0;
                        server_reason = None;
                    }
                    Ok(response) => {
                        debug!(error = %response.error, "server rejected ping");
                        outstanding += 1;
                        server_reason = Some(response.error);
                    }
                    Err(e) => {
                        debug!("undecodable ping response: {e}");
                        outstanding += 1;
                    }
                },
                Err(_) => {
                    outstanding += 1;
                }
            }

            if outstanding >= config.max_out {
                let reason = server_reason.take().unwrap_or_else(|| {
                    format!("no ping response from the server in {outstanding} attempts")
                });
                if let Some(session) = session.upgrade() {
                    session.session_lost(reason).await;
                }
                return;
            }
        }
    })
}
