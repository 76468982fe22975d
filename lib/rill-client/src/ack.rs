// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ack dispatch: correlates server publish-acks with in-flight records and
//! runs user notifications off the bus path.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::BusStream;
use crate::error::Error;
use crate::publisher::{Completion, PublishShared, RecordHandler};

/// How many user ack callbacks may run at once per session.
const CALLBACK_CONCURRENCY: usize = 16;

/// Consume the session's ack inbox. Each decoded ack terminates its record;
/// acks for unknown GUIDs (already timed out, or from a replaced session)
/// are dropped. The loop never runs user code — completions are queued for
/// the callback worker so a slow callback cannot stall ack flow.
pub(crate) fn spawn_ack_dispatcher(
    mut acks: BusStream,
    shared: Arc<PublishShared>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = acks.next() => {
                    let Some(msg) = next else { break };
                    let ack: rill_proto::PubAck = match rill_proto::decode(&msg.payload) {
                        Ok(ack) => ack,
                        Err(e) => {
                            warn!("dropping undecodable publish ack: {e}");
                            continue;
                        }
                    };
                    let outcome = if ack.error.is_empty() {
                        None
                    } else {
                        Some(Error::Publish {
                            guid: ack.guid.clone(),
                            reason: ack.error,
                        })
                    };
                    if !shared.complete(&ack.guid, outcome) {
                        debug!(guid = %ack.guid, "ack for unknown guid dropped");
                    }
                }
            }
        }
    })
}

/// Dispatch publish completions, with no session locks held. Waiters are
/// resolved inline (a oneshot send never blocks); user callbacks each run on
/// their own task under a concurrency bound, so callbacks for different
/// records may run concurrently and a slow one cannot stall the rest.
/// [`Completion::Flush`] is acked once everything queued before it has been
/// dispatched. Exits when the completion channel's senders are gone; it is
/// kept alive through teardown so a closing session can still drain pending
/// notifications.
pub(crate) fn spawn_callback_worker(
    completions: flume::Receiver<Completion>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pool = Arc::new(Semaphore::new(CALLBACK_CONCURRENCY));
        while let Ok(completion) = completions.recv_async().await {
            match completion {
                Completion::Terminal {
                    guid,
                    outcome,
                    handler,
                } => match handler {
                    RecordHandler::Waiter(tx) => {
                        let _ = tx.send(match outcome {
                            None => Ok(guid),
                            Some(e) => Err(e),
                        });
                    }
                    RecordHandler::Callback(on_ack) => {
                        let Ok(permit) = pool.clone().acquire_owned().await else {
                            break;
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            on_ack(&guid, outcome);
                        });
                    }
                },
                Completion::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    })
}
