//! Single-writer arbitration actor.
//!
//! All events go through one bounded queue and are evaluated one at a time,
//! so read-decide-write never interleaves between evaluations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::router::{ArbitrationRouter, DispatchEvent, Outcome};
use super::DispatchError;
use crate::config::EngineConfig;
use crate::domain::SensorKind;

type Reply = oneshot::Sender<Result<Outcome, DispatchError>>;

struct Envelope {
    event: DispatchEvent,
    reply: Option<Reply>,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Envelope>,
    request_timeout: Duration,
}

impl EngineHandle {
    /// Enqueues without waiting. Returns `false` when the event was dropped
    /// because the queue is full or the engine has stopped.
    pub fn submit(&self, event: DispatchEvent) -> bool {
        let kind = event.kind();
        match self.tx.try_send(Envelope { event, reply: None }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = kind, "dispatch queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event = kind, "dispatch engine stopped, event dropped");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Enqueues and waits for the evaluation result.
    pub async fn dispatch(&self, event: DispatchEvent) -> Result<Outcome, DispatchError> {
        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            event,
            reply: Some(reply),
        };
        let round_trip = async {
            self.tx
                .send(envelope)
                .await
                .map_err(|_| DispatchError::EngineClosed)?;
            rx.await.map_err(|_| DispatchError::EngineClosed)?
        };
        tokio::time::timeout(self.request_timeout, round_trip)
            .await
            .map_err(|_| DispatchError::Timeout)?
    }
}

pub struct DispatchEngine;

impl DispatchEngine {
    pub fn spawn(router: Arc<ArbitrationRouter>, cfg: &EngineConfig) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let task = tokio::spawn(run(router, rx));
        let handle = EngineHandle {
            tx,
            request_timeout: cfg.request_timeout(),
        };
        (handle, task)
    }
}

async fn run(router: Arc<ArbitrationRouter>, mut rx: mpsc::Receiver<Envelope>) {
    info!("dispatch engine started");
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        let queued = batch.len();
        let batch = coalesce(batch);
        if batch.len() < queued {
            debug!(queued, evaluations = batch.len(), "coalesced sensor updates");
        }

        for Envelope { event, reply } in batch {
            let span = info_span!("evaluation", event = event.kind());
            let result = router.handle(event).instrument(span).await;
            match &result {
                Ok(outcome) => debug!(?outcome, "evaluation finished"),
                Err(e) => warn!(error = %e, "evaluation deferred"),
            }
            if let Some(reply) = reply {
                // The caller may have timed out and gone away.
                let _ = reply.send(result);
            }
        }
    }
    info!("dispatch engine stopped");
}

/// Folds runs of fire-and-forget sensor updates into one evaluation. The
/// result is a `gen_power` update if any of them was one, since that forces
/// the degraded path to re-evaluate.
fn coalesce(batch: Vec<Envelope>) -> Vec<Envelope> {
    let mut out: Vec<Envelope> = Vec::with_capacity(batch.len());
    for env in batch {
        let merged = match (out.last_mut(), &env) {
            (
                Some(Envelope {
                    event: DispatchEvent::SensorUpdate(pending),
                    reply: None,
                }),
                Envelope {
                    event: DispatchEvent::SensorUpdate(next),
                    reply: None,
                },
            ) => {
                *pending = merge(*pending, *next);
                true
            }
            _ => false,
        };
        if !merged {
            out.push(env);
        }
    }
    out
}

fn merge(pending: SensorKind, next: SensorKind) -> SensorKind {
    if pending == SensorKind::GenPower || next == SensorKind::GenPower {
        SensorKind::GenPower
    } else if next.triggers_arbitration() || !pending.triggers_arbitration() {
        next
    } else {
        pending
    }
}
