//! Request-handling workers.
//!
//! A worker never touches the store for mutations: it forwards write jobs
//! to the coordinator over the bus and suspends the originating request on
//! a oneshot until the correlated result arrives. There is no timeout on
//! that wait; the bus is in-process and reliable.
//!
//! Each worker owns a private pending-write table (correlation token to
//! completion sender) and a local realtime hub that fans delivered
//! broadcasts out to its own connected WebSocket clients.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BroadcastMessage, SqlValue, ToCoordinator, ToWorker, WorkerBus, WorkerId, WriteJob};
use crate::error::Result;

/// Capacity of the per-worker realtime client hub.
const REALTIME_HUB_CAPACITY: usize = 256;

/// Local command channel capacity.
const COMMAND_CAPACITY: usize = 256;

enum LocalCommand {
    SubmitWrite {
        query: String,
        params: Vec<SqlValue>,
        reply: oneshot::Sender<bool>,
    },
    Broadcast(BroadcastMessage),
    GetSecret {
        reply: oneshot::Sender<String>,
    },
    LogForward {
        message: String,
        trace: Option<String>,
        persist: bool,
    },
}

/// Handle used by request handlers to talk to their worker task.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::Sender<LocalCommand>,
    hub: broadcast::Sender<BroadcastMessage>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Submit a mutation to the coordinator and await its result.
    ///
    /// Suspends until the correlated write result arrives; on store
    /// rejection the job is reported failed to this caller only. Failed
    /// jobs are not retried automatically; resubmit if needed.
    pub async fn submit_write(
        &self,
        query: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LocalCommand::SubmitWrite {
                query: query.into(),
                params,
                reply,
            })
            .await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))?;

        let succeeded = rx
            .await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))?;
        if succeeded {
            Ok(())
        } else {
            Err(crate::Error::WriteFailed(
                "store rejected the mutation".to_string(),
            ))
        }
    }

    /// Relay an event to every worker's realtime clients, this one included.
    ///
    /// Fire-and-forget: delivery cannot be awaited or withdrawn.
    pub async fn broadcast(&self, event: impl Into<String>, data: serde_json::Value) -> Result<()> {
        self.commands
            .send(LocalCommand::Broadcast(BroadcastMessage::new(event, data)))
            .await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))
    }

    /// One-time fetch of the shared signing secret at startup.
    pub async fn secret(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LocalCommand::GetSecret { reply })
            .await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))?;
        rx.await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))
    }

    /// Forward a log line to the coordinator's subscriber.
    pub async fn forward_log(
        &self,
        message: impl Into<String>,
        trace: Option<String>,
        persist: bool,
    ) -> Result<()> {
        self.commands
            .send(LocalCommand::LogForward {
                message: message.into(),
                trace,
                persist,
            })
            .await
            .map_err(|_| crate::Error::BusClosed("worker stopped"))
    }

    /// Attach a realtime client to this worker's hub.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.hub.subscribe()
    }
}

/// One worker task.
struct Worker {
    id: WorkerId,
    bus_tx: mpsc::Sender<ToCoordinator>,
    bus_rx: mpsc::Receiver<ToWorker>,
    local_rx: mpsc::Receiver<LocalCommand>,
    hub: broadcast::Sender<BroadcastMessage>,
    /// Private pending-write table: correlation token to completion sender.
    pending: HashMap<Uuid, oneshot::Sender<bool>>,
    /// Outstanding secret requests, answered in FIFO order.
    pending_secrets: VecDeque<oneshot::Sender<String>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = %self.id, "Worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(worker = %self.id, "Worker shutting down");
                    break;
                }

                command = self.local_rx.recv() => {
                    match command {
                        Some(command) => self.handle_local(command).await,
                        None => break,
                    }
                }

                msg = self.bus_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_bus(msg),
                        None => {
                            // The coordinator is the sole store owner; losing
                            // it is fatal for this worker too.
                            warn!(worker = %self.id, "Coordinator endpoint closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_local(&mut self, command: LocalCommand) {
        match command {
            LocalCommand::SubmitWrite {
                query,
                params,
                reply,
            } => {
                let job = WriteJob::new(query, params);
                let token = job.token;
                self.pending.insert(token, reply);
                let sent = self
                    .bus_tx
                    .send(ToCoordinator::SubmitWrite {
                        origin: self.id,
                        job,
                    })
                    .await;
                if sent.is_err() {
                    // Dropping the sender surfaces BusClosed to the caller.
                    self.pending.remove(&token);
                }
            }
            LocalCommand::Broadcast(message) => {
                if self
                    .bus_tx
                    .send(ToCoordinator::Broadcast(message))
                    .await
                    .is_err()
                {
                    warn!(worker = %self.id, "Broadcast dropped: bus closed");
                }
            }
            LocalCommand::GetSecret { reply } => {
                self.pending_secrets.push_back(reply);
                if self
                    .bus_tx
                    .send(ToCoordinator::GetSecret { origin: self.id })
                    .await
                    .is_err()
                {
                    self.pending_secrets.pop_back();
                }
            }
            LocalCommand::LogForward {
                message,
                trace,
                persist,
            } => {
                let _ = self
                    .bus_tx
                    .send(ToCoordinator::LogForward {
                        origin: self.id,
                        message,
                        trace,
                        persist,
                    })
                    .await;
            }
        }
    }

    fn handle_bus(&mut self, msg: ToWorker) {
        match msg {
            ToWorker::WriteResult { token, succeeded } => {
                match self.pending.remove(&token) {
                    Some(reply) => {
                        let _ = reply.send(succeeded);
                    }
                    None => {
                        warn!(worker = %self.id, token = %token, "Result for unknown write job");
                    }
                }
            }
            ToWorker::Secret(secret) => {
                if let Some(reply) = self.pending_secrets.pop_front() {
                    let _ = reply.send(secret);
                }
            }
            ToWorker::Deliver(message) => {
                // No subscribers is fine; realtime clients come and go.
                let _ = self.hub.send(message);
            }
        }
    }
}

/// Spawn one worker task per bus endpoint and return their handles.
pub fn spawn_workers(buses: Vec<WorkerBus>, cancel: &CancellationToken) -> Vec<WorkerHandle> {
    buses
        .into_iter()
        .map(|bus| {
            let (local_tx, local_rx) = mpsc::channel(COMMAND_CAPACITY);
            let (hub, _) = broadcast::channel(REALTIME_HUB_CAPACITY);

            let worker = Worker {
                id: bus.id,
                bus_tx: bus.tx,
                bus_rx: bus.inbox,
                local_rx,
                hub: hub.clone(),
                pending: HashMap::new(),
                pending_secrets: VecDeque::new(),
                cancel: cancel.child_token(),
            };
            let handle = WorkerHandle {
                id: worker.id,
                commands: local_tx,
                hub,
            };
            tokio::spawn(worker.run());
            handle
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{self, ToCoordinator};

    /// Minimal coordinator stand-in: every write succeeds, broadcasts are
    /// relayed to all workers.
    fn spawn_echo_coordinator(mut coordinator_bus: bus::CoordinatorBus) {
        tokio::spawn(async move {
            while let Some(msg) = coordinator_bus.inbox.recv().await {
                match msg {
                    ToCoordinator::SubmitWrite { origin, job } => {
                        let _ = coordinator_bus.worker_txs[origin.0]
                            .send(ToWorker::WriteResult {
                                token: job.token,
                                succeeded: true,
                            })
                            .await;
                    }
                    ToCoordinator::Broadcast(message) => {
                        for tx in &coordinator_bus.worker_txs {
                            let _ = tx.send(ToWorker::Deliver(message.clone())).await;
                        }
                    }
                    ToCoordinator::GetSecret { origin } => {
                        let _ = coordinator_bus.worker_txs[origin.0]
                            .send(ToWorker::Secret("hub-secret".to_string()))
                            .await;
                    }
                    ToCoordinator::LogForward { .. } => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn test_submit_write_resolves_pending_request() {
        let (coordinator_bus, worker_buses) = bus::wire(1);
        spawn_echo_coordinator(coordinator_bus);
        let cancel = CancellationToken::new();
        let handles = spawn_workers(worker_buses, &cancel);

        handles[0]
            .submit_write("UPDATE videos SET views = views + 1", vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_observed_on_other_worker() {
        let (coordinator_bus, worker_buses) = bus::wire(2);
        spawn_echo_coordinator(coordinator_bus);
        let cancel = CancellationToken::new();
        let handles = spawn_workers(worker_buses, &cancel);

        let mut client_on_b = handles[1].subscribe();
        handles[0]
            .broadcast("imported", serde_json::json!({"id": "abc12345678"}))
            .await
            .unwrap();

        let delivered = client_on_b.recv().await.unwrap();
        assert_eq!(delivered.event, "imported");
    }

    #[tokio::test]
    async fn test_log_forwarding_reaches_the_bus() {
        let (mut coordinator_bus, worker_buses) = bus::wire(1);
        let cancel = CancellationToken::new();
        let handles = spawn_workers(worker_buses, &cancel);

        handles[0]
            .forward_log("segment upload rejected", Some("trace".to_string()), true)
            .await
            .unwrap();

        match coordinator_bus.inbox.recv().await.unwrap() {
            ToCoordinator::LogForward {
                origin,
                message,
                trace,
                persist,
            } => {
                assert_eq!(origin, WorkerId(0));
                assert_eq!(message, "segment upload rejected");
                assert_eq!(trace.as_deref(), Some("trace"));
                assert!(persist);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_secret_round_trip() {
        let (coordinator_bus, worker_buses) = bus::wire(1);
        spawn_echo_coordinator(coordinator_bus);
        let cancel = CancellationToken::new();
        let handles = spawn_workers(worker_buses, &cancel);

        assert_eq!(handles[0].secret().await.unwrap(), "hub-secret");
    }
}
