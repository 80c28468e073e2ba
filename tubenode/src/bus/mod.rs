//! Typed messages exchanged between the coordinator and its workers.
//!
//! The bus is the only path between a worker and the coordinator: secret
//! distribution, write jobs, write results, broadcast fan-out and log
//! forwarding all travel as discrete typed messages. No memory is shared
//! across the boundary.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default bus channel capacity.
pub const BUS_CAPACITY: usize = 256;

/// Identifies one worker on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A positionally-bound SQL parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// One mutation statement plus its bound values and correlation token.
///
/// The token is a generated UUID, collision-resistant within any pending
/// window; the submitting worker keeps the completion side in its private
/// pending table keyed by this token.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub query: String,
    pub params: Vec<SqlValue>,
    pub token: Uuid,
}

impl WriteJob {
    pub fn new(query: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            query: query.into(),
            params,
            token: Uuid::new_v4(),
        }
    }
}

/// An opaque event envelope fanned out to every worker's realtime clients.
///
/// The coordinator never interprets the payload; its only job is reliable
/// delivery to all workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Messages a worker sends to the coordinator.
#[derive(Debug)]
pub enum ToCoordinator {
    /// One-time request for the shared signing secret at worker startup.
    GetSecret { origin: WorkerId },
    /// Submit a write job; the result is routed back to `origin`.
    SubmitWrite { origin: WorkerId, job: WriteJob },
    /// Relay an event to every worker, including the sender.
    Broadcast(BroadcastMessage),
    /// Workers have no direct log sink; log lines funnel through here.
    LogForward {
        origin: WorkerId,
        message: String,
        trace: Option<String>,
        persist: bool,
    },
}

/// Messages the coordinator sends to a worker.
#[derive(Debug)]
pub enum ToWorker {
    /// Response to [`ToCoordinator::GetSecret`].
    Secret(String),
    /// Completion report for a previously submitted write job.
    WriteResult { token: Uuid, succeeded: bool },
    /// A broadcast relayed to this worker for its local realtime clients.
    Deliver(BroadcastMessage),
}

/// Coordinator-side bus endpoints.
pub struct CoordinatorBus {
    /// Shared many-to-one inbox carrying messages from every worker.
    pub inbox: mpsc::Receiver<ToCoordinator>,
    /// One outbound channel per worker, indexed by `WorkerId`.
    pub worker_txs: Vec<mpsc::Sender<ToWorker>>,
}

/// Worker-side bus endpoints.
pub struct WorkerBus {
    pub id: WorkerId,
    /// Outbound channel to the coordinator.
    pub tx: mpsc::Sender<ToCoordinator>,
    /// Inbound channel from the coordinator.
    pub inbox: mpsc::Receiver<ToWorker>,
}

/// Wire up the bus for `workers` workers.
///
/// Writes are applied in the order the coordinator receives them off the
/// shared inbox; there is no cross-worker fairness beyond arrival order.
pub fn wire(workers: usize) -> (CoordinatorBus, Vec<WorkerBus>) {
    let (to_coordinator_tx, to_coordinator_rx) = mpsc::channel(BUS_CAPACITY);

    let mut worker_txs = Vec::with_capacity(workers);
    let mut worker_buses = Vec::with_capacity(workers);

    for i in 0..workers {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        worker_txs.push(tx);
        worker_buses.push(WorkerBus {
            id: WorkerId(i),
            tx: to_coordinator_tx.clone(),
            inbox: rx,
        });
    }

    (
        CoordinatorBus {
            inbox: to_coordinator_rx,
            worker_txs,
        },
        worker_buses,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_job_tokens_are_unique() {
        let a = WriteJob::new("UPDATE videos SET views = views + 1", vec![]);
        let b = WriteJob::new("UPDATE videos SET views = views + 1", vec![]);
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn test_wire_routes_per_worker() {
        let (mut coordinator, mut workers) = wire(2);

        workers[0]
            .tx
            .send(ToCoordinator::GetSecret {
                origin: workers[0].id,
            })
            .await
            .unwrap();

        match coordinator.inbox.recv().await.unwrap() {
            ToCoordinator::GetSecret { origin } => assert_eq!(origin, WorkerId(0)),
            other => panic!("unexpected message: {other:?}"),
        }

        coordinator.worker_txs[1]
            .send(ToWorker::Secret("s".to_string()))
            .await
            .unwrap();

        match workers[1].inbox.recv().await.unwrap() {
            ToWorker::Secret(s) => assert_eq!(s, "s"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
