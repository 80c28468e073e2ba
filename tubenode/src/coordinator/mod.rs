//! The write coordinator.
//!
//! Sole owner of store write access. Every mutation in the node funnels
//! through this actor's inbox and executes on the single-connection write
//! pool, so at most one statement runs at any instant and jobs apply in
//! bus-arrival order. Job failures are isolated: they are reported to the
//! originating worker and never take the coordinator down.
//!
//! The coordinator also drives the periodic manifest reconciliation passes
//! inline on a timer in its own context; they use the read pool and never
//! enter the write-job queue.

use std::time::Duration;

use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{CoordinatorBus, SqlValue, ToCoordinator, ToWorker, WorkerId, WriteJob};
use crate::database::WritePool;
use crate::manifest::Reconciler;

/// Bind positional parameters onto a query in submission order.
fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// The write coordinator actor.
pub struct Coordinator {
    write_pool: WritePool,
    inbox: mpsc::Receiver<ToCoordinator>,
    worker_txs: Vec<mpsc::Sender<ToWorker>>,
    secret: String,
    reconciler: Reconciler,
    reconcile_interval: Duration,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        write_pool: WritePool,
        bus: CoordinatorBus,
        secret: String,
        reconciler: Reconciler,
        reconcile_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            write_pool,
            inbox: bus.inbox,
            worker_txs: bus.worker_txs,
            secret,
            reconciler,
            reconcile_interval,
            cancel,
        }
    }

    /// Spawn the coordinator task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(workers = self.worker_txs.len(), "Coordinator started");

        let mut reconcile_timer = interval(self.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Coordinator shutting down");
                    break;
                }

                msg = self.inbox.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => {
                            // Every worker endpoint dropped.
                            warn!("Coordinator inbox closed; stopping");
                            break;
                        }
                    }
                }

                _ = reconcile_timer.tick() => {
                    self.reconciler.tick().await;
                }
            }
        }
    }

    async fn handle(&mut self, msg: ToCoordinator) {
        match msg {
            ToCoordinator::SubmitWrite { origin, job } => {
                let token = job.token;
                let succeeded = self.execute(&job).await;
                self.reply(origin, ToWorker::WriteResult { token, succeeded })
                    .await;
            }
            ToCoordinator::Broadcast(message) => {
                // Opaque fan-out: deliver to every worker, sender included.
                for tx in &self.worker_txs {
                    if tx.send(ToWorker::Deliver(message.clone())).await.is_err() {
                        warn!("Broadcast delivery failed: worker endpoint closed");
                    }
                }
            }
            ToCoordinator::GetSecret { origin } => {
                self.reply(origin, ToWorker::Secret(self.secret.clone()))
                    .await;
            }
            ToCoordinator::LogForward {
                origin,
                message,
                trace,
                persist,
            } => {
                // Workers have no log sink of their own; their lines land
                // in the coordinator's subscriber.
                match trace {
                    Some(trace) => {
                        error!(worker = %origin, trace = %trace, "{}", message);
                    }
                    None if persist => info!(worker = %origin, "{}", message),
                    None => debug!(worker = %origin, "{}", message),
                }
            }
        }
    }

    /// Execute one write job against the store.
    ///
    /// The write pool holds a single connection: acquiring it is the mutex
    /// acquire, returning it on drop is the release. Failures are reported
    /// to the origin only; there is no automatic retry.
    async fn execute(&self, job: &WriteJob) -> bool {
        match bind_params(sqlx::query(&job.query), &job.params)
            .execute(&self.write_pool)
            .await
        {
            Ok(result) => {
                debug!(
                    token = %job.token,
                    rows = result.rows_affected(),
                    "Write job executed"
                );
                true
            }
            Err(e) => {
                warn!(token = %job.token, error = %e, "Write job failed");
                false
            }
        }
    }

    async fn reply(&self, origin: WorkerId, msg: ToWorker) {
        let Some(tx) = self.worker_txs.get(origin.0) else {
            warn!(worker = %origin, "Reply to unknown worker dropped");
            return;
        };
        if tx.send(msg).await.is_err() {
            warn!(worker = %origin, "Reply failed: worker endpoint closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{self, BroadcastMessage};
    use crate::database::repositories::SqlxVideoRepository;
    use crate::manifest::ManifestLayout;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, crate::database::DbPool, crate::database::WritePool) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("node.db").display());
        let pool = crate::database::init_pool(&url).await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        let write_pool = crate::database::init_write_pool(&url).await.unwrap();
        (dir, pool, write_pool)
    }

    fn spawn_coordinator(
        dir: &TempDir,
        pool: crate::database::DbPool,
        write_pool: crate::database::WritePool,
        bus: bus::CoordinatorBus,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new(
            ManifestLayout::new(dir.path().join("videos")),
            Arc::new(SqlxVideoRepository::new(pool)),
            true,
        );
        Coordinator::new(
            write_pool,
            bus,
            "secret".to_string(),
            reconciler,
            Duration::from_secs(3600),
            cancel.clone(),
        )
        .spawn();
        cancel
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated_per_job() {
        let (dir, pool, write_pool) = setup().await;
        let (coordinator_bus, mut workers) = bus::wire(1);
        let cancel = spawn_coordinator(&dir, pool, write_pool, coordinator_bus);

        let bad = WriteJob::new("UPDATE no_such_table SET x = 1", vec![]);
        let bad_token = bad.token;
        workers[0]
            .tx
            .send(ToCoordinator::SubmitWrite {
                origin: WorkerId(0),
                job: bad,
            })
            .await
            .unwrap();

        match workers[0].inbox.recv().await.unwrap() {
            ToWorker::WriteResult { token, succeeded } => {
                assert_eq!(token, bad_token);
                assert!(!succeeded);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The coordinator survives and executes the next job.
        let good = WriteJob::new(
            "INSERT INTO videos (video_id, created_at) VALUES (?, ?)",
            vec!["abc12345678".into(), "2026-01-01T00:00:00Z".into()],
        );
        let good_token = good.token;
        workers[0]
            .tx
            .send(ToCoordinator::SubmitWrite {
                origin: WorkerId(0),
                job: good,
            })
            .await
            .unwrap();

        match workers[0].inbox.recv().await.unwrap() {
            ToWorker::WriteResult { token, succeeded } => {
                assert_eq!(token, good_token);
                assert!(succeeded);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_workers_including_sender() {
        let (dir, pool, write_pool) = setup().await;
        let (coordinator_bus, mut workers) = bus::wire(2);
        let cancel = spawn_coordinator(&dir, pool, write_pool, coordinator_bus);

        let message = BroadcastMessage::new("imported", serde_json::json!({"id": "abc12345678"}));
        workers[0]
            .tx
            .send(ToCoordinator::Broadcast(message.clone()))
            .await
            .unwrap();

        for worker in workers.iter_mut() {
            match worker.inbox.recv().await.unwrap() {
                ToWorker::Deliver(delivered) => assert_eq!(delivered, message),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_secret_distribution() {
        let (dir, pool, write_pool) = setup().await;
        let (coordinator_bus, mut workers) = bus::wire(1);
        let cancel = spawn_coordinator(&dir, pool, write_pool, coordinator_bus);

        workers[0]
            .tx
            .send(ToCoordinator::GetSecret {
                origin: WorkerId(0),
            })
            .await
            .unwrap();

        match workers[0].inbox.recv().await.unwrap() {
            ToWorker::Secret(secret) => assert_eq!(secret, "secret"),
            other => panic!("unexpected message: {other:?}"),
        }

        cancel.cancel();
    }
}
