//! Background task queue
//!
//! Long jobs (hash-list runs, series episode caching) are queued to a single
//! worker and tracked by id, so admin callers get an immediate task id and
//! can poll for the outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use uuid::Uuid;

/// Finished records kept for status queries
const MAX_FINISHED_RECORDS: usize = 200;

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed { result: Value },
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed { .. } | TaskStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Job {
    id: Uuid,
    future: TaskFuture,
}

type Records = Arc<RwLock<HashMap<Uuid, TaskRecord>>>;

#[derive(Clone)]
pub struct TaskManager {
    records: Records,
    sender: mpsc::UnboundedSender<Job>,
}

impl TaskManager {
    /// Create the manager and spawn its worker. Jobs run one at a time in
    /// submission order.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let records: Records = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(run_worker(receiver, Arc::clone(&records)));

        Self { records, sender }
    }

    pub async fn submit<F>(&self, name: impl Into<String>, job: F) -> anyhow::Result<Uuid>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let name = name.into();

        self.records.write().await.insert(
            id,
            TaskRecord {
                id,
                name: name.clone(),
                status: TaskStatus::Queued,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        if self
            .sender
            .send(Job {
                id,
                future: Box::pin(job),
            })
            .is_err()
        {
            self.records.write().await.remove(&id);
            anyhow::bail!("task worker is not running");
        }

        info!(task = %id, name = %name, "Task queued");
        Ok(id)
    }

    pub async fn status(&self, id: &Uuid) -> Option<TaskRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Most recent first
    pub async fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        records
    }
}

async fn set_status(records: &Records, id: Uuid, status: TaskStatus) {
    let mut records = records.write().await;
    if let Some(record) = records.get_mut(&id) {
        if status.is_finished() {
            record.finished_at = Some(Utc::now());
        }
        record.status = status;
    }
}

async fn prune_finished(records: &Records) {
    let mut records = records.write().await;
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = records
        .values()
        .filter(|r| r.status.is_finished())
        .map(|r| (r.submitted_at, r.id))
        .collect();
    if finished.len() <= MAX_FINISHED_RECORDS {
        return;
    }

    finished.sort();
    let excess = finished.len() - MAX_FINISHED_RECORDS;
    for (_, id) in finished.into_iter().take(excess) {
        records.remove(&id);
    }
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<Job>, records: Records) {
    while let Some(job) = receiver.recv().await {
        set_status(&records, job.id, TaskStatus::Running).await;

        // Spawned so a panicking job is reported instead of killing the worker
        let status = match tokio::spawn(job.future).await {
            Ok(Ok(result)) => {
                info!(task = %job.id, "Task completed");
                TaskStatus::Completed { result }
            }
            Ok(Err(e)) => {
                error!(task = %job.id, "Task failed: {:#}", e);
                TaskStatus::Failed {
                    error: format!("{:#}", e),
                }
            }
            Err(e) => {
                error!(task = %job.id, "Task aborted: {}", e);
                TaskStatus::Failed {
                    error: "task panicked".to_string(),
                }
            }
        };

        set_status(&records, job.id, status).await;
        prune_finished(&records).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_finished(manager: &TaskManager, id: &Uuid) -> TaskRecord {
        for _ in 0..100 {
            let record = manager.status(id).await.unwrap();
            if record.status.is_finished() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} did not finish", id);
    }

    #[tokio::test]
    async fn test_completed_task_keeps_result() {
        let manager = TaskManager::start();
        let id = manager
            .submit("hashlist", async { Ok(json!({ "hashesAdded": 50 })) })
            .await
            .unwrap();

        let record = wait_finished(&manager, &id).await;
        assert_eq!(
            record.status,
            TaskStatus::Completed {
                result: json!({ "hashesAdded": 50 })
            }
        );
        assert!(record.finished_at.is_some());
        assert_eq!(record.name, "hashlist");
    }

    #[tokio::test]
    async fn test_failed_and_panicking_tasks() {
        let manager = TaskManager::start();
        let failing = manager
            .submit("failing", async { Err(anyhow::anyhow!("feed unreachable")) })
            .await
            .unwrap();
        let panicking = manager
            .submit("panicking", async {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            })
            .await
            .unwrap();
        let after = manager
            .submit("after", async { Ok(Value::Bool(true)) })
            .await
            .unwrap();

        assert_eq!(
            wait_finished(&manager, &failing).await.status,
            TaskStatus::Failed {
                error: "feed unreachable".to_string()
            }
        );
        assert!(matches!(
            wait_finished(&manager, &panicking).await.status,
            TaskStatus::Failed { .. }
        ));
        // The worker survives a panicking job
        assert!(matches!(
            wait_finished(&manager, &after).await.status,
            TaskStatus::Completed { .. }
        ));
        assert_eq!(manager.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let manager = TaskManager::start();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut ids = Vec::new();
        for n in 0..3 {
            let tx = tx.clone();
            ids.push(
                manager
                    .submit(format!("job-{}", n), async move {
                        tokio::time::sleep(Duration::from_millis(3 - n)).await;
                        tx.send(n).ok();
                        Ok(Value::Null)
                    })
                    .await
                    .unwrap(),
            );
        }
        for id in &ids {
            wait_finished(&manager, id).await;
        }

        let mut order = Vec::new();
        while let Ok(n) = rx.try_recv() {
            order.push(n);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_status_serialization() {
        let value = serde_json::to_value(TaskStatus::Failed {
            error: "x".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({ "state": "failed", "error": "x" }));
    }
}
