//! Durable async task manager for long-running CLI executions.
//!
//! Tasks are persisted in SQLite so status survives across requests and can
//! be polled over HTTP. Workers are plain tokio tasks bounded by a
//! semaphore; all row access goes through one mutex-guarded connection.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PollingConfig;
use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub status: TaskStatus,
    pub config: Value,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const TERMINAL_GUARD: &str = "status NOT IN ('completed','failed','timeout','cancelled')";

/// Mutex-guarded SQLite handle. All statements are short; nothing holds the
/// lock across an await point.
struct TaskDb {
    conn: std::sync::Mutex<Connection>,
}

impl TaskDb {
    fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open polling database: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at REAL NOT NULL,
                started_at REAL,
                completed_at REAL,
                result TEXT,
                error TEXT,
                progress TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn insert(&self, task_id: &str, config: &Value) -> Result<()> {
        self.lock().execute(
            "INSERT INTO tasks (task_id, status, config, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, "pending", config.to_string(), unix_now()],
        )?;
        Ok(())
    }

    /// pending → running. Returns false when the task was cancelled (or
    /// otherwise moved) before the worker got a slot.
    fn mark_running(&self, task_id: &str) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE tasks SET status='running', started_at=?2 WHERE task_id=?1 AND status='pending'",
            params![task_id, unix_now()],
        )?;
        Ok(changed > 0)
    }

    /// Transition into a terminal state. Refuses to overwrite a row that is
    /// already terminal, which keeps terminal states final.
    fn mark_terminal(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let sql = format!(
            "UPDATE tasks SET status=?2, completed_at=?3, result=?4, error=?5
             WHERE task_id=?1 AND {TERMINAL_GUARD}"
        );
        let changed = self.lock().execute(
            &sql,
            params![
                task_id,
                status.as_str(),
                unix_now(),
                result.map(Value::to_string),
                error
            ],
        )?;
        Ok(changed > 0)
    }

    fn set_progress(&self, task_id: &str, progress: &Value) -> Result<()> {
        let sql =
            format!("UPDATE tasks SET progress=?2 WHERE task_id=?1 AND {TERMINAL_GUARD}");
        self.lock()
            .execute(&sql, params![task_id, progress.to_string()])?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskInfo>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT task_id, status, config, created_at, started_at, completed_at,
                        result, error, progress
                 FROM tasks WHERE task_id=?1",
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    fn active(&self) -> Result<Vec<TaskInfo>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, status, config, created_at, started_at, completed_at,
                    result, error, progress
             FROM tasks WHERE status IN ('pending','running') ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_terminal_before(&self, cutoff: f64) -> Result<usize> {
        let changed = self.lock().execute(
            "DELETE FROM tasks WHERE completed_at < ?1
             AND status IN ('completed','failed','timeout','cancelled')",
            params![cutoff],
        )?;
        Ok(changed)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskInfo> {
    let status_raw: String = row.get(1)?;
    let config_raw: String = row.get(2)?;
    let result_raw: Option<String> = row.get(6)?;
    let progress_raw: Option<String> = row.get(8)?;
    Ok(TaskInfo {
        task_id: row.get(0)?,
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Failed),
        config: serde_json::from_str(&config_raw).unwrap_or(Value::Null),
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        result: result_raw.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(7)?,
        progress: progress_raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Handle passed into a worker's closure for coarse progress reporting.
#[derive(Clone)]
pub struct TaskHandle {
    db: Arc<TaskDb>,
    pub task_id: String,
}

impl TaskHandle {
    pub fn set_progress(&self, progress: Value) {
        if let Err(e) = self.db.set_progress(&self.task_id, &progress) {
            warn!("failed to record progress for {}: {e}", self.task_id);
        }
    }
}

pub struct PollingManager {
    db: Arc<TaskDb>,
    semaphore: Arc<Semaphore>,
    workers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    poll_interval: Duration,
    cleanup_after: Duration,
}

impl PollingManager {
    pub fn new(config: &PollingConfig) -> Result<Arc<Self>> {
        let db = TaskDb::open(&config.db_path)?;
        info!(
            "polling manager ready (db {}, {} slots)",
            config.db_path.display(),
            config.max_concurrent_tasks
        );
        Ok(Arc::new(Self {
            db: Arc::new(db),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            workers: std::sync::Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            cleanup_after: Duration::from_secs(config.cleanup_after_hours * 3600),
        }))
    }

    /// Create a task row and spawn its worker. Returns the task id
    /// immediately; the work runs in the background under the concurrency
    /// semaphore.
    pub fn submit<F, Fut>(self: &Arc<Self>, config: Value, work: F) -> Result<String, GatewayError>
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, GatewayError>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        self.db.insert(&task_id, &config).map_err(GatewayError::Internal)?;
        info!("submitted task {task_id}");

        let manager = self.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = match manager.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            match manager.db.mark_running(&id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("task {id} no longer pending, skipping execution");
                    manager.forget_worker(&id);
                    return;
                }
                Err(e) => {
                    error!("task {id}: failed to mark running: {e}");
                    manager.forget_worker(&id);
                    return;
                }
            }

            let handle = TaskHandle {
                db: manager.db.clone(),
                task_id: id.clone(),
            };
            let outcome = work(handle).await;

            let transition = match &outcome {
                Ok(result) => manager
                    .db
                    .mark_terminal(&id, TaskStatus::Completed, Some(result), None),
                Err(e) => {
                    let message = e.to_string();
                    manager
                        .db
                        .mark_terminal(&id, TaskStatus::Failed, None, Some(message.as_str()))
                }
            };
            match transition {
                Ok(true) => match outcome {
                    Ok(_) => info!("task {id} completed"),
                    Err(e) => error!("task {id} failed: {e}"),
                },
                Ok(false) => debug!("task {id} already terminal, result dropped"),
                Err(e) => error!("task {id}: failed to record outcome: {e}"),
            }
            manager.forget_worker(&id);
        });

        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Drop entries for workers that already finished so the map stays
        // bounded even when a worker wins the race against this insert.
        workers.retain(|_, h| !h.is_finished());
        workers.insert(task_id.clone(), handle);
        drop(workers);
        Ok(task_id)
    }

    fn forget_worker(&self, task_id: &str) {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(task_id);
    }

    pub fn get_status(&self, task_id: &str) -> Result<Option<TaskInfo>, GatewayError> {
        self.db.load(task_id).map_err(GatewayError::Internal)
    }

    pub fn active_tasks(&self) -> Result<Vec<TaskInfo>, GatewayError> {
        self.db.active().map_err(GatewayError::Internal)
    }

    /// Poll until the task reaches a terminal state or the timeout elapses.
    /// A timeout marks the row `timeout` but leaves the worker running
    /// unless it is explicitly cancelled.
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        let started = std::time::Instant::now();
        loop {
            let Some(task) = self.get_status(task_id)? else {
                return Err(GatewayError::Config(format!("task {task_id} not found")));
            };

            match task.status {
                TaskStatus::Completed => {
                    return Ok(task.result.unwrap_or(Value::Null));
                }
                TaskStatus::Cancelled => return Err(GatewayError::Cancelled),
                TaskStatus::Timeout => {
                    return Err(GatewayError::Timeout(
                        timeout.unwrap_or(self.poll_interval),
                    ))
                }
                TaskStatus::Failed => {
                    return Err(GatewayError::Provider {
                        message: task
                            .error
                            .unwrap_or_else(|| "task failed without error detail".into()),
                        retryable: false,
                    })
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    let message = format!("timeout after {}s", limit.as_secs_f64());
                    let _ = self
                        .db
                        .mark_terminal(task_id, TaskStatus::Timeout, None, Some(message.as_str()))
                        .map_err(GatewayError::Internal)?;
                    warn!("task {task_id} timed out after {limit:?}");
                    return Err(GatewayError::Timeout(limit));
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Cancel a task: abort its worker and mark the row cancelled. Returns
    /// false for unknown or already-terminal tasks.
    pub fn cancel(&self, task_id: &str) -> Result<bool, GatewayError> {
        let Some(task) = self.get_status(task_id)? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        if let Some(handle) = self
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(task_id)
        {
            // Aborting drops the worker future; child subprocesses are
            // spawned with kill_on_drop so they die with it.
            handle.abort();
        }
        self.db
            .mark_terminal(task_id, TaskStatus::Cancelled, None, Some("task cancelled"))
            .map_err(GatewayError::Internal)?;
        info!("cancelled task {task_id}");
        Ok(true)
    }

    /// Cancel every non-terminal task (shutdown path).
    pub fn cancel_all(&self) -> Result<usize, GatewayError> {
        let mut count = 0;
        for task in self.active_tasks()? {
            if self.cancel(&task.task_id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete terminal rows whose completion is older than the cutoff.
    pub fn cleanup_before(&self, cutoff: f64) -> Result<usize, GatewayError> {
        let deleted = self
            .db
            .delete_terminal_before(cutoff)
            .map_err(GatewayError::Internal)?;
        if deleted > 0 {
            info!("cleaned up {deleted} old polling tasks");
        }
        Ok(deleted)
    }

    /// Hourly TTL cleanup loop. Runs until the manager is dropped.
    pub fn start_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let cutoff = unix_now() - manager.cleanup_after.as_secs_f64();
                if let Err(e) = manager.cleanup_before(cutoff) {
                    error!("polling cleanup failed: {e}");
                }
            }
        })
    }
}
