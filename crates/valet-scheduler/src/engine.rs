//! Scheduler engine: owns the timer driver, recovers persisted tasks on
//! startup, and fires each due task on its own spawned unit of work so a
//! slow handler never delays the rest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use valet_core::config::{SchedulerConfig, TimerStrategy};
use valet_core::{HandlerRegistry, Result, Task, TaskScheduler, ValetError};
use valet_notify::NotificationPipeline;
use valet_store::TaskStore;

use crate::dispatch;
use crate::timer::{PollingTimerDriver, TimerDriver, TokioTimerDriver};

pub struct SchedulerEngine {
    store: TaskStore,
    registry: Arc<HandlerRegistry>,
    pipeline: Arc<NotificationPipeline>,
    driver: Arc<dyn TimerDriver>,
    config: SchedulerConfig,
    due_rx: Mutex<Option<UnboundedReceiver<String>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(
        store: TaskStore,
        registry: Arc<HandlerRegistry>,
        pipeline: Arc<NotificationPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        let (due_tx, due_rx) = unbounded_channel();
        let driver: Arc<dyn TimerDriver> = match config.strategy {
            TimerStrategy::Tokio => Arc::new(TokioTimerDriver::new(due_tx)),
            TimerStrategy::Polling => Arc::new(PollingTimerDriver::new(
                due_tx,
                Duration::from_millis(config.poll_interval_ms.max(1)),
            )),
        };
        Self {
            store,
            registry,
            pipeline,
            driver,
            config,
            due_rx: Mutex::new(Some(due_rx)),
            run_handle: Mutex::new(None),
        }
    }

    /// Recover persisted tasks and start consuming timer firings.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let recovered = self.recover()?;
        tracing::info!(
            "⏰ Scheduler started ({:?} strategy, {recovered} task(s) recovered)",
            self.config.strategy
        );

        let mut due_rx = self
            .due_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ValetError::Config("scheduler already started".into()))?;

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(task_id) = due_rx.recv().await {
                let engine = engine.clone();
                tokio::spawn(async move { engine.fire(&task_id).await });
            }
        });
        *self.run_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Rebuild timers from the store. Stale one-shot tasks past the grace
    /// window are discarded; ones overdue within the window are re-armed a
    /// few seconds out instead of instantly, so a restart doesn't fire
    /// everything at once.
    fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let grace = chrono::Duration::seconds(self.config.grace_window_secs as i64);
        let rearm_at = now + chrono::Duration::seconds(self.config.rearm_delay_secs as i64);

        let mut recovered = 0;
        for task in self.store.list_all()? {
            if task.recurring || task.execute_at >= now {
                self.driver.arm(&task.id, task.execute_at);
                recovered += 1;
            } else if now - task.execute_at > grace {
                tracing::warn!(
                    "🗑️ Discarding stale one-shot task {} (due {}, past grace window)",
                    task.id,
                    task.execute_at
                );
                self.store.remove(&task.id)?;
            } else {
                self.store.update_execute_at(&task.id, rearm_at)?;
                self.driver.arm(&task.id, rearm_at);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Fire one due task: dispatch it, then settle its durable record.
    /// Every failure path is logged, never propagated; one bad task must
    /// not take down the loop.
    async fn fire(self: &Arc<Self>, task_id: &str) {
        let task = match self.store.get(task_id) {
            Ok(task) => task,
            Err(e) if e.is_not_found() => return, // cancelled before firing
            Err(e) => {
                tracing::error!("❌ Failed to load task {task_id}: {e}");
                return;
            }
        };

        if let Err(e) = self.store.touch_executed(&task.id, Utc::now()) {
            tracing::warn!("⚠️ Could not record execution of {}: {e}", task.id);
        }

        dispatch::execute(&task, &self.registry, &self.pipeline, self.clone()).await;

        // A cancel that raced the execution wins: no rearm, no resurrect.
        match self.store.get(&task.id) {
            Err(e) if e.is_not_found() => {
                self.driver.cancel(&task.id);
                return;
            }
            Err(e) => {
                tracing::error!("❌ Failed to re-check task {}: {e}", task.id);
                return;
            }
            Ok(_) => {}
        }

        if task.recurring {
            let next = next_occurrence(&task, Utc::now());
            match self.store.update_execute_at(&task.id, next) {
                Ok(()) => self.driver.arm(&task.id, next),
                Err(e) if e.is_not_found() => self.driver.cancel(&task.id),
                Err(e) => tracing::error!("❌ Failed to re-arm task {}: {e}", task.id),
            }
        } else {
            // Fire-once semantics: removed whether the handler succeeded
            // or not.
            if let Err(e) = self.store.remove(&task.id) {
                tracing::error!("❌ Failed to remove finished task {}: {e}", task.id);
            }
            self.driver.cancel(&task.id);
        }
    }

    pub fn list_all(&self) -> Result<Vec<Task>> {
        self.store.list_all()
    }

    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Task>> {
        self.store.list_for_user(user_id)
    }

    /// Stop timers and the firing loop. In-flight executions are left to
    /// finish on the runtime; the store is already consistent.
    pub fn shutdown(&self) {
        self.driver.shutdown();
        if let Some(handle) = self
            .run_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        tracing::info!("⏹️ Scheduler stopped");
    }
}

#[async_trait]
impl TaskScheduler for SchedulerEngine {
    async fn schedule(&self, mut task: Task) -> Result<()> {
        if task.recurring && task.interval.unwrap_or(0) == 0 {
            return Err(ValetError::Config(format!(
                "recurring task {} needs a positive interval",
                task.id
            )));
        }
        // interval is set iff recurring; stray values on one-shots are
        // dropped rather than stored
        if !task.recurring {
            task.interval = None;
        }
        self.store.insert(&task)?;
        self.driver.arm(&task.id, task.execute_at);
        tracing::info!(
            "📅 Task scheduled: {} ({}/{}) at {}",
            task.id,
            task.bot_id,
            task.task_type,
            task.execute_at
        );
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        self.driver.cancel(task_id);
        let removed = self.store.remove(task_id)?;
        if removed {
            tracing::info!("🚫 Task cancelled: {task_id}");
        }
        Ok(removed)
    }
}

/// Advance a recurring task's deadline by whole intervals until it is
/// strictly in the future. Never moves backward.
fn next_occurrence(task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
    let step = chrono::Duration::seconds(task.interval.unwrap_or(1).max(1) as i64);
    let mut next = task.execute_at + step;
    while next <= now {
        next += step;
    }
    next
}
