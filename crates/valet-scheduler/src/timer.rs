//! Timer drivers. Both implementations push due task ids into the same
//! channel the engine consumes, so firing semantics are identical from the
//! engine's perspective: never before `due`, at least once per armed task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// One armed timer per durable task. Arming an already-armed id replaces
/// the previous deadline.
pub trait TimerDriver: Send + Sync {
    fn arm(&self, task_id: &str, due: DateTime<Utc>);
    fn cancel(&self, task_id: &str);
    fn shutdown(&self);
}

/// Rich strategy: one spawned tokio sleep per armed task.
pub struct TokioTimerDriver {
    due_tx: UnboundedSender<String>,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TokioTimerDriver {
    pub fn new(due_tx: UnboundedSender<String>) -> Self {
        Self {
            due_tx,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl TimerDriver for TokioTimerDriver {
    fn arm(&self, task_id: &str, due: DateTime<Utc>) {
        let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let id = task_id.to_string();
        let tx = self.due_tx.clone();
        let timers = self.timers.clone();
        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                tokio::time::sleep(wait).await;
                timers.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                let _ = tx.send(id);
            }
        });
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.insert(id, handle) {
            old.abort();
        }
    }

    fn cancel(&self, task_id: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.remove(task_id) {
            handle.abort();
        }
    }

    fn shutdown(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// Minimal fallback strategy: a single loop scanning in-memory deadlines
/// at a fixed interval.
pub struct PollingTimerDriver {
    deadlines: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl PollingTimerDriver {
    pub fn new(due_tx: UnboundedSender<String>, poll_interval: Duration) -> Self {
        let deadlines: Arc<Mutex<HashMap<String, DateTime<Utc>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let scan = deadlines.clone();
        let scanner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let due: Vec<String> = {
                    let mut deadlines = scan.lock().unwrap_or_else(|e| e.into_inner());
                    let ids: Vec<String> = deadlines
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in &ids {
                        deadlines.remove(id);
                    }
                    ids
                };
                for id in due {
                    let _ = due_tx.send(id);
                }
            }
        });
        Self {
            deadlines,
            scanner: Mutex::new(Some(scanner)),
        }
    }
}

impl TimerDriver for PollingTimerDriver {
    fn arm(&self, task_id: &str, due: DateTime<Utc>) {
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), due);
    }

    fn cancel(&self, task_id: &str) {
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    fn shutdown(&self) {
        if let Some(handle) = self
            .scanner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    async fn expect_fire(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timer did not fire")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn tokio_driver_fires_after_due() {
        let (tx, mut rx) = unbounded_channel();
        let driver = TokioTimerDriver::new(tx);
        let armed_at = Utc::now();
        driver.arm("t1", armed_at + chrono::Duration::milliseconds(50));
        assert_eq!(expect_fire(&mut rx).await, "t1");
        assert!(Utc::now() >= armed_at + chrono::Duration::milliseconds(50));
    }

    #[tokio::test]
    async fn tokio_driver_cancel_prevents_fire() {
        let (tx, mut rx) = unbounded_channel();
        let driver = TokioTimerDriver::new(tx);
        driver.arm("t1", Utc::now() + chrono::Duration::milliseconds(50));
        driver.cancel("t1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tokio_driver_rearm_replaces_deadline() {
        let (tx, mut rx) = unbounded_channel();
        let driver = TokioTimerDriver::new(tx);
        driver.arm("t1", Utc::now() + chrono::Duration::seconds(60));
        driver.arm("t1", Utc::now() + chrono::Duration::milliseconds(50));
        assert_eq!(expect_fire(&mut rx).await, "t1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn polling_driver_fires_after_due() {
        let (tx, mut rx) = unbounded_channel();
        let driver = PollingTimerDriver::new(tx, Duration::from_millis(20));
        let armed_at = Utc::now();
        driver.arm("t1", armed_at + chrono::Duration::milliseconds(50));
        assert_eq!(expect_fire(&mut rx).await, "t1");
        assert!(Utc::now() >= armed_at + chrono::Duration::milliseconds(50));
        driver.shutdown();
    }

    #[tokio::test]
    async fn polling_driver_cancel_prevents_fire() {
        let (tx, mut rx) = unbounded_channel();
        let driver = PollingTimerDriver::new(tx, Duration::from_millis(20));
        driver.arm("t1", Utc::now() + chrono::Duration::milliseconds(40));
        driver.cancel("t1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        driver.shutdown();
    }
}
