// Periodic sweeps: task timeouts and lock expiry run on independent intervals

use crate::config::OrchestratorConfig;
use crate::conflicts::ConflictManager;
use crate::queue::TaskQueue;
use crate::shutdown::ShutdownState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub timeout_interval: Duration,
    pub lock_interval: Duration,
}

impl SweepConfig {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            timeout_interval: Duration::from_secs(config.queue.timeout_sweep_interval_secs.max(1)),
            lock_interval: Duration::from_secs(config.conflicts.lock_sweep_interval_secs.max(1)),
        }
    }
}

/// Handles of the two sweep loops
pub struct Sweeper {
    handles: Vec<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(
        queue: Arc<TaskQueue>,
        conflicts: Arc<ConflictManager>,
        config: SweepConfig,
        shutdown: ShutdownState,
    ) -> Self {
        let timeout_loop = spawn_loop("timeouts", config.timeout_interval, shutdown.clone(), move || {
            let timed_out = queue.sweep_timeouts(Utc::now());
            if !timed_out.is_empty() {
                log::info!("[Sweeper] {} task(s) timed out", timed_out.len());
            }
        });
        let lock_loop = spawn_loop("locks", config.lock_interval, shutdown, move || {
            let expired = conflicts.sweep_expired_locks(Utc::now());
            if !expired.is_empty() {
                log::info!("[Sweeper] {} lock(s) expired", expired.len());
            }
        });

        log::info!(
            "[Sweeper] Started (timeouts every {}s, locks every {}s)",
            config.timeout_interval.as_secs(),
            config.lock_interval.as_secs()
        );
        Self {
            handles: vec![timeout_loop, lock_loop],
        }
    }

    /// Wait for both loops to observe shutdown
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::warn!("[Sweeper] Sweep loop ended abnormally: {}", e);
            }
        }
    }
}

fn spawn_loop<F>(name: &'static str, period: Duration, shutdown: ShutdownState, mut sweep: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => sweep(),
            }
        }
        log::debug!("[Sweeper] {} loop stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictConfig, QueueConfig};
    use crate::conflicts::LockType;
    use crate::events::NullEventSink;
    use crate::models::{NewTask, TaskStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeps_run_until_shutdown() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(TaskQueue::new(
            QueueConfig {
                task_timeout_secs: 0,
                default_max_retries: 0,
                ..Default::default()
            },
            Arc::new(NullEventSink),
        ));
        let conflicts = Arc::new(ConflictManager::new(
            tmp.path(),
            ConflictConfig::default(),
            Arc::new(NullEventSink),
        ));

        let receipt = queue.enqueue(NewTask::new("s1", "a", "work")).unwrap();
        queue.dequeue_next(None).unwrap();
        conflicts
            .acquire_lock("s1", "a", "f.txt", LockType::Exclusive, Some(Duration::from_millis(1)))
            .unwrap();

        let shutdown = ShutdownState::new();
        let sweeper = Sweeper::spawn(
            Arc::clone(&queue),
            Arc::clone(&conflicts),
            SweepConfig {
                timeout_interval: Duration::from_millis(20),
                lock_interval: Duration::from_millis(20),
            },
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(2), sweeper.join())
            .await
            .unwrap();

        assert_eq!(queue.get_task(&receipt.task_id).unwrap().status, TaskStatus::Failed);
        assert!(conflicts.active_locks("f.txt").unwrap().is_empty());
    }
}
