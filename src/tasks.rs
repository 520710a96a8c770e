//! Cron-style task scheduling.
//!
//! Each task is a future on a private tokio runtime that sleeps until the
//! next fire time and then runs the callback on the blocking pool. A task
//! never overlaps with itself.

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::fault::catch_fault;

/// Identifier handed out by [`TaskScheduler::register_task`].
pub type TaskId = u64;

/// Number of fields a schedule expression must have:
/// `sec min hour day-of-month month day-of-week`.
pub const CRON_FIELDS: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Task scheduler has been stopped")]
    Stopped,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct TaskEntry {
    owner: Option<String>,
    expression: String,
    handle: JoinHandle<()>,
}

type TaskTable = Arc<Mutex<HashMap<TaskId, TaskEntry>>>;

pub struct TaskScheduler {
    runtime: Mutex<Option<Runtime>>,
    tasks: TaskTable,
    next_id: AtomicU64,
}

impl TaskScheduler {
    /// Start the scheduler's runtime.
    ///
    /// # Errors
    /// Returns an error if the runtime threads cannot be created.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("oasis-scheduler")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Parse a six-field expression.
    ///
    /// # Errors
    /// Returns [`ScheduleError::InvalidExpression`] for a wrong field count
    /// or a field the parser rejects.
    pub fn parse(expression: &str) -> Result<Schedule, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields = expression.split_whitespace().count();
        if fields != CRON_FIELDS {
            return Err(invalid(format!(
                "expected {CRON_FIELDS} fields, found {fields}"
            )));
        }
        Schedule::from_str(expression).map_err(|e| invalid(e.to_string()))
    }

    /// Run `callback` at every time matched by `expression`.
    ///
    /// `owner` is the plugin the task belongs to, `None` for the host.
    ///
    /// # Errors
    /// Returns an error if the expression is invalid or the scheduler has
    /// been stopped.
    pub fn register_task<F>(
        &self,
        owner: Option<&str>,
        expression: &str,
        callback: F,
    ) -> Result<TaskId, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let schedule = Self::parse(expression)?;
        let callback: Callback = Arc::new(callback);

        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(ScheduleError::Stopped)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Held across spawn so the task cannot remove itself before it is
        // recorded.
        let mut tasks = self.tasks.lock();
        let handle = runtime.spawn(run_task(
            id,
            expression.to_string(),
            schedule,
            callback,
            Arc::clone(&self.tasks),
        ));
        tasks.insert(
            id,
            TaskEntry {
                owner: owner.map(str::to_string),
                expression: expression.to_string(),
                handle,
            },
        );

        debug!("Registered task {id} [{expression}] for {}", owner.unwrap_or("host"));
        Ok(id)
    }

    /// Stop a task. Returns `false` if no task has that id.
    ///
    /// A callback already running is allowed to finish.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(entry) => {
                entry.handle.abort();
                debug!("Cancelled task {id} [{}]", entry.expression);
                true
            }
            None => false,
        }
    }

    /// Stop every task owned by `owner`, returning how many were stopped.
    pub fn cancel_owner_tasks(&self, owner: &str) -> usize {
        let mut tasks = self.tasks.lock();
        let ids: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(&id, _)| id)
            .collect();

        for id in &ids {
            if let Some(entry) = tasks.remove(id) {
                entry.handle.abort();
            }
        }
        if !ids.is_empty() {
            debug!("Cancelled {} tasks of plugin {owner}", ids.len());
        }
        ids.len()
    }

    /// Ids of the tasks owned by `owner`, ascending.
    #[must_use]
    pub fn owner_tasks(&self, owner: &str) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Abort every task and refuse new ones.
    pub fn stop(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        for (_, entry) in self.tasks.lock().drain() {
            entry.handle.abort();
        }
        runtime.shutdown_background();
        debug!("Task scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_task(
    id: TaskId,
    expression: String,
    schedule: Schedule,
    callback: Callback,
    tasks: TaskTable,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let callback = Arc::clone(&callback);
        match tokio::task::spawn_blocking(move || catch_fault(|| callback())).await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => error!("Task {id} [{expression}] panicked: {message}"),
            Err(e) => error!("Task {id} [{expression}] failed: {e}"),
        }
    }

    debug!("Task {id} [{expression}] has no further fire times");
    tasks.lock().remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_parse_requires_six_fields() {
        assert!(TaskScheduler::parse("*/5 * * * * *").is_ok());
        assert!(matches!(
            TaskScheduler::parse("* * * * *"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            TaskScheduler::parse("* * * * * * 2030"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            TaskScheduler::parse("61 * * * * *"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_ids_increase_and_cancel() {
        let scheduler = TaskScheduler::new().unwrap();
        let first = scheduler.register_task(None, "0 0 0 1 1 *", || {}).unwrap();
        let second = scheduler
            .register_task(Some("greeter"), "0 0 0 1 1 *", || {})
            .unwrap();

        assert!(second > first);
        assert_eq!(scheduler.task_count(), 2);
        assert!(scheduler.cancel_task(first));
        assert!(!scheduler.cancel_task(first));
        assert_eq!(scheduler.task_count(), 1);
    }

    #[test]
    fn test_cancel_owner_tasks() {
        let scheduler = TaskScheduler::new().unwrap();
        let a = scheduler.register_task(Some("alpha"), "0 0 0 1 1 *", || {}).unwrap();
        let b = scheduler.register_task(Some("alpha"), "0 0 0 1 1 *", || {}).unwrap();
        scheduler.register_task(Some("beta"), "0 0 0 1 1 *", || {}).unwrap();

        assert_eq!(scheduler.owner_tasks("alpha"), vec![a, b]);
        assert_eq!(scheduler.cancel_owner_tasks("alpha"), 2);
        assert!(scheduler.owner_tasks("alpha").is_empty());
        assert_eq!(scheduler.owner_tasks("beta").len(), 1);
        assert_eq!(scheduler.cancel_owner_tasks("ghost"), 0);
    }

    #[test]
    fn test_task_fires_until_cancelled() {
        let scheduler = TaskScheduler::new().unwrap();
        let (count, callback) = counter();
        let id = scheduler.register_task(None, "* * * * * *", callback).unwrap();

        thread::sleep(Duration::from_millis(2500));
        assert!(count.load(Ordering::SeqCst) >= 1);

        scheduler.cancel_task(id);
        thread::sleep(Duration::from_millis(200));
        let settled = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_panicking_task_keeps_firing() {
        let scheduler = TaskScheduler::new().unwrap();
        let (count, bump) = counter();
        scheduler
            .register_task(None, "* * * * * *", move || {
                bump();
                panic!("task failure");
            })
            .unwrap();

        thread::sleep(Duration::from_millis(2500));
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_stop_rejects_new_tasks() {
        let scheduler = TaskScheduler::new().unwrap();
        scheduler.register_task(None, "0 0 0 1 1 *", || {}).unwrap();
        scheduler.stop();
        scheduler.stop();

        assert!(scheduler.is_stopped());
        assert_eq!(scheduler.task_count(), 0);
        assert!(matches!(
            scheduler.register_task(None, "* * * * * *", || {}),
            Err(ScheduleError::Stopped)
        ));
    }
}
