use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use lumen_core::types::QueryResult;
use lumen_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

struct Task {
    status: TaskStatus,
    outcome: Option<Result<QueryResult>>,
    finished_at: Option<Instant>,
}

/// Background queries started with `submit`. Finished outcomes nobody takes
/// are dropped once `retention` has passed.
pub(crate) struct TaskTable {
    tasks: Mutex<HashMap<Uuid, Task>>,
    retention: Duration,
}

fn prune(tasks: &mut HashMap<Uuid, Task>, retention: Duration) {
    let now = Instant::now();
    let before = tasks.len();
    tasks.retain(|_, t| t.finished_at.map_or(true, |at| now.duration_since(at) < retention));
    if tasks.len() < before {
        debug!(expired = before - tasks.len(), "dropped uncollected task outcomes");
    }
}

impl TaskTable {
    pub(crate) fn new(retention: Duration) -> Self {
        Self { tasks: Mutex::new(HashMap::new()), retention }
    }

    pub(crate) fn insert(&self, id: Uuid) {
        let mut tasks = self.tasks.lock();
        prune(&mut tasks, self.retention);
        tasks.insert(id, Task { status: TaskStatus::Pending, outcome: None, finished_at: None });
    }

    pub(crate) fn mark_running(&self, id: &Uuid) {
        if let Some(t) = self.tasks.lock().get_mut(id) {
            t.status = TaskStatus::Running;
        }
    }

    pub(crate) fn finish(&self, id: &Uuid, outcome: Result<QueryResult>) {
        let status = match &outcome {
            Ok(_) => TaskStatus::Done,
            Err(Error::Cancelled) => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        if let Some(t) = self.tasks.lock().get_mut(id) {
            t.status = status;
            t.outcome = Some(outcome);
            t.finished_at = Some(Instant::now());
        }
    }

    pub(crate) fn status(&self, id: &Uuid) -> Option<TaskStatus> {
        let mut tasks = self.tasks.lock();
        prune(&mut tasks, self.retention);
        tasks.get(id).map(|t| t.status)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Removes a finished task and hands back its outcome.
    pub(crate) fn take(&self, id: &Uuid) -> Option<Result<QueryResult>> {
        let mut tasks = self.tasks.lock();
        prune(&mut tasks, self.retention);
        if !tasks.get(id)?.status.is_finished() {
            return None;
        }
        tasks.remove(id).and_then(|t| t.outcome)
    }
}
