//! Operator-intent task records (spec §3, §6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intent kind the task/worker contract accepts (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    VmStart,
    VmStop,
    VmShutdown,
    VmRestart,
    VmMigrate,
    VmUnmigrate,
    VmMove,
    VmDefine,
    VmUndefine,
    VmRecover,
    NodeFlush,
    NodeReady,
    NodePrimary,
    NodeSecondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Partial,
}

/// Transient record of an operator-initiated long-running action (spec §3, §7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub target: String,
    pub status: TaskStatus,
    /// 0-100.
    pub progress: u8,
    pub reason: Option<String>,
    pub owning_worker: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind, target: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            target: target.into(),
            status: TaskStatus::Pending,
            progress: 0,
            reason: None,
            owning_worker: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failure;
        self.reason = Some(reason.into());
    }

    pub fn succeed(&mut self) {
        self.status = TaskStatus::Success;
        self.progress = 100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_sets_status_and_reason() {
        let mut task = Task::new(TaskId::new(uuid::Uuid::nil()), TaskKind::VmStart, "x");
        task.fail("no_target");
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.reason.as_deref(), Some("no_target"));
    }

    #[test]
    fn succeed_sets_progress_to_100() {
        let mut task = Task::new(TaskId::new(uuid::Uuid::nil()), TaskKind::VmStart, "x");
        task.succeed();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 100);
    }
}
