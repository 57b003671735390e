//! Task lifecycle state machine.
//!
//! Transitions are pure: [`transition`] never mutates its input and returns a
//! fresh [`Task`] on success. The successor table in
//! [`TaskStatus::allowed_successors`] is the single source of truth for both
//! transition validity and terminality.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AsapError, AsapResult};

/// Maximum nesting depth for delegated sub-tasks.
pub const MAX_TASK_DEPTH: u32 = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Working,
    InputRequired,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Submitted,
        TaskStatus::Working,
        TaskStatus::InputRequired,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Rejected,
    ];

    pub fn allowed_successors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Submitted => &[TaskStatus::Working, TaskStatus::Rejected],
            TaskStatus::Working => &[
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
                TaskStatus::InputRequired,
                TaskStatus::Paused,
            ],
            TaskStatus::InputRequired => &[TaskStatus::Working, TaskStatus::Cancelled],
            TaskStatus::Paused => &[TaskStatus::Working, TaskStatus::Cancelled],
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::Rejected => &[],
        }
    }

    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        self.allowed_successors().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_successors().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Working => "working",
            TaskStatus::InputRequired => "input_required",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    depth: u32,
}

impl Task {
    /// Create a root task in the `submitted` state.
    pub fn new() -> Self {
        Self::with_id(Uuid::now_v7().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: None,
            status: TaskStatus::Submitted,
            created_at: now,
            updated_at: now,
            depth: 0,
        }
    }

    /// Create a delegated sub-task one level deeper than `self`.
    pub fn spawn_child(&self) -> AsapResult<Task> {
        let depth = self.depth + 1;
        if depth > MAX_TASK_DEPTH {
            return Err(AsapError::DelegationDepthExceeded {
                depth,
                max: MAX_TASK_DEPTH,
            });
        }
        let mut child = Task::new();
        child.parent_id = Some(self.id.clone());
        child.depth = depth;
        Ok(child)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&self, target: TaskStatus) -> AsapResult<Task> {
        transition(self, target)
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// Move `task` to `target`, returning the new value.
pub fn transition(task: &Task, target: TaskStatus) -> AsapResult<Task> {
    if !task.status.can_transition_to(target) {
        return Err(AsapError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status,
            to: target,
        });
    }

    let mut next = task.clone();
    next.status = target;
    // updated_at never goes backwards even if the wall clock does
    next.updated_at = Utc::now().max(task.updated_at);
    Ok(next)
}
