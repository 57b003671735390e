//! In-memory task registry backing the default handlers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use asap_core::errors::{AsapError, AsapResult};
use asap_core::task::{Task, TaskStatus};

#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub task: Task,
    pub webhook_url: Option<String>,
    pub messages: Vec<Value>,
}

#[derive(Default)]
pub struct TaskStore {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, task: Task, webhook_url: Option<String>) -> TaskRecord {
        let record = TaskRecord {
            task,
            webhook_url,
            messages: Vec::new(),
        };
        self.lock()
            .insert(record.task.id().to_string(), record.clone());
        record
    }

    pub fn get(&self, task_id: &str) -> AsapResult<TaskRecord> {
        self.lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| AsapError::TaskNotFound(task_id.to_string()))
    }

    /// Apply a transition under the lock so concurrent updates serialize.
    pub fn transition(&self, task_id: &str, target: TaskStatus) -> AsapResult<TaskRecord> {
        let mut records = self.lock();
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| AsapError::TaskNotFound(task_id.to_string()))?;
        record.task = record.task.transition(target)?;
        Ok(record.clone())
    }

    pub fn push_message(&self, task_id: &str, message: Value) -> AsapResult<usize> {
        let mut records = self.lock();
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| AsapError::TaskNotFound(task_id.to_string()))?;
        if record.task.is_terminal() {
            return Err(AsapError::InvalidPayload(format!(
                "task {task_id} is {} and accepts no messages",
                record.task.status()
            )));
        }
        record.messages.push(message);
        Ok(record.messages.len())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transitions_are_persisted() {
        let store = TaskStore::new();
        let record = store.insert(Task::new(), None);
        let id = record.task.id().to_string();

        store.transition(&id, TaskStatus::Working).unwrap();
        assert_eq!(store.get(&id).unwrap().task.status(), TaskStatus::Working);

        let err = store.transition(&id, TaskStatus::Rejected).unwrap_err();
        assert!(matches!(err, AsapError::InvalidTransition { .. }));
        assert_eq!(store.get(&id).unwrap().task.status(), TaskStatus::Working);
    }

    #[test]
    fn unknown_task() {
        let store = TaskStore::new();
        assert!(matches!(
            store.transition("missing", TaskStatus::Working),
            Err(AsapError::TaskNotFound(_))
        ));
    }

    #[test]
    fn terminal_tasks_refuse_messages() {
        let store = TaskStore::new();
        let id = store.insert(Task::new(), None).task.id().to_string();
        store.transition(&id, TaskStatus::Working).unwrap();
        assert_eq!(store.push_message(&id, json!("hi")).unwrap(), 1);
        store.transition(&id, TaskStatus::Completed).unwrap();
        assert!(store.push_message(&id, json!("late")).is_err());
    }
}
