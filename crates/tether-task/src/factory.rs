//! Registry of live task instances keyed by task id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tether_types::AgentError;

use crate::task::Task;

/// Mapping `task_id -> Task`; the factory exclusively owns live instances.
///
/// Insertion rejects duplicate ids: callers treat the rejection as "already
/// dispatched" and drop the new instance.
#[derive(Default)]
pub struct TaskFactory {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Fails with [`AgentError::TaskExists`] if the id is
    /// already present.
    pub fn add_task(&self, task: Arc<Task>) -> Result<(), AgentError> {
        let mut tasks = self.tasks.lock().expect("task map lock poisoned");
        let id = task.info().task_id.clone();
        if tasks.contains_key(&id) {
            return Err(AgentError::TaskExists(id));
        }
        tasks.insert(id, task);
        Ok(())
    }

    /// Remove a task by id, returning it if present.
    pub fn remove_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .remove(task_id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
