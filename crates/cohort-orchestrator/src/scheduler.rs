use crate::types::{Task, TaskPriority, TaskStatus, TaskType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Aggregate task counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub history_len: usize,
    /// Pending and active tasks by type.
    pub by_type: HashMap<TaskType, usize>,
    /// Pending and active tasks by priority.
    pub by_priority: HashMap<TaskPriority, usize>,
}

/// Task backlog with a dependency graph.
///
/// Tasks live in exactly one of three places: `pending` until assigned,
/// `active` while agents work on them, and the bounded `history` once they
/// reach a terminal status. A pending task is ready when none of its
/// dependencies is still pending or active. Ids that were never added count
/// as resolved.
pub struct Scheduler {
    pending: HashMap<String, Task>,
    active: HashMap<String, Task>,
    history: VecDeque<Task>,
    history_capacity: usize,
    /// Recorded edges: task id -> ids it depends on that were known at add time.
    edges: HashMap<String, HashSet<String>>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl Scheduler {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
            history: VecDeque::with_capacity(history_capacity.min(1024)),
            history_capacity: history_capacity.max(1),
            edges: HashMap::new(),
            completed: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Add a task to the backlog. A task with an existing id replaces it.
    pub fn add(&mut self, mut task: Task) -> String {
        let id = task.id.clone();
        task.status = TaskStatus::Pending;
        task.assigned_agents.clear();

        let mut known = HashSet::new();
        for dep in &task.dependencies {
            if self.is_tracked(dep) {
                known.insert(dep.clone());
            } else {
                debug!(task_id = %id, dependency = %dep, "Unknown dependency treated as resolved");
            }
        }
        self.edges.insert(id.clone(), known);

        if self.active.remove(&id).is_some() {
            warn!(task_id = %id, "Re-added task was active; replacing");
        }
        self.pending.insert(id.clone(), task);
        id
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.active.contains_key(id)
    }

    /// Pending tasks whose dependencies are all resolved, most urgent first,
    /// then oldest first.
    pub fn ready(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .pending
            .values()
            .filter(|t| t.dependencies.iter().all(|dep| !self.is_tracked(dep)))
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready
    }

    /// Move a pending task to active and record its agents.
    pub fn assign(&mut self, task_id: &str, agent_ids: &[String]) -> bool {
        let Some(mut task) = self.pending.remove(task_id) else {
            warn!(task_id = %task_id, "Cannot assign unknown or non-pending task");
            return false;
        };
        task.status = TaskStatus::Assigned;
        task.started_at = Some(Utc::now());
        task.assigned_agents = agent_ids.to_vec();
        info!(task_id = %task_id, agents = ?agent_ids, "Task assigned");
        self.active.insert(task_id.to_string(), task);
        true
    }

    /// Record progress for an active task, optionally changing its status.
    ///
    /// Progress is clamped to `[0, 100]`. A terminal status moves the task to
    /// history. Returns a snapshot of the task after the update, or `None`
    /// when the id is not active.
    pub fn update_progress(
        &mut self,
        task_id: &str,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> Option<Task> {
        let Some(task) = self.active.get_mut(task_id) else {
            warn!(task_id = %task_id, "Progress update for task that is not active");
            return None;
        };

        task.progress = if progress.is_nan() {
            task.progress
        } else {
            progress.clamp(0.0, 100.0)
        };

        match status {
            Some(TaskStatus::Pending) => {
                warn!(task_id = %task_id, "Ignoring transition of active task back to pending");
            }
            Some(TaskStatus::Assigned) if task.status != TaskStatus::Assigned => {
                warn!(
                    task_id = %task_id,
                    status = ?task.status,
                    "Ignoring transition of started task back to assigned"
                );
            }
            Some(next) => task.status = next,
            None => {
                if task.status == TaskStatus::Assigned && task.progress > 0.0 {
                    task.status = TaskStatus::InProgress;
                }
            }
        }

        if task.status.is_terminal() {
            let task = self.active.remove(task_id)?;
            return Some(self.finish(task));
        }
        Some(task.clone())
    }

    /// Mark an active task failed with a reason.
    pub fn fail(&mut self, task_id: &str, reason: &str) -> Option<Task> {
        let Some(mut task) = self.active.remove(task_id) else {
            warn!(task_id = %task_id, "Cannot fail task that is not active");
            return None;
        };
        task.status = TaskStatus::Failed;
        task.failure_reason = Some(reason.to_string());
        Some(self.finish(task))
    }

    /// Cancel a pending or active task.
    pub fn cancel(&mut self, task_id: &str, reason: &str) -> Option<Task> {
        let mut task = match self.pending.remove(task_id) {
            Some(task) => task,
            None => match self.active.remove(task_id) {
                Some(task) => task,
                None => {
                    warn!(task_id = %task_id, "Cannot cancel unknown task");
                    return None;
                }
            },
        };
        task.status = TaskStatus::Cancelled;
        task.failure_reason = Some(reason.to_string());
        Some(self.finish(task))
    }

    /// Stamp a terminal task, count it, and push it into history.
    fn finish(&mut self, mut task: Task) -> Task {
        task.completed_at = Some(Utc::now());
        match task.status {
            TaskStatus::Completed => {
                task.progress = 100.0;
                self.completed += 1;
            }
            TaskStatus::Failed => self.failed += 1,
            _ => self.cancelled += 1,
        }
        self.edges.remove(&task.id);
        info!(
            task_id = %task.id,
            status = ?task.status,
            reason = task.failure_reason.as_deref().unwrap_or(""),
            "Task finished"
        );

        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(task.clone());
        task
    }

    /// Look a task up in pending, active, then history.
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.pending
            .get(task_id)
            .or_else(|| self.active.get(task_id))
            .or_else(|| self.history.iter().rev().find(|t| t.id == task_id))
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Task> {
        self.pending.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.active.values()
    }

    /// Finished tasks, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Task> {
        self.history.iter()
    }

    /// Ids of tracked tasks that recorded a dependency on `task_id`.
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .edges
            .iter()
            .filter(|(_, deps)| deps.contains(task_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Check the recorded dependency edges for a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.edges
            .keys()
            .any(|id| self.dfs_cycle(id, &mut visited))
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // done
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(deps) = self.edges.get(id) {
            for dep in deps {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut by_type = HashMap::new();
        let mut by_priority = HashMap::new();
        for task in self.pending.values().chain(self.active.values()) {
            *by_type.entry(task.task_type).or_insert(0) += 1;
            *by_priority.entry(task.priority).or_insert(0) += 1;
        }
        SchedulerStats {
            pending: self.pending.len(),
            active: self.active.len(),
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            history_len: self.history.len(),
            by_type,
            by_priority,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(1000)
    }
}
