use crate::types::{Task, TaskStatus};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Active (non-terminal) tasks with priority-then-age ordering.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    next_sequence: u64,
}

/// Scheduling order: priority descending, then creation time ascending,
/// then submission order.
pub fn schedule_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.metadata.created_at.cmp(&b.metadata.created_at))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, stamping its submission order. Returns `false` if a task
    /// with the same id is already active.
    pub fn add(&mut self, mut task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tasks.insert(task.id, task);
        true
    }

    /// Ids of pending tasks in scheduling order.
    pub fn pending_in_order(&self) -> Vec<Uuid> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| schedule_order(a, b));
        pending.into_iter().map(|t| t.id).collect()
    }

    /// Get a task by ID.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Get a mutable reference to a task.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Remove a task, typically because it reached a terminal state.
    pub fn remove(&mut self, id: Uuid) -> Option<Task> {
        self.tasks.remove(&id)
    }

    /// Tasks currently held by `worker`.
    pub fn held_by(&self, worker: Uuid) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.assigned_worker == Some(worker))
            .map(|t| t.id)
            .collect()
    }

    /// Count of tasks in one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Total number of active tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is active.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All active tasks in scheduling order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| schedule_order(a, b));
        tasks
    }
}

/// Terminal tasks, bounded with oldest-first eviction.
#[derive(Debug)]
pub struct TaskArchive {
    tasks: HashMap<Uuid, Task>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl TaskArchive {
    /// Creates an archive holding at most `capacity` tasks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Archives a task, evicting the oldest entry when full.
    pub fn push(&mut self, task: Task) {
        if self.tasks.insert(task.id, task.clone()).is_none() {
            self.order.push_back(task.id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.tasks.remove(&evicted);
            }
        }
    }

    /// Get an archived task.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Returns `true` if the id is archived.
    pub fn contains(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Number of archived tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if nothing is archived.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Count of archived tasks in one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn task(priority: u8, age_secs: i64) -> Task {
        let mut t = Task::new("t", serde_json::Value::Null).with_priority(priority);
        t.metadata.created_at = Utc::now() - Duration::seconds(age_secs);
        t
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert!(queue.pending_in_order().is_empty());
    }

    #[test]
    fn test_priority_then_age_order() {
        let mut queue = TaskQueue::new();
        let low_old = task(1, 100);
        let high_new = task(5, 1);
        let high_old = task(5, 50);
        let (a, b, c) = (low_old.id, high_new.id, high_old.id);
        queue.add(low_old);
        queue.add(high_new);
        queue.add(high_old);

        assert_eq!(queue.pending_in_order(), vec![c, b, a]);
    }

    #[test]
    fn test_equal_timestamps_fall_back_to_submission_order() {
        let mut queue = TaskQueue::new();
        let now = Utc::now();
        let mut first = task(3, 0);
        let mut second = task(3, 0);
        first.metadata.created_at = now;
        second.metadata.created_at = now;
        let (f, s) = (first.id, second.id);
        queue.add(first);
        queue.add(second);
        assert_eq!(queue.pending_in_order(), vec![f, s]);
    }

    #[test]
    fn test_only_pending_are_ordered() {
        let mut queue = TaskQueue::new();
        let t = task(5, 0);
        let id = t.id;
        queue.add(t);
        queue.get_mut(id).unwrap().set_status(TaskStatus::Assigned);
        assert!(queue.pending_in_order().is_empty());
        assert_eq!(queue.count(TaskStatus::Assigned), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut queue = TaskQueue::new();
        let t = task(5, 0);
        assert!(queue.add(t.clone()));
        assert!(!queue.add(t));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_held_by_worker() {
        let mut queue = TaskQueue::new();
        let worker = Uuid::new_v4();
        let mut t = task(5, 0);
        t.assigned_worker = Some(worker);
        let id = t.id;
        queue.add(t);
        queue.add(task(5, 0));
        assert_eq!(queue.held_by(worker), vec![id]);
    }

    #[test]
    fn test_archive_evicts_oldest() {
        let mut archive = TaskArchive::new(2);
        let a = task(1, 0);
        let b = task(1, 0);
        let c = task(1, 0);
        let (ida, idb, idc) = (a.id, b.id, c.id);
        archive.push(a);
        archive.push(b);
        archive.push(c);
        assert_eq!(archive.len(), 2);
        assert!(!archive.contains(ida));
        assert!(archive.contains(idb));
        assert!(archive.get(idc).is_some());
    }
}
