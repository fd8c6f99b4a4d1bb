//! Bounded priority queue for pending tasks.
//!
//! Ordered by `(priority, submission sequence)`: lower priority values first,
//! FIFO among equal priorities. Retried tasks get a fresh sequence number, so
//! a retry queues behind work already waiting at its priority.

use crate::execution::{AsyncTask, TaskId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct QueuedTask {
    priority: i32,
    sequence: u64,
    task: AsyncTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap; reverse so the smallest (priority, sequence) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    capacity: usize,
    next_sequence: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
            capacity,
            next_sequence: 0,
        }
    }

    /// Enqueue a task, handing it back if the queue is full
    pub fn push(&mut self, task: AsyncTask) -> Result<(), AsyncTask> {
        if self.is_full() {
            return Err(task);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTask {
            priority: task.priority,
            sequence,
            task,
        });
        Ok(())
    }

    /// Most urgent task, oldest first within a priority
    pub fn pop(&mut self) -> Option<AsyncTask> {
        self.heap.pop().map(|queued| queued.task)
    }

    pub fn peek_priority(&self) -> Option<i32> {
        self.heap.peek().map(|queued| queued.priority)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.heap.iter().any(|queued| queued.task.id == id)
    }

    /// Remove every task, in dequeue order
    pub fn drain_ordered(&mut self) -> Vec<AsyncTask> {
        let mut tasks = Vec::with_capacity(self.heap.len());
        while let Some(task) = self.pop() {
            tasks.push(task);
        }
        tasks
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.heap.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
