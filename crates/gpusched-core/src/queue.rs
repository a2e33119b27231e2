//! FIFO holding area for jobs awaiting placement
//!
//! Entries are job ids; the scheduler's job table is the owner of the jobs
//! themselves. Duplicate ids are not detected here.

use std::collections::VecDeque;

/// FIFO queue of pending job ids. Insertion at the tail, removal from the head.
#[derive(Debug, Default, Clone)]
pub struct JobQueue {
    jobs: VecDeque<String>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail
    pub fn enqueue(&mut self, job_id: String) {
        self.jobs.push_back(job_id);
    }

    /// Remove the head, or `None` when idle
    pub fn dequeue(&mut self) -> Option<String> {
        self.jobs.pop_front()
    }

    pub fn peek(&self) -> Option<&str> {
        self.jobs.front().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop every entry for `job_id`; returns whether any was present
    pub fn remove(&mut self, job_id: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|id| id != job_id);
        self.jobs.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(String::as_str)
    }
}
