//! FIFO of jobs waiting for a worker.

use std::collections::VecDeque;

use super::job::Job;

/// Arrival-ordered queue that never hands out a job whose session is
/// already running.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Remove and return the oldest job whose session is not busy.
    pub fn take_next_eligible<F>(&mut self, session_busy: F) -> Option<Job>
    where
        F: Fn(&str) -> bool,
    {
        let index = self
            .jobs
            .iter()
            .position(|job| !session_busy(job.session_id()))?;
        self.jobs.remove(index)
    }

    /// Remove every queued job for a session, oldest first.
    pub fn remove_session(&mut self, session_id: &str) -> Vec<Job> {
        let (removed, kept): (Vec<Job>, Vec<Job>) = self
            .jobs
            .drain(..)
            .partition(|job| job.session_id() == session_id);
        self.jobs = kept.into();
        removed
    }

    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
