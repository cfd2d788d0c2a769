//! Bounded-concurrency queue of running scripts.
//!
//! Jobs beyond the running limit wait auto-paused; whenever a job ends or
//! is paused the oldest waiting job is resumed. A job paused by hand stays
//! paused until it is resumed by hand.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::control::JobControl;

/// Identifier the caller chooses for a queued job.
pub type JobId = u64;

/// Scheduling state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Waiting for a free slot.
    AutoPaused,
    /// Paused by the operator.
    ManuallyPaused,
}

#[derive(Debug)]
struct Entry {
    id: JobId,
    control: JobControl,
    state: JobState,
}

/// Queue of jobs sharing a running limit.
#[derive(Debug)]
pub struct JobQueue {
    max_running: usize,
    entries: Mutex<Vec<Entry>>,
}

impl JobQueue {
    /// Create a queue running at most `max_running` jobs at once.
    pub fn new(max_running: usize) -> Self {
        Self {
            max_running: max_running.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running(entries: &[Entry]) -> usize {
        entries
            .iter()
            .filter(|e| e.state == JobState::Running)
            .count()
    }

    /// Resume waiting jobs, oldest first, while slots are free.
    fn fill_slots(&self, entries: &mut [Entry]) {
        let mut running = Self::running(entries);
        for entry in entries.iter_mut() {
            if running >= self.max_running {
                break;
            }
            if entry.state == JobState::AutoPaused {
                debug!(job = entry.id, "resuming queued job");
                entry.state = JobState::Running;
                entry.control.resume();
                running += 1;
            }
        }
    }

    /// Add a job. With `start_on_idle` it waits while the queue is full.
    ///
    /// Returns whether the job starts paused; its control is paused already.
    pub fn add(&self, id: JobId, control: JobControl, start_on_idle: bool) -> bool {
        let mut entries = self.lock();
        let paused = start_on_idle && Self::running(&entries) >= self.max_running;
        if paused {
            control.pause();
        }
        entries.push(Entry {
            id,
            control,
            state: if paused {
                JobState::AutoPaused
            } else {
                JobState::Running
            },
        });
        debug!(job = id, paused, "job queued");
        paused
    }

    /// Remove a finished job and, unless `do_not_resume`, let the next one run.
    pub fn operation_ended(&self, id: JobId, do_not_resume: bool) {
        let mut entries = self.lock();
        entries.retain(|e| e.id != id);
        if !do_not_resume {
            self.fill_slots(&mut entries);
        }
    }

    /// Pause or resume a job by hand.
    pub fn set_paused(&self, id: JobId, paused: bool) {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        if paused {
            entry.state = JobState::ManuallyPaused;
            entry.control.pause();
            self.fill_slots(&mut entries);
        } else {
            entry.state = JobState::Running;
            entry.control.resume();
        }
    }

    /// Send a running job to the back of the queue to wait for a slot.
    pub fn auto_pause(&self, id: JobId) {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return;
        };
        let mut entry = entries.remove(pos);
        entry.state = JobState::AutoPaused;
        entry.control.pause();
        entries.push(entry);
        self.fill_slots(&mut entries);
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().iter().find(|e| e.id == id).map(|e| e.state)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(1)
    }
}
