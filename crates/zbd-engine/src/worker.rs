//! Single-consumer background job queue.
//!
//! One worker thread drains a FIFO of boxed jobs. Jobs are uncancellable;
//! on destruction the queue is terminated, the thread joined, and any jobs
//! still queued are run synchronously so their bookkeeping side effects
//! (counter decrements, flag clears) always happen.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::debug;
use zbd_error::{Result, ZbdError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Waiting,
    Running,
    Terminated,
}

struct WorkerQueue {
    jobs: VecDeque<Job>,
    state: WorkerState,
}

struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    cv: Condvar,
}

impl WorkerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background worker owning one thread and a FIFO job queue.
pub struct BackgroundWorker {
    name: &'static str,
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BackgroundWorker {
    pub fn new(name: &'static str) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(WorkerQueue {
                jobs: VecDeque::new(),
                state: WorkerState::Running,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || process_jobs(&thread_shared))
            .map_err(ZbdError::Io)?;

        Ok(Self {
            name,
            shared,
            join: Some(join),
        })
    }

    /// Append a job and wake the worker.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            queue.jobs.push_back(Box::new(job));
        }
        self.shared.cv.notify_one();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.state = WorkerState::Terminated;
        }
        self.shared.cv.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }

        // Run whatever the worker never got to, so queued bookkeeping
        // still takes effect.
        let remaining = std::mem::take(&mut self.shared.lock().jobs);
        if !remaining.is_empty() {
            debug!(
                target: "zbdfs::worker",
                event = "drain_on_shutdown",
                worker = self.name,
                jobs = remaining.len()
            );
        }
        for job in remaining {
            job();
        }
    }
}

fn process_jobs(shared: &WorkerShared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if queue.state == WorkerState::Terminated {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    queue.state = WorkerState::Running;
                    break job;
                }
                queue.state = WorkerState::Waiting;
                queue = shared
                    .cv
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        job();
    }
}
