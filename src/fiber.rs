//! Cooperative task queue drained by the worker pool.
//!
//! Each BFS level brackets the queue with `begin_processing` /
//! `end_processing`. Edge-extraction jobs enter at [`PRIORITY_EXTRACT`],
//! receive-completion jobs at [`PRIORITY_RECV`]; workers always prefer the
//! higher priority so receivers never starve behind extraction. Producers
//! under back-pressure call [`FiberScheduler::process_one`] with
//! `PRIORITY_RECV` to drain receive work while they wait.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Priority of edge-extraction jobs.
pub const PRIORITY_EXTRACT: usize = 0;
/// Priority of receive-completion jobs.
pub const PRIORITY_RECV: usize = 1;
const NUM_PRIORITIES: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queues: [VecDeque<Job>; NUM_PRIORITIES],
    done: bool,
}

/// The per-rank task queue.
pub struct FiberScheduler {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberScheduler {
    /// Creates an idle scheduler.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: [VecDeque::new(), VecDeque::new()],
                done: true,
            }),
            cv: Condvar::new(),
        }
    }

    /// Opens a processing bracket. Queues must be empty.
    pub fn begin_processing(&self) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(st.queues.iter().all(VecDeque::is_empty));
        st.done = false;
    }

    /// Closes the bracket: workers drain what remains and return.
    pub fn end_processing(&self) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.done = true;
        self.cv.notify_all();
    }

    /// Enqueues one job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static, priority: usize) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.queues[priority].push_back(Box::new(job));
        self.cv.notify_all();
    }

    /// Enqueues a batch of jobs at one priority.
    pub fn submit_all(&self, jobs: Vec<Job>, priority: usize) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.queues[priority].extend(jobs);
        self.cv.notify_all();
    }

    fn pop(&self, min_priority: usize) -> Option<Job> {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for p in (min_priority..NUM_PRIORITIES).rev() {
            if let Some(job) = st.queues[p].pop_front() {
                return Some(job);
            }
        }
        None
    }

    /// Runs one pending job of priority >= `min_priority`, if any.
    /// Returns whether a job ran.
    pub fn process_one(&self, min_priority: usize) -> bool {
        match self.pop(min_priority) {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Worker loop: runs jobs (receive work first) until the bracket is
    /// closed and the queues are drained.
    pub fn worker_loop(&self) {
        loop {
            if let Some(job) = self.pop(0) {
                job();
                continue;
            }
            let st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if st.done && st.queues.iter().all(VecDeque::is_empty) {
                return;
            }
            // Bounded wait: end_processing and submit both notify, but a
            // job may land between the pop and the lock.
            drop(
                self.cv
                    .wait_timeout(st, Duration::from_millis(1))
                    .unwrap_or_else(|e| e.into_inner()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn recv_priority_runs_first() {
        let fiber = FiberScheduler::new();
        fiber.begin_processing();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&order), Arc::clone(&order));
        fiber.submit(
            move || a.lock().unwrap().push("extract"),
            PRIORITY_EXTRACT,
        );
        fiber.submit(move || b.lock().unwrap().push("recv"), PRIORITY_RECV);
        assert!(fiber.process_one(0));
        assert!(fiber.process_one(0));
        fiber.end_processing();
        assert_eq!(*order.lock().unwrap(), vec!["recv", "extract"]);
    }

    #[test]
    fn process_one_respects_min_priority() {
        let fiber = FiberScheduler::new();
        fiber.begin_processing();
        fiber.submit(|| {}, PRIORITY_EXTRACT);
        assert!(!fiber.process_one(PRIORITY_RECV));
        assert!(fiber.process_one(PRIORITY_EXTRACT));
        fiber.end_processing();
    }

    #[test]
    fn workers_drain_until_end() {
        let fiber = Arc::new(FiberScheduler::new());
        fiber.begin_processing();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let ran = Arc::clone(&ran);
            fiber.submit(
                move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                PRIORITY_EXTRACT,
            );
        }
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let f = Arc::clone(&fiber);
                std::thread::spawn(move || f.worker_loop())
            })
            .collect();
        // Late submission while workers are live.
        let ran2 = Arc::clone(&ran);
        fiber.submit(
            move || {
                ran2.fetch_add(1, Ordering::Relaxed);
            },
            PRIORITY_RECV,
        );
        fiber.end_processing();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(ran.load(Ordering::Relaxed), 33);
    }
}
