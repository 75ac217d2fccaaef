//! Blocking pool: a small fixed set of host threads for computations that
//! would stall the executor thread (file readiness, socket waits).
//!
//! Jobs are plain closures returning a `BlockingOutcome`; the heap is owned
//! exclusively by the VM thread, so workers never see a `Value`. Completions
//! flow back over a channel the executor drains, waking the associated task.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Host-side result of a blocking job, converted to a `Value` on the VM
/// thread.
#[derive(Debug)]
pub enum BlockingOutcome {
    Unit,
    Int(i64),
    Err(String),
}

type Job = Box<dyn FnOnce() -> BlockingOutcome + Send + 'static>;

pub struct BlockingPool {
    jobs: Sender<(u64, Job)>,
    done: Receiver<(u64, BlockingOutcome)>,
    /// Jobs submitted but not yet drained.
    pub outstanding: usize,
    _workers: Vec<JoinHandle<()>>,
}

impl BlockingPool {
    pub fn new(threads: usize) -> Self {
        let (jobs_tx, jobs_rx) = channel::<(u64, Job)>();
        let (done_tx, done_rx) = channel();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let workers = (0..threads.max(1))
            .map(|i| {
                let jobs_rx = Arc::clone(&jobs_rx);
                let done_tx = done_tx.clone();
                std::thread::Builder::new()
                    .name(format!("volt-blocking-{i}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let guard = match jobs_rx.lock() {
                                    Ok(guard) => guard,
                                    Err(_) => return,
                                };
                                guard.recv()
                            };
                            let Ok((task, job)) = job else {
                                return;
                            };
                            let outcome = job();
                            if done_tx.send((task, outcome)).is_err() {
                                return;
                            }
                        }
                    })
                    .expect("spawning a blocking worker thread")
            })
            .collect();
        BlockingPool {
            jobs: jobs_tx,
            done: done_rx,
            outstanding: 0,
            _workers: workers,
        }
    }

    /// Submit a job on behalf of `task`; its completion wakes that task id.
    pub fn submit(&mut self, task: u64, job: impl FnOnce() -> BlockingOutcome + Send + 'static) {
        debug!(task, "submitting blocking job");
        self.outstanding += 1;
        // Send only fails when every worker has exited, which cannot happen
        // while the pool owns the join handles.
        let _ = self.jobs.send((task, Box::new(job)));
    }

    /// Collect every completion that has already arrived.
    pub fn try_drain(&mut self) -> Vec<(u64, BlockingOutcome)> {
        let mut completions = Vec::new();
        while let Ok(done) = self.done.try_recv() {
            self.outstanding -= 1;
            completions.push(done);
        }
        completions
    }

    /// Block for one completion, up to `timeout` when given.
    pub fn wait_one(&mut self, timeout: Option<Duration>) -> Option<(u64, BlockingOutcome)> {
        if self.outstanding == 0 {
            return None;
        }
        let result = match timeout {
            Some(t) => match self.done.recv_timeout(t) {
                Ok(done) => Some(done),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.done.recv().ok(),
        };
        if result.is_some() {
            self.outstanding -= 1;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_complete() {
        let mut pool = BlockingPool::new(2);
        pool.submit(1, || BlockingOutcome::Int(42));
        pool.submit(2, || BlockingOutcome::Unit);
        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some((task, _)) = pool.wait_one(Some(Duration::from_secs(5))) {
                seen.push(task);
            }
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(pool.outstanding, 0);
    }

    #[test]
    fn test_try_drain_nonblocking() {
        let mut pool = BlockingPool::new(1);
        assert!(pool.try_drain().is_empty());
        pool.submit(7, || {
            std::thread::sleep(Duration::from_millis(10));
            BlockingOutcome::Err("late".to_string())
        });
        let done = pool.wait_one(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(done.0, 7);
        assert!(matches!(done.1, BlockingOutcome::Err(_)));
    }
}
