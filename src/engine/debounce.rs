// src/engine/debounce.rs
//
// Trailing-edge debouncer: every `schedule` replaces the pending job and
// restarts the delay. One worker thread per debouncer, fed over a channel.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule(Job),
    Cancel,
}

pub struct Debouncer {
    delay: Duration,
    commands: Option<Sender<Command>>,
    pending: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicBool::new(false));
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("lean-image-debounce".to_string())
            .spawn(move || run_worker(rx, delay, &worker_pending));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(%err, "failed to spawn debounce worker; scheduled jobs will not run");
                None
            }
        };
        let worker_id = worker.as_ref().map(|h| h.thread().id());

        Self {
            delay,
            commands: Some(tx),
            pending,
            worker,
            worker_id,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `job` once `delay` has passed without another `schedule`. A job
    /// already pending is dropped unrun.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.send(Command::Schedule(Box::new(job))) {
            self.pending.store(true, Ordering::SeqCst);
        }
    }

    /// Drop the pending job, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let had_pending = self.pending.swap(false, Ordering::SeqCst);
        self.send(Command::Cancel);
        had_pending
    }

    /// Advisory: a job that fires concurrently may still read as pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> bool {
        match &self.commands {
            Some(tx) if self.worker.is_some() => tx.send(command).is_ok(),
            _ => false,
        }
    }
}

fn run_worker(rx: Receiver<Command>, delay: Duration, pending: &AtomicBool) {
    let mut job: Option<Job> = None;
    loop {
        let received = if job.is_some() {
            rx.recv_timeout(delay)
        } else {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };
        match received {
            Ok(Command::Schedule(next)) => {
                if job.replace(next).is_some() {
                    tracing::trace!("debounce: replacing pending job");
                }
            }
            Ok(Command::Cancel) => job = None,
            Err(RecvTimeoutError::Timeout) => {
                let Some(due) = job.take() else { continue };
                if rx.is_empty() {
                    pending.store(false, Ordering::SeqCst);
                }
                if catch_unwind(AssertUnwindSafe(due)).is_err() {
                    tracing::error!("debounced job panicked");
                }
            }
            // Sender dropped: the owner is gone and any pending job goes with it.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.commands = None;
        self.pending.store(false, Ordering::SeqCst);
        // Dropped from inside a job: the worker exits on its own after the job returns.
        if self.worker_id == Some(thread::current().id()) {
            return;
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("debounce worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_job_runs_after_delay() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let (tx, rx) = bounded(1);
        let start = Instant::now();
        debouncer.schedule(move || tx.send(Instant::now()).unwrap());
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(start) >= Duration::from_millis(20));
        thread::sleep(Duration::from_millis(20));
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn test_rapid_schedules_collapse_to_last() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let runs = Arc::clone(&runs);
            let tx = tx.clone();
            debouncer.schedule(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                tx.send(i).unwrap();
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_each_schedule_restarts_the_delay() {
        let debouncer = Debouncer::new(Duration::from_millis(60));
        let (tx, rx) = unbounded();
        let start = Instant::now();
        for _ in 0..3 {
            let tx = tx.clone();
            debouncer.schedule(move || tx.send(Instant::now()).unwrap());
            thread::sleep(Duration::from_millis(30));
        }
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // last schedule landed ~60ms in, so the job cannot fire before ~120ms
        assert!(fired_at.duration_since(start) >= Duration::from_millis(120));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_cancel_drops_pending_job() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        debouncer.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(debouncer.is_pending());
        assert!(debouncer.cancel());
        assert!(!debouncer.is_pending());
        assert!(!debouncer.cancel());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let debouncer = Debouncer::new(Duration::from_millis(5));
        debouncer.schedule(|| panic!("job failure"));
        thread::sleep(Duration::from_millis(50));
        let (tx, rx) = bounded(1);
        debouncer.schedule(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_drop_discards_pending_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let debouncer = Debouncer::new(Duration::from_secs(60));
            let counter = Arc::clone(&runs);
            debouncer.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
