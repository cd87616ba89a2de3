//! Background work queues.
//!
//! Two flavours are offered: a [`Worker`] that runs jobs in
//! submission order on a dedicated thread, and a [`Debouncer`]
//! that holds on to a single job and only runs it once no new
//! job has been armed for a full delay window.
use crate::error::Error;
use log::debug;
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single threaded, in-order work queue.
pub struct Worker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Result<Self, Error> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|_| Error::Configuration("Failed to spawn worker thread"))?;
        Ok(Self { sender: Some(sender), thread: Some(thread) })
    }

    /// Queues a job. Returns false if the worker is no longer running.
    pub fn schedule<J: FnOnce() + Send + 'static>(&self, job: J) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Blocks until every job queued before this call has run.
    pub fn wait_idle(&self) {
        let (done, finished) = mpsc::channel();
        if self.schedule(move || {
            let _ = done.send(());
        }) {
            let _ = finished.recv();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum Signal {
    Arm(Job),
    Flush(Sender<()>),
}

/// Delayed single-slot job runner. Arming a new job replaces any
/// pending one and restarts the delay window.
pub struct Debouncer {
    sender: Option<Sender<Signal>>,
    thread: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn spawn(name: &str, delay: Duration) -> Result<Self, Error> {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::run(receiver, delay))
            .map_err(|_| Error::Configuration("Failed to spawn debouncer thread"))?;
        Ok(Self { sender: Some(sender), thread: Some(thread) })
    }

    pub fn arm<J: FnOnce() + Send + 'static>(&self, job: J) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Signal::Arm(Box::new(job))).is_ok(),
            None => false,
        }
    }

    /// Runs the pending job, if any, without waiting for the window to close.
    pub fn flush(&self) {
        let (done, finished) = mpsc::channel();
        if let Some(sender) = &self.sender {
            if sender.send(Signal::Flush(done)).is_ok() {
                let _ = finished.recv();
            }
        }
    }

    fn run(receiver: Receiver<Signal>, delay: Duration) {
        let mut pending: Option<(Instant, Job)> = None;
        loop {
            let deadline = pending.as_ref().map(|(deadline, _)| *deadline);
            let signal = match deadline {
                None => match receiver.recv() {
                    Ok(signal) => signal,
                    Err(_) => break,
                },
                Some(deadline) => {
                    match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(signal) => signal,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Some((_, job)) = pending.take() {
                                job();
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            match signal {
                Signal::Arm(job) => {
                    if pending.is_some() {
                        debug!("Debounce window restarted");
                    }
                    pending = Some((Instant::now() + delay, job));
                }
                Signal::Flush(done) => {
                    if let Some((_, job)) = pending.take() {
                        job();
                    }
                    let _ = done.send(());
                }
            }
        }

        // Shutting down never drops a pending job
        if let Some((_, job)) = pending.take() {
            job();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    #[test]
    fn worker_runs_jobs_in_submission_order() {
        let worker = Worker::spawn("test-worker").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            assert!(worker.schedule(move || log.lock().unwrap().push(i)));
        }
        worker.wait_idle();
        assert_eq!(*log.lock().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn rearming_the_debouncer_replaces_the_pending_job() {
        // Given
        let debouncer = Debouncer::spawn("test-debouncer", Duration::from_secs(60)).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        // When
        for i in 1..=3 {
            let (runs, last) = (Arc::clone(&runs), Arc::clone(&last));
            debouncer.arm(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                last.store(i, Ordering::SeqCst);
            });
        }
        debouncer.flush();

        // Then
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn debouncer_fires_after_the_window() {
        let debouncer = Debouncer::spawn("test-debouncer", Duration::from_millis(10)).unwrap();
        let (done, finished) = mpsc::channel();
        debouncer.arm(move || done.send(()).unwrap());
        assert!(finished.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn dropping_the_debouncer_flushes_the_pending_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let debouncer = Debouncer::spawn("test-debouncer", Duration::from_secs(60)).unwrap();
            let runs = Arc::clone(&runs);
            debouncer.arm(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
