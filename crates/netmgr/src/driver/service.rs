// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Single-threaded service worker with guarded cross-thread calls.
//!
//! [`Service`] owns a piece of state on a dedicated thread and executes
//! closures against it one at a time. The state is built by a factory *on*
//! the worker thread, so it never has to be `Send` - which is what lets an
//! embedded interpreter live behind a thread-safe facade.
//!
//! [`Service::safely_call`] is the only way in: it ships a closure to the
//! worker, waits for the answer with a deadline, and converts a panic inside
//! the closure into an [`Error::Panicked`] instead of tearing the process
//! down. A timed-out call does not cancel the closure; it keeps running on
//! the worker and later jobs stay serialized behind it.

use crossbeam::channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Worker thread owning a state value of type `S`, reachable only through
/// serialized closures.
pub struct Service<S> {
    name: String,
    tx: Mutex<Option<Sender<Job<S>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Service<S> {
    /// Spawn the worker thread and build the state on it via `init`.
    ///
    /// Blocks until the factory ran; an `Err` from the factory becomes the
    /// return value and the thread exits without serving any job.
    pub fn spawn<F>(name: &str, init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (job_tx, job_rx) = unbounded::<Job<S>>();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let thread_name = name.to_owned();

        let worker = std::thread::Builder::new()
            .name(format!("svc-{}", name))
            .spawn(move || {
                let mut state = match init() {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Runs until every sender is dropped, then the state is
                // dropped here, on the thread that built it.
                for job in job_rx {
                    job(&mut state);
                }
                log::debug!("[Service] '{}' worker finished", thread_name);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name: name.to_owned(),
                tx: Mutex::new(Some(job_tx)),
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            // Factory panicked before reporting.
            Err(_) => {
                let _ = worker.join();
                Err(Error::Panicked(format!("service '{}' init panicked", name)))
            }
        }
    }

    /// Run `f` against the worker-owned state and wait up to `timeout` for
    /// the answer.
    ///
    /// A panic inside `f` is caught on the worker and surfaces here as
    /// [`Error::Panicked`]; the worker survives and serves later calls.
    /// On [`Error::CallTimeout`] the closure still completes eventually -
    /// callers that cannot tolerate that must retire the whole service.
    pub fn safely_call<R, F>(&self, timeout: Duration, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let job: Job<S> = Box::new(move |state| {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(state)));
            let _ = done_tx.send(outcome);
        });

        {
            let guard = self.tx.lock();
            let tx = guard
                .as_ref()
                .ok_or_else(|| Error::ServiceClosed(self.name.clone()))?;
            tx.send(job)
                .map_err(|_| Error::ServiceClosed(self.name.clone()))?;
        }

        match done_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(Error::Panicked(panic_message(payload.as_ref()))),
            Err(RecvTimeoutError::Timeout) => Err(Error::CallTimeout(self.name.clone())),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ServiceClosed(self.name.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs, let queued ones finish, and join the worker.
    /// Idempotent.
    pub fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("[Service] '{}' worker thread panicked", self.name);
            }
        }
    }
}

impl<S> Drop for Service<S> {
    fn drop(&mut self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_calls_run_against_worker_state() {
        let svc = Service::spawn("counter", || Ok(0u32)).expect("spawn succeeds");
        for _ in 0..3 {
            svc.safely_call(LONG, |n| *n += 1).expect("call succeeds");
        }
        let n = svc.safely_call(LONG, |n| *n).expect("call succeeds");
        assert_eq!(n, 3);
        svc.close();
    }

    #[test]
    fn test_init_failure_propagates() {
        let err = match Service::<u32>::spawn("broken", || {
            Err(Error::Script("no interpreter".into()))
        }) {
            Err(err) => err,
            Ok(_) => panic!("init error must surface"),
        };
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn test_panic_is_caught_and_worker_survives() {
        let svc = Service::spawn("panicky", || Ok(7u32)).expect("spawn succeeds");
        let err = svc
            .safely_call(LONG, |_: &mut u32| panic!("deliberate"))
            .expect_err("panic must surface as error");
        assert!(matches!(err, Error::Panicked(msg) if msg.contains("deliberate")));

        // The worker must still answer after the panic.
        let n = svc.safely_call(LONG, |n| *n).expect("worker survived");
        assert_eq!(n, 7);
        svc.close();
    }

    #[test]
    fn test_timeout_does_not_cancel_the_job() {
        let svc = Service::spawn("slow", || Ok(Vec::<u32>::new())).expect("spawn succeeds");
        let err = svc
            .safely_call(SHORT, |log| {
                std::thread::sleep(Duration::from_millis(200));
                log.push(1);
            })
            .expect_err("deadline is shorter than the job");
        assert!(matches!(err, Error::CallTimeout(_)));

        // The next call queues behind the abandoned one and sees its effect.
        let seen = svc
            .safely_call(LONG, |log| {
                log.push(2);
                log.clone()
            })
            .expect("queued call succeeds");
        assert_eq!(seen, vec![1, 2]);
        svc.close();
    }

    #[test]
    fn test_close_rejects_further_calls() {
        let svc = Service::spawn("closing", || Ok(())).expect("spawn succeeds");
        svc.close();
        svc.close(); // idempotent
        let err = svc
            .safely_call(LONG, |()| ())
            .expect_err("closed service rejects calls");
        assert!(matches!(err, Error::ServiceClosed(_)));
    }

    #[test]
    fn test_close_drains_queued_jobs() {
        let svc = Service::spawn("draining", || Ok(0u32)).expect("spawn succeeds");
        // Abandon a slow job, then close; close must wait for it.
        let started = Instant::now();
        let _ = svc.safely_call(Duration::from_millis(1), |n| {
            std::thread::sleep(Duration::from_millis(150));
            *n += 1;
        });
        svc.close();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
