// Copyright 2026 Daniel Smith
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Asynchronous reads on a dedicated worker thread.
//!
//! One physical device means one worker: jobs are handed over an mpsc
//! channel and run one at a time. Results come back through a completion
//! callback, which [`ReadTask`] wraps in a oneshot so it can be awaited.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use log::{debug, error};

use crate::error::{KbdError, KbdResult};

const WORKER_NAME: &str = "kbd-reader";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Key,
    Line,
}

impl fmt::Display for ReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadKind::Key => "key",
            ReadKind::Line => "line",
        })
    }
}

/// The read currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRead {
    pub kind: ReadKind,
    pub requested_at: Instant,
}

impl PendingRead {
    pub(crate) fn new(kind: ReadKind) -> Self {
        PendingRead {
            kind,
            requested_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.requested_at.elapsed()
    }
}

pub(crate) type KeyCompletion = Box<dyn FnOnce(KbdResult<char>) + Send>;
pub(crate) type LineCompletion = Box<dyn FnOnce(KbdResult<String>) + Send>;

/// Where a finished read is delivered.
pub(crate) enum Completion {
    Key(KeyCompletion),
    Line(LineCompletion),
}

impl Completion {
    pub fn kind(&self) -> ReadKind {
        match self {
            Completion::Key(_) => ReadKind::Key,
            Completion::Line(_) => ReadKind::Line,
        }
    }

    /// Deliver an error without reading.
    pub fn fail(self, err: KbdError) {
        match self {
            Completion::Key(done) => done(Err(err)),
            Completion::Line(done) => done(Err(err)),
        }
    }
}

struct Worker {
    jobs: Sender<Completion>,
    thread: JoinHandle<()>,
}

/// Owns the worker thread. The thread is started on the first request.
pub(crate) struct AsyncReadScheduler {
    worker: Mutex<Option<Worker>>,
}

impl AsyncReadScheduler {
    pub fn new() -> Self {
        AsyncReadScheduler {
            worker: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job` for the worker, spawning it with `run` if needed.
    ///
    /// On failure the completion is handed back untouched so the caller can
    /// report the error synchronously.
    pub fn submit<F>(&self, job: Completion, run: F) -> Result<(), (Completion, KbdError)>
    where
        F: Fn(Completion) + Send + 'static,
    {
        let mut worker = self.lock();
        if worker.is_none() {
            match spawn_worker(run) {
                Ok(w) => *worker = Some(w),
                Err(e) => return Err((job, e)),
            }
        }
        debug!("scheduling async {} read", job.kind());
        let sent = match worker.as_ref() {
            Some(w) => w.jobs.send(job),
            None => return Err((job, KbdError::WorkerGone)),
        };
        if let Err(mpsc::SendError(job)) = sent {
            // The worker thread is gone; the next request starts a fresh one.
            *worker = None;
            return Err((job, KbdError::WorkerGone));
        }
        Ok(())
    }

    /// Stop accepting work. Joins the worker unless it may be parked in a
    /// blocking read, in which case it is left to exit on its own.
    pub fn stop(&self, read_in_flight: bool) {
        let Some(Worker { jobs, thread: handle }) = self.lock().take() else {
            return;
        };
        drop(jobs);
        if handle.thread().id() == thread::current().id() {
            // Shut down from inside a completion; the loop ends on its own.
            debug!("{} stopped from its own completion", WORKER_NAME);
        } else if read_in_flight {
            debug!("{} left running until its read completes", WORKER_NAME);
        } else if handle.join().is_err() {
            error!("{} panicked", WORKER_NAME);
        }
    }
}

fn spawn_worker<F>(run: F) -> KbdResult<Worker>
where
    F: Fn(Completion) + Send + 'static,
{
    let (jobs, queue) = mpsc::channel::<Completion>();
    let thread = thread::Builder::new()
        .name(WORKER_NAME.to_string())
        .spawn(move || {
            for job in queue {
                let kind = job.kind();
                // A panicking completion must not take the worker with it.
                if panic::catch_unwind(AssertUnwindSafe(|| run(job))).is_err() {
                    error!("{} read completion panicked; {} keeps serving", kind, WORKER_NAME);
                }
            }
            debug!("{} exiting", WORKER_NAME);
        })?;
    Ok(Worker { jobs, thread })
}

/// The eventual result of an asynchronous read.
///
/// Await it, [`wait`](Self::wait) on it, or poll it with
/// [`try_result`](Self::try_result). Dropping it does not cancel the read.
#[must_use = "the read still happens; dropping the task discards its result"]
pub struct ReadTask<T> {
    rx: oneshot::Receiver<KbdResult<T>>,
}

impl<T: Send + 'static> ReadTask<T> {
    /// A task plus the callback that resolves it.
    pub(crate) fn channel() -> (Self, Box<dyn FnOnce(KbdResult<T>) + Send>) {
        let (tx, rx) = oneshot::channel();
        let done: Box<dyn FnOnce(KbdResult<T>) + Send> = Box::new(move |result| {
            // The receiver may already be gone; the read still counts.
            let _ = tx.send(result);
        });
        (ReadTask { rx }, done)
    }
}

impl<T> ReadTask<T> {
    /// Block the current thread until the read completes.
    pub fn wait(self) -> KbdResult<T> {
        futures::executor::block_on(self)
    }

    /// The result if the read already finished, without blocking.
    pub fn try_result(&mut self) -> Option<KbdResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::Canceled) => Some(Err(KbdError::WorkerGone)),
        }
    }
}

impl<T> Future for ReadTask<T> {
    type Output = KbdResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(KbdError::WorkerGone)))
    }
}
