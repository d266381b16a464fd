mod extract;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub use extract::{Job, WorkerFailure, WorkerReply, default_extract};

use crate::plugins::{DependencyExtractor, HasteImpl};

/// Capabilities each worker needs, resolved once and shared by reference.
pub(crate) struct WorkerContext {
    pub haste_impl: Option<Arc<dyn HasteImpl>>,
    pub dependency_extractor: Option<Arc<dyn DependencyExtractor>>,
}

#[derive(Debug)]
pub(crate) enum WorkerRequest {
    Extract(Job),
    Sha1(Job),
}

impl WorkerRequest {
    fn job(&self) -> &Job {
        match self {
            WorkerRequest::Extract(job) | WorkerRequest::Sha1(job) => job,
        }
    }
}

pub(crate) type JobResult = Result<WorkerReply, WorkerFailure>;

const MAX_JOB_ATTEMPTS: u32 = 3;

/// Routes extraction jobs either to a lazily created thread pool or, for
/// `max_workers <= 1` and watch-mode one-shots, straight onto the calling
/// thread.
pub(crate) struct WorkerPool {
    ctx: Arc<WorkerContext>,
    max_workers: usize,
    force_in_band: bool,
    inner: Option<PoolInner>,
}

struct PoolInner {
    job_tx: Sender<(usize, WorkerRequest)>,
    reply_rx: Receiver<(usize, JobResult)>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, max_workers: usize) -> Self {
        Self {
            ctx,
            max_workers,
            force_in_band: false,
            inner: None,
        }
    }

    /// One-shot pool that executes every job on the caller's thread.
    pub fn in_band(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            max_workers: 1,
            force_in_band: true,
            inner: None,
        }
    }

    /// Run a batch of tagged jobs. Results are returned in completion order,
    /// which for the in-band path equals submission order.
    pub fn run(&mut self, requests: Vec<(String, WorkerRequest)>) -> Vec<(String, JobResult)> {
        if requests.is_empty() {
            return Vec::new();
        }

        if self.force_in_band || self.max_workers <= 1 {
            return requests
                .into_iter()
                .map(|(tag, request)| {
                    let result = execute_with_retries(&request, &self.ctx);
                    (tag, result)
                })
                .collect();
        }

        if self.inner.is_none() {
            self.inner = Some(spawn_pool(&self.ctx, self.max_workers));
        }
        let Some(inner) = self.inner.as_ref() else {
            return Vec::new();
        };

        let mut tags: Vec<Option<String>> = Vec::with_capacity(requests.len());
        let mut submitted = 0;
        for (index, (tag, request)) in requests.into_iter().enumerate() {
            tags.push(Some(tag));
            if inner.job_tx.send((index, request)).is_ok() {
                submitted += 1;
            }
        }

        let mut results = Vec::with_capacity(submitted);
        for _ in 0..submitted {
            let Ok((index, result)) = inner.reply_rx.recv() else {
                break;
            };
            if let Some(tag) = tags.get_mut(index).and_then(Option::take) {
                results.push((tag, result));
            }
        }
        results
    }

    /// Tear the pool down, joining every worker thread. Safe to call when no
    /// pool was ever spawned.
    pub fn cleanup(&mut self) {
        if let Some(inner) = self.inner.take() {
            drop(inner.job_tx);
            for handle in inner.handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn spawn_pool(ctx: &Arc<WorkerContext>, workers: usize) -> PoolInner {
    let (job_tx, job_rx) = mpsc::channel::<(usize, WorkerRequest)>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (reply_tx, reply_rx) = mpsc::channel();

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let job_rx = Arc::clone(&job_rx);
        let reply_tx = reply_tx.clone();
        let ctx = Arc::clone(ctx);
        handles.push(thread::spawn(move || {
            loop {
                let next = {
                    let Ok(guard) = job_rx.lock() else {
                        break;
                    };
                    guard.recv()
                };
                let Ok((index, request)) = next else {
                    break;
                };
                let result = execute_with_retries(&request, &ctx);
                if reply_tx.send((index, result)).is_err() {
                    break;
                }
            }
        }));
    }

    PoolInner {
        job_tx,
        reply_rx,
        handles,
    }
}

fn execute(request: &WorkerRequest, ctx: &WorkerContext) -> JobResult {
    match request {
        WorkerRequest::Extract(job) => extract::extract(job, ctx),
        WorkerRequest::Sha1(job) => extract::sha1_only(job),
    }
}

/// A panicking job is retried a bounded number of times; ordinary errors
/// surface immediately.
fn execute_with_retries(request: &WorkerRequest, ctx: &WorkerContext) -> JobResult {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match panic::catch_unwind(AssertUnwindSafe(|| execute(request, ctx))) {
            Ok(result) => return result,
            Err(payload) if attempt >= MAX_JOB_ATTEMPTS => {
                return Err(WorkerFailure::Crashed {
                    path: request.job().abs_path.clone(),
                    attempts: attempt,
                    message: panic_message(&payload),
                });
            }
            Err(_) => {}
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
