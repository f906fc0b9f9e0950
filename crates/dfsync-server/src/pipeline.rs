//! Asynchronous "what changed" notifications.
//!
//! Each CallbackList request becomes a [`NotificationTask`] owned by the
//! queue. The dispatcher blocks on the queue, takes a worker permit per task,
//! and hands the task to a worker that computes a fresh listing, replies and
//! retires the task together with its permit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dfsync_transport::{CallContext, FileList};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::service::FileService;

/// Lifecycle of one notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Accepted, responder registered.
    Create,
    /// Listing being computed.
    Process,
    /// Reply sent, task retired.
    Finish,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Tasks accepted into the queue.
    pub accepted: u64,
    /// Tasks whose listing was computed.
    pub processed: u64,
    /// Tasks retired, whether answered or dropped.
    pub finished: u64,
    /// Tasks retired without a listing because the caller went away.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    processed: AtomicU64,
    finished: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One pending notification request.
pub struct NotificationTask {
    id: u64,
    state: TaskState,
    ctx: CallContext,
    responder: oneshot::Sender<ServiceResult<FileList>>,
}

impl NotificationTask {
    fn transition(&mut self, next: TaskState) {
        debug!(task = self.id, from = ?self.state, to = ?next, "notification task");
        self.state = next;
    }
}

/// Queue, dispatcher and worker pool.
pub struct NotificationPipeline {
    tx: Mutex<Option<mpsc::UnboundedSender<NotificationTask>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Arc<Semaphore>,
    num_workers: u32,
    counters: Arc<Counters>,
    next_id: AtomicU64,
}

impl NotificationPipeline {
    /// Starts the dispatcher with `num_workers` concurrent listings.
    pub fn start(service: Arc<FileService>, num_workers: usize) -> Self {
        let num_workers = num_workers.clamp(1, 1024) as u32;
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(num_workers as usize));
        let counters = Arc::new(Counters::default());
        let dispatcher = tokio::spawn(dispatch(rx, service, workers.clone(), counters.clone()));
        info!(workers = num_workers, "notification pipeline started");
        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            workers,
            num_workers,
            counters,
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueues a request and returns the receiver for its listing.
    pub fn enqueue(&self, ctx: CallContext) -> ServiceResult<oneshot::Receiver<ServiceResult<FileList>>> {
        let (responder, rx) = oneshot::channel();
        let task = NotificationTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Create,
            ctx,
            responder,
        };
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or_else(shutting_down)?;
        tx.send(task).map_err(|_| shutting_down())?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    /// Enqueues a request and waits for its listing.
    pub async fn submit(&self, ctx: CallContext) -> ServiceResult<FileList> {
        let rx = self.enqueue(ctx)?;
        rx.await.map_err(|_| shutting_down())?
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Stops accepting, drains queued tasks and waits for running workers.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "notification dispatcher ended abnormally");
            }
        }
        // Every permit back means no worker is still running.
        match self.workers.acquire_many(self.num_workers).await {
            Ok(permits) => drop(permits),
            Err(_) => debug!("worker pool already closed"),
        }
        info!(stats = ?self.stats(), "notification pipeline stopped");
    }
}

fn shutting_down() -> ServiceError {
    ServiceError::DeadlineExceeded {
        reason: "notification pipeline is shutting down".to_string(),
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<NotificationTask>,
    service: Arc<FileService>,
    workers: Arc<Semaphore>,
    counters: Arc<Counters>,
) {
    while let Some(task) = rx.recv().await {
        let permit = match workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        tokio::spawn(run_task(task, permit, service.clone(), counters.clone()));
    }
    debug!("notification dispatcher drained");
}

async fn run_task(
    mut task: NotificationTask,
    permit: OwnedSemaphorePermit,
    service: Arc<FileService>,
    counters: Arc<Counters>,
) {
    if task.ctx.is_cancelled() || task.responder.is_closed() {
        task.transition(TaskState::Finish);
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        counters.finished.fetch_add(1, Ordering::Relaxed);
        drop(permit);
        return;
    }

    task.transition(TaskState::Process);
    let listing = service.list().await;
    counters.processed.fetch_add(1, Ordering::Relaxed);

    task.transition(TaskState::Finish);
    if task.responder.send(listing).is_err() {
        debug!(task = task.id, "caller left before the listing was ready");
    }
    counters.finished.fetch_add(1, Ordering::Relaxed);
    drop(permit);
}
