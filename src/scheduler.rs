//! Keyed Task Scheduler
//!
//! Runs CPU-heavy jobs (parsing, mapping) in isolated executors on the tokio
//! blocking pool. An executor shares nothing with its caller; it talks to a
//! driver task through channels using a small protocol:
//! - Ready: handshake, the driver posts the payload in reply to every Ready.
//!   The built-in executor loop sends it once per task.
//! - Working: progress text for the status line
//! - Completed / Failed: settle the task and free its key
//!
//! At most one task is live per key. Starting a task under a busy key cancels
//! the previous one, whose future then stays pending forever.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventSource, Subscription};

/// User-visible message for executor crashes; details only go to the log
pub const RUNTIME_FAILURE_MESSAGE: &str = "Operation failed. See log for details.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("executor runtime failure")]
    Runtime,
    #[error("task cancelled")]
    Cancelled,
}

/// A cancellation token shared between the scheduler and an executor.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Messages an executor posts back to its driver
#[derive(Debug)]
pub enum ExecutorMessage<T> {
    Ready,
    Working(String),
    Completed(T),
    Failed(String),
}

/// The executor's end of the channel pair
pub struct ExecutorPort<T> {
    outbox: mpsc::UnboundedSender<ExecutorMessage<T>>,
    token: CancellationToken,
}

impl<T> ExecutorPort<T> {
    /// Surface a progress string on the scheduler's status line
    pub fn progress(&self, message: impl Into<String>) {
        self.post(ExecutorMessage::Working(message.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.outbox.is_closed()
    }

    /// Cooperative cancellation point for long loops
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn post(&self, message: ExecutorMessage<T>) -> bool {
        self.outbox.send(message).is_ok()
    }
}

/// Work that runs inside an isolated executor
pub trait Executor: Send + 'static {
    type Payload: Clone + Send + 'static;
    type Output: Send + 'static;

    fn execute(
        &mut self,
        payload: Self::Payload,
        port: &ExecutorPort<Self::Output>,
    ) -> anyhow::Result<Self::Output>;
}

/// Task-type descriptor: the key slot plus a factory for fresh executors
pub struct TaskType<E> {
    pub key: &'static str,
    pub factory: fn() -> E,
}

impl<E> Clone for TaskType<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for TaskType<E> {}

/// Future returned by [`TaskScheduler::run_task`].
///
/// Resolves with the task's result. If the task is cancelled or superseded
/// it never resolves.
pub struct TaskFuture<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
    abandoned: bool,
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.abandoned {
            return Poll::Pending;
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                self.abandoned = true;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    StatusChanged(String),
    ErrorsChanged,
    Idle,
}

struct LiveTask {
    generation: u64,
    token: CancellationToken,
    driver: JoinHandle<()>,
}

impl LiveTask {
    fn cancel(self) {
        self.token.cancel();
        self.driver.abort();
    }
}

struct SchedulerState {
    tasks: HashMap<&'static str, LiveTask>,
    next_generation: u64,
    /// Continuations currently running after their task retired
    settling: usize,
    idle: bool,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
    status: String,
    errors: Vec<String>,
}

impl SchedulerState {
    fn busy(&self) -> usize {
        self.tasks.len() + self.settling
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    events: EventSource<SchedulerEvent>,
    busy: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: String) {
        {
            let mut state = self.lock();
            if state.status == status {
                return;
            }
            state.status = status.clone();
        }
        self.events.notify(&SchedulerEvent::StatusChanged(status));
    }

    fn add_error(&self, message: String) {
        self.lock().errors.push(message);
        self.events.notify(&SchedulerEvent::ErrorsChanged);
    }

    /// Removes the task if `generation` is still the live one for `key`
    fn retire(self: &Arc<Self>, key: &str, generation: u64) -> Option<SettleGuard> {
        let mut state = self.lock();
        match state.tasks.get(key) {
            Some(task) if task.generation == generation => {}
            _ => return None,
        }
        state.tasks.remove(key);
        state.settling += 1;
        Some(SettleGuard {
            shared: Arc::clone(self),
        })
    }

    /// Runs the idle hook once per busy -> idle transition
    fn check_idle(&self) {
        let deferred = {
            let mut state = self.lock();
            if state.busy() > 0 || state.idle {
                self.busy.send_replace(state.busy());
                return;
            }
            state.idle = true;
            std::mem::take(&mut state.deferred)
        };

        debug!("Scheduler idle, flushing {} deferred actions", deferred.len());
        for action in deferred {
            action();
        }
        self.events.notify(&SchedulerEvent::Idle);

        let busy = self.lock().busy();
        self.busy.send_replace(busy);
    }
}

/// Keeps the scheduler busy while a retired task's continuation runs
struct SettleGuard {
    shared: Arc<Shared>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.shared.lock().settling -= 1;
        self.shared.check_idle();
    }
}

/// Keyed single-flight scheduler. Cheap to clone; clones share state.
///
/// Must be used from inside a tokio runtime.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    next_generation: 0,
                    settling: 0,
                    idle: true,
                    deferred: Vec::new(),
                    status: String::new(),
                    errors: Vec::new(),
                }),
                events: EventSource::new(),
                busy,
            }),
        }
    }

    /// Start a task and get a future for its result
    pub fn run_task<E: Executor>(
        &self,
        task: TaskType<E>,
        payload: E::Payload,
    ) -> TaskFuture<E::Output> {
        let (tx, rx) = oneshot::channel();
        self.run_task_then(task, payload, move |result| {
            let _ = tx.send(result);
        });
        TaskFuture {
            rx,
            abandoned: false,
        }
    }

    /// Start a task and run `then` with its result.
    ///
    /// `then` is dropped without being called if the task is cancelled or
    /// superseded.
    pub fn run_task_then<E, F>(&self, task: TaskType<E>, payload: E::Payload, then: F)
    where
        E: Executor,
        F: FnOnce(Result<E::Output, TaskError>) + Send + 'static,
    {
        let token = CancellationToken::new();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let port = ExecutorPort {
            outbox: outbox_tx,
            token: token.clone(),
        };
        let factory = task.factory;

        let status = format!("Initializing runtime for task [{}]...", task.key);
        {
            let mut state = self.shared.lock();
            if let Some(previous) = state.tasks.remove(task.key) {
                debug!(
                    "Task [{}] superseded (generation {})",
                    task.key, previous.generation
                );
                previous.cancel();
            }

            let generation = state.next_generation;
            state.next_generation += 1;

            let executor =
                tokio::task::spawn_blocking(move || run_executor(factory(), inbox_rx, port));
            let driver = tokio::spawn(drive::<E, F>(
                Arc::clone(&self.shared),
                task.key,
                generation,
                payload,
                inbox_tx,
                outbox_rx,
                executor,
                then,
            ));

            state.tasks.insert(
                task.key,
                LiveTask {
                    generation,
                    token,
                    driver,
                },
            );
            state.idle = false;
            self.shared.busy.send_replace(state.busy());
            debug!("Task [{}] started (generation {})", task.key, generation);
        }
        self.shared.set_status(status);
    }

    /// Cancel the live task under `key`, if any
    pub fn cancel_task(&self, key: &str) {
        let removed = self.shared.lock().tasks.remove(key);
        if let Some(task) = removed {
            debug!("Task [{}] cancelled", key);
            task.cancel();
            self.shared.set_status(String::new());
            self.shared.check_idle();
        }
    }

    /// Run `action` once nothing is live: now if idle, otherwise at the next
    /// idle transition
    pub fn defer_until_idle<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.busy() == 0 {
            drop(state);
            action();
        } else {
            state.deferred.push(Box::new(action));
        }
    }

    /// Resolves once no task is live and no continuation is running
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.busy.subscribe();
        let _ = rx.wait_for(|busy| *busy == 0).await;
    }

    pub fn task_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.shared.lock().tasks.contains_key(key)
    }

    pub fn status(&self) -> String {
        self.shared.lock().status.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.shared.lock().errors.clone()
    }

    pub fn clear_errors(&self) {
        self.shared.lock().errors.clear();
        self.shared.events.notify(&SchedulerEvent::ErrorsChanged);
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }
}

/// Executor side of the protocol, runs on the blocking pool
fn run_executor<E: Executor>(
    mut executor: E,
    mut inbox: mpsc::UnboundedReceiver<E::Payload>,
    port: ExecutorPort<E::Output>,
) {
    if !port.post(ExecutorMessage::Ready) {
        return;
    }
    let Some(payload) = inbox.blocking_recv() else {
        return;
    };
    if port.is_cancelled() {
        return;
    }

    let message = match executor.execute(payload, &port) {
        Ok(output) => ExecutorMessage::Completed(output),
        Err(_) if port.is_cancelled() => return,
        Err(e) => ExecutorMessage::Failed(e.to_string()),
    };
    port.post(message);
}

/// Scheduler side of the protocol for one task
#[allow(clippy::too_many_arguments)]
async fn drive<E, F>(
    shared: Arc<Shared>,
    key: &'static str,
    generation: u64,
    payload: E::Payload,
    inbox: mpsc::UnboundedSender<E::Payload>,
    mut outbox: mpsc::UnboundedReceiver<ExecutorMessage<E::Output>>,
    mut executor: JoinHandle<()>,
    then: F,
) where
    E: Executor,
    F: FnOnce(Result<E::Output, TaskError>) + Send + 'static,
{
    let started = Instant::now();

    let outcome = loop {
        match outbox.recv().await {
            Some(ExecutorMessage::Ready) => {
                shared.set_status(format!("[{}] task is ready to work", key));
                if inbox.send(payload.clone()).is_err() {
                    debug!("Task [{}] executor closed its inbox", key);
                }
            }
            Some(ExecutorMessage::Working(message)) => {
                debug!(task = key, "{}", message);
                shared.set_status(message);
            }
            Some(ExecutorMessage::Completed(output)) => break Ok(output),
            Some(ExecutorMessage::Failed(message)) => break Err(TaskError::Failed(message)),
            None => {
                match (&mut executor).await {
                    Err(e) if e.is_panic() => warn!("Task [{}] executor panicked", key),
                    Err(e) => warn!("Task [{}] executor aborted: {}", key, e),
                    Ok(()) => warn!("Task [{}] executor exited without a result", key),
                }
                break Err(TaskError::Runtime);
            }
        }
    };

    let Some(guard) = shared.retire(key, generation) else {
        debug!("Task [{}] generation {} abandoned", key, generation);
        return;
    };

    let elapsed = started.elapsed().as_secs_f32();
    match &outcome {
        Ok(_) => info!("Task {} completed in {:.3} sec", key, elapsed),
        Err(TaskError::Failed(message)) => {
            crate::log_error!(message, task = key);
            shared.add_error(format!("Operation failed: {}", message));
        }
        Err(e) => {
            crate::log_error!(e, task = key);
            shared.add_error(RUNTIME_FAILURE_MESSAGE.to_string());
        }
    }
    shared.set_status(String::new());

    then(outcome);
    drop(guard);
}
