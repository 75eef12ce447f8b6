use std::future::Future;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::SyncError;

// SERIAL QUEUE
// ================================================================================================

/// A single-consumer FIFO that serializes asynchronous tasks.
///
/// Every task that touches the client's database — synchronizer ticks,
/// foreground simulation work, deferred-note reprocessing — is funneled
/// through one of these, which guarantees that at most one task executes at
/// any time and that tasks run in submission order.
///
/// A task whose future resolves to an error value does not poison the queue;
/// the next task runs regardless.
pub struct SerialQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Creates the queue and spawns its worker task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task.await;
            }
        });

        Self { sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
    }

    /// Enqueues `task` and waits for its turn and its outcome.
    ///
    /// The thunk is invoked only once every previously submitted task has run
    /// to completion. Returns [`SyncError::QueueClosed`] if [`SerialQueue::end`]
    /// was called before the task could run.
    pub async fn put<R, F, Fut>(&self, task: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let queued: BoxFuture<'static, ()> = Box::pin(async move {
            let result = task().await;
            // The caller may have stopped waiting; the task still ran.
            let _ = result_tx.send(result);
        });

        let sender = self
            .sender
            .lock()
            .expect("serial queue sender mutex poisoned")
            .as_ref()
            .cloned()
            .ok_or(SyncError::QueueClosed)?;
        sender.send(queued).map_err(|_| SyncError::QueueClosed)?;

        result_rx.await.map_err(|_| SyncError::QueueClosed)
    }

    /// Refuses further submissions and waits for already queued tasks to
    /// drain.
    pub async fn end(&self) {
        // Dropping the sender closes the channel; the worker drains what is
        // left and exits.
        self.sender.lock().expect("serial queue sender mutex poisoned").take();
        let worker = self.worker.lock().expect("serial queue worker mutex poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}
