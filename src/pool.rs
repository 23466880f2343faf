use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BackendError;

/// Message posted by a worker when its synthesis attempt ends.
#[derive(Debug)]
pub(crate) struct Completion {
    pub worker_id: u64,
    pub outcome: Result<(), BackendError>,
}

struct WorkerRecord {
    handle: JoinHandle<()>,
    delivered: bool,
}

/// Pool of short-lived background workers, one per outstanding
/// synthesis.
///
/// Each worker posts exactly one completion message on the channel,
/// even when the backend panics. The channel is consumed only by the
/// controlling task, which is what keeps callback delivery off worker
/// threads. The pool imposes no concurrency bound and no queueing.
pub struct WorkerPool {
    next_id: u64,
    workers: HashMap<u64, WorkerRecord>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_id: 0,
            workers: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Launch `task` on a new background worker and return its ID.
    pub fn spawn<F>(&mut self, task: F) -> u64
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        self.next_id += 1;
        let worker_id = self.next_id;
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(BackendError::Service(format!(
                    "worker panicked: {}",
                    panic_message(payload)
                ))),
            };
            // the receiver only closes when the whole pool is dropped
            let _ = tx.send(Completion { worker_id, outcome });
        });

        self.workers.insert(
            worker_id,
            WorkerRecord {
                handle,
                delivered: false,
            },
        );
        debug!(worker_id, live = self.workers.len(), "spawned worker");

        worker_id
    }

    /// Wait for the next completion message. Resolves only while at
    /// least one worker is outstanding, so callers gate on that.
    pub(crate) async fn next(&mut self) -> Option<Completion> {
        let completion = self.rx.recv().await;
        self.reap();
        completion
    }

    /// Mark a worker's result as delivered to its callbacks. The record
    /// is only released once the task has also fully wound down.
    pub(crate) fn mark_delivered(&mut self, worker_id: u64) {
        if let Some(record) = self.workers.get_mut(&worker_id) {
            record.delivered = true;
        }
        self.reap();
    }

    /// Number of worker records still held (delivered or not).
    pub fn live(&self) -> usize {
        self.workers.len()
    }

    fn reap(&mut self) {
        let before = self.workers.len();
        self.workers
            .retain(|_, record| !(record.delivered && record.handle.is_finished()));
        let reaped = before - self.workers.len();
        if reaped > 0 {
            debug!(reaped, live = self.workers.len(), "reaped finished workers");
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "no additional details available".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_success_exactly_once() {
        let mut pool = WorkerPool::new();
        let id = pool.spawn(async { Ok(()) });

        let completion = pool.next().await.expect("completion expected");
        assert_eq!(completion.worker_id, id);
        assert!(completion.outcome.is_ok());

        pool.mark_delivered(id);
        // no second message for the same worker
        assert!(
            tokio::time::timeout(Duration::from_millis(50), pool.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn delivers_backend_errors() {
        let mut pool = WorkerPool::new();
        pool.spawn(async { Err(BackendError::Service("HTTP 500".into())) });

        let completion = pool.next().await.unwrap();
        assert!(matches!(
            completion.outcome,
            Err(BackendError::Service(ref msg)) if msg == "HTTP 500"
        ));
    }

    #[tokio::test]
    async fn converts_panics_into_errors() {
        let mut pool = WorkerPool::new();
        pool.spawn(async { panic!("backend exploded") });

        let completion = pool.next().await.unwrap();
        match completion.outcome {
            Err(BackendError::Service(message)) => {
                assert!(message.contains("backend exploded"), "got {message}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaps_only_after_delivery_and_task_exit() {
        let mut pool = WorkerPool::new();
        let id = pool.spawn(async { Ok(()) });
        assert_eq!(pool.live(), 1);

        let completion = pool.next().await.unwrap();
        assert_eq!(completion.worker_id, id);

        pool.mark_delivered(id);
        // the task signals completion before fully exiting, so poll
        // briefly until the join handle reports finished
        for _ in 0..100 {
            pool.reap();
            if pool.live() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn interleaved_workers_complete_independently() {
        let mut pool = WorkerPool::new();
        let slow = pool.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let fast = pool.spawn(async { Ok(()) });

        let first = pool.next().await.unwrap();
        assert_eq!(first.worker_id, fast);
        let second = pool.next().await.unwrap();
        assert_eq!(second.worker_id, slow);
    }
}
