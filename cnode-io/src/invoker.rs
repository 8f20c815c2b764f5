//! Named, single-producer serialized task queues ("invokers", §5, §9).
//!
//! The source this is reimplemented from expresses suspension as
//! coroutine-style awaits on a fiber bound to a named executor; the
//! idiomatic Rust equivalent used throughout this workspace is a task
//! that owns an mpsc queue and drains it one item at a time on a spawned
//! tokio task, the same shape `pbs-client`'s upload queue
//! (`mpsc::Sender<(MergedChunkInfo, ...)>`) uses to serialize writes onto
//! a single logical worker.
//!
//! Two invoker kinds appear in the data-node half of this workspace: the
//! per-location write-pool invoker (`Invoker`, blocking-safe, may touch
//! disk) and the per-session control invoker (also `Invoker`, cooperative
//! only). Both are the same primitive; the distinction is in which
//! closures are ever posted to them.

use std::future::Future;
use std::pin::Pin;

use anyhow::{format_err, Error};
use tokio::sync::{mpsc, oneshot};

type BoxedJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A single-threaded, FIFO work queue. Jobs submitted via [`Invoker::run`]
/// execute strictly in submission order and never overlap with each
/// other, even though the invoker itself is driven by the shared tokio
/// runtime rather than a dedicated OS thread.
#[derive(Clone)]
pub struct Invoker {
    sender: mpsc::UnboundedSender<BoxedJob>,
}

impl Invoker {
    pub fn spawn(name: &'static str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxedJob>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job().await;
            }
            log::debug!("invoker '{name}' shut down: all senders dropped");
        });

        Self { sender }
    }

    /// Post a job and await its result. The returned future resolves only
    /// after every job submitted before it has finished running.
    pub async fn run<F, T>(&self, job: F) -> Result<T, Error>
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = T> + Send>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: BoxedJob = Box::new(move || {
            Box::pin(async move {
                let result = job().await;
                let _ = tx.send(result);
            })
        });

        self.sender
            .send(boxed)
            .map_err(|_| format_err!("invoker queue closed"))?;

        rx.await.map_err(|_| format_err!("invoker dropped job before completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn jobs_run_in_submission_order() {
        let invoker = Invoker::spawn("test");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20 {
            let invoker = invoker.clone();
            let order = order.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                invoker
                    .run(move || {
                        Box::pin(async move {
                            let seq = counter.fetch_add(1, Ordering::SeqCst);
                            order.lock().unwrap().push((i, seq));
                        })
                    })
                    .await
                    .unwrap();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 20);
        // the invoker processes jobs strictly in the order they were
        // submitted to the channel, so the second element of every pair
        // is monotonically increasing alongside the submission index.
        for window in order.windows(2) {
            assert!(window[0].1 < window[1].1);
        }
    }
}
