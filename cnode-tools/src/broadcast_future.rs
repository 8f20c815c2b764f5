//! Broadcast the result of a single future to any number of listeners
//! that register before it resolves. Used to collapse concurrent lookups
//! for the same key (artifact download, cache miss) into exactly one
//! underlying operation (§4.5: "exactly one downloader runs per
//! ArtifactKey").

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use futures::future::{FutureExt, TryFutureExt};
use tokio::sync::oneshot;

#[derive(Default)]
struct BroadcastData<T> {
    result: Option<Result<T, String>>,
    listeners: Vec<oneshot::Sender<Result<T, Error>>>,
}

impl<T: Clone> BroadcastData<T> {
    fn new() -> Self {
        Self {
            result: None,
            listeners: vec![],
        }
    }

    fn notify_listeners(&mut self, result: Result<T, String>) {
        self.result = Some(result.clone());

        while let Some(ch) = self.listeners.pop() {
            match &result {
                Ok(result) => {
                    let _ = ch.send(Ok(result.clone()));
                }
                Err(err) => {
                    let _ = ch.send(Err(format_err!("{}", err)));
                }
            }
        }
    }

    fn listen(&mut self) -> impl Future<Output = Result<T, Error>> {
        use futures::future::{err, ok, Either};

        match &self.result {
            None => {}
            Some(Ok(result)) => return Either::Left(ok(result.clone())),
            Some(Err(e)) => return Either::Left(err(format_err!("{}", e))),
        }

        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        self.listeners.push(tx);

        Either::Right(rx.map(|res| match res {
            Ok(Ok(t)) => Ok(t),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::from(e)),
        }))
    }
}

type SourceFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;

struct BroadcastFutureBinding<T> {
    broadcast: BroadcastData<T>,
    future: Option<SourceFuture<T>>,
}

/// Broadcasts a single source future's result to every registered
/// listener. Cancelling the underlying operation (by notifying listeners
/// with an error, e.g. on session cancellation) means any concurrent
/// waiter sees that error rather than a stale partial result (§5).
pub struct BroadcastFuture<T> {
    inner: Arc<Mutex<BroadcastFutureBinding<T>>>,
}

impl<T: Clone + Send + 'static> BroadcastFuture<T> {
    pub fn new(source: Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>) -> Self {
        let inner = BroadcastFutureBinding {
            broadcast: BroadcastData::new(),
            future: Some(source),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn notify_listeners(inner: Arc<Mutex<BroadcastFutureBinding<T>>>, result: Result<T, String>) {
        let mut data = inner.lock().unwrap();
        data.broadcast.notify_listeners(result);
    }

    fn spawn(inner: Arc<Mutex<BroadcastFutureBinding<T>>>) -> impl Future<Output = Result<T, Error>> {
        let mut data = inner.lock().unwrap();

        if let Some(source) = data.future.take() {
            let inner1 = inner.clone();
            let task = source.map(move |value| match value {
                Ok(value) => Self::notify_listeners(inner1, Ok(value)),
                Err(err) => Self::notify_listeners(inner1, Err(err.to_string())),
            });
            tokio::spawn(task);
        }

        data.broadcast.listen()
    }

    /// Register a listener for the broadcast result.
    pub fn listen(&self) -> impl Future<Output = Result<T, Error>> {
        let inner = self.inner.clone();
        async move { Self::spawn(inner).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn all_listeners_observe_the_same_result() {
        static CHECKSUM: AtomicUsize = AtomicUsize::new(0);

        let fut: Pin<Box<dyn Future<Output = Result<usize, Error>> + Send>> =
            Box::pin(async { Ok(7) });
        let broadcast = BroadcastFuture::new(fut);

        let a = broadcast.listen();
        let b = broadcast.listen();

        let (ra, rb) = tokio::join!(a, b);
        CHECKSUM.fetch_add(ra.unwrap(), Ordering::SeqCst);
        CHECKSUM.fetch_add(rb.unwrap(), Ordering::SeqCst);

        assert_eq!(CHECKSUM.load(Ordering::SeqCst), 14);
    }
}
