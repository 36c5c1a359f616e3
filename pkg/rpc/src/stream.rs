use std::marker::PhantomData;

use common::errors::*;
use executor::channel::spsc;

/// A lazy sequence of values, produced on demand, ending with an implicit
/// completion. Each item is itself a `Result` so
/// that an error raised mid-sequence can surface to whatever is iterating it
/// without needing a separate terminal-error variant — `None` always means
/// "no more items", `Some(Err(_))` means "this was the last item and it was
/// an error".
///
/// Mirrors `common::io::Streamable`, specialized so middleware and the
/// dispatcher can tell "next response" from "the stream ended in error",
/// the same distinction a generator draws between its last `yield` and a
/// `return`.
#[async_trait]
pub trait Stream<T: Send>: Send {
    async fn next(&mut self) -> Option<Result<T>>;
}

pub type BoxStream<T> = Box<dyn Stream<T>>;

/// Lets a `BoxStream<T>` itself satisfy an `impl Stream<T>` bound (e.g.
/// `Yielder::forward`'s argument), the same way `std`'s own `Iterator` is
/// implemented for `Box<dyn Iterator>`.
#[async_trait]
impl<T: Send> Stream<T> for BoxStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        (**self).next().await
    }
}

/// A finished/empty sequence.
pub struct EmptyStream<T> {
    _marker: PhantomData<T>,
}

impl<T> EmptyStream<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send> Stream<T> for EmptyStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        None
    }
}

/// A sequence of exactly the given values, then completion. Used to adapt a
/// unary/client-streaming handler's single return value into the uniform
/// response-sequence shape the middleware chain expects.
pub struct VecStream<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> VecStream<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub fn single(item: T) -> Self {
        Self::new(vec![item])
    }
}

#[async_trait]
impl<T: Send> Stream<T> for VecStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        self.items.next().map(Ok)
    }
}

/// A sequence that immediately ends in the given error.
pub struct ErrorStream<T> {
    error: Option<Error>,
    _marker: PhantomData<T>,
}

impl<T> ErrorStream<T> {
    pub fn new(error: Error) -> Self {
        Self {
            error: Some(error),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send> Stream<T> for ErrorStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        self.error.take().map(Err)
    }
}

/// The write half of a channel-backed `Stream`. Backpressure comes directly
/// from the underlying bounded `executor::channel::spsc` channel: `send()`
/// suspends once the channel is full.
pub struct ChannelSender<T> {
    inner: spsc::Sender<Result<T>>,
}

impl<T: Send + 'static> ChannelSender<T> {
    /// Returns `false` if the receiving half has already been dropped (the
    /// consumer stopped iterating early).
    pub async fn send(&mut self, value: Result<T>) -> bool {
        self.inner.send(value).await.is_ok()
    }
}

/// The read half of a channel-backed `Stream`.
pub struct ChannelReceiver<T> {
    inner: spsc::Receiver<Result<T>>,
}

#[async_trait]
impl<T: Send + 'static> Stream<T> for ChannelReceiver<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        match self.inner.recv().await {
            Ok(v) => Some(v),
            Err(_) => None,
        }
    }
}

/// Creates a bounded channel-backed `Stream`, used to bridge a handler that
/// produces values concurrently with the code draining them (the transport
/// on the server side, the consumer-facing sequence on the client side).
pub fn channel<T: Send + 'static>(capacity: usize) -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = spsc::bounded(capacity);
    (ChannelSender { inner: tx }, ChannelReceiver { inner: rx })
}

/// A handle to the write side of a lazily-driven sequence, handed to
/// streaming handlers and middleware alike so both can be expressed as
/// ordinary `async fn`s instead of hand-written `Stream` impls, each
/// represented as a channel-returning operation plus a completion signal.
pub struct Yielder<T> {
    sender: ChannelSender<T>,
}

impl<T: Send + 'static> Yielder<T> {
    pub fn new(sender: ChannelSender<T>) -> Self {
        Self { sender }
    }

    /// Yields one value. Returns `false` if the consumer has already
    /// stopped reading.
    pub async fn emit(&mut self, value: T) -> bool {
        self.sender.send(Ok(value)).await
    }

    /// Yields the terminal error, ending the sequence. Used by the task
    /// driving this `Yielder` to report its own `Err` return after the body
    /// it ran has already finished (so the `Yielder` it held is available
    /// again): an error raised after delegating surfaces as the sequence's
    /// terminal error.
    pub async fn emit_error(&mut self, error: Error) -> bool {
        self.sender.send(Err(error)).await
    }

    /// Drains `inner`, emitting every value it yields, in order, and
    /// returning its terminal error (if any). The chain must preserve
    /// response order.
    pub async fn forward(&mut self, mut inner: impl Stream<T>) -> Result<()> {
        while let Some(item) = inner.next().await {
            match item {
                Ok(v) => {
                    if !self.emit(v).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A channel-backed `Stream` driven by a background task, plus the task
/// handle that owns it. Dropping the stream before the task finishes cancels
/// the task, running whatever cleanup its own scope guards perform — the
/// user-observable cleanup path for early termination. Built by the
/// handler/middleware adapters in `server.rs`/`middleware.rs`, which spawn a
/// task that drives a `Yielder<T>` and, on the task's own error return,
/// writes a trailing `Err` into the channel.
pub struct TaskStream<T> {
    receiver: ChannelReceiver<T>,
    task: executor::child_task::ChildTask,
}

impl<T: Send + 'static> TaskStream<T> {
    pub fn new(receiver: ChannelReceiver<T>, task: executor::child_task::ChildTask) -> Self {
        Self { receiver, task }
    }
}

#[async_trait]
impl<T: Send + 'static> Stream<T> for TaskStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.next().await
    }
}

/// Wraps a `Stream` with a cleanup closure guaranteed to run exactly once on
/// every termination path: normal completion, an error item, or the
/// consumer dropping the stream early without driving it to completion.
/// `finally`-style cleanup must execute on every termination path, the same
/// way a request sequence's `finally` block must run.
pub struct WithCleanup<T, S: Stream<T>, F: FnMut() + Send> {
    inner: S,
    cleanup: Option<F>,
    _marker: PhantomData<T>,
}

impl<T, S: Stream<T>, F: FnMut() + Send> WithCleanup<T, S, F> {
    pub fn new(inner: S, cleanup: F) -> Self {
        Self {
            inner,
            cleanup: Some(cleanup),
            _marker: PhantomData,
        }
    }

    fn run_cleanup(&mut self) {
        if let Some(mut f) = self.cleanup.take() {
            f();
        }
    }
}

#[async_trait]
impl<T: Send, S: Stream<T> + Send, F: FnMut() + Send> Stream<T> for WithCleanup<T, S, F> {
    async fn next(&mut self) -> Option<Result<T>> {
        let item = self.inner.next().await;
        if item.is_none() {
            self.run_cleanup();
        }
        item
    }
}

impl<T, S: Stream<T>, F: FnMut() + Send> Drop for WithCleanup<T, S, F> {
    fn drop(&mut self) {
        self.run_cleanup();
    }
}

/// Drains a stream to completion, collecting every successfully-yielded
/// value. Stops (and returns the error) on the first `Err` item.
pub async fn collect<T: Send>(mut stream: impl Stream<T>) -> Result<Vec<T>> {
    let mut out = vec![];
    while let Some(item) = stream.next().await {
        out.push(item?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[testcase]
    async fn vec_stream_yields_in_order() {
        let mut s = VecStream::new(vec![1, 2, 3]);
        assert_eq!(s.next().await.unwrap().unwrap(), 1);
        assert_eq!(s.next().await.unwrap().unwrap(), 2);
        assert_eq!(s.next().await.unwrap().unwrap(), 3);
        assert!(s.next().await.is_none());
    }

    #[testcase]
    async fn error_stream_yields_one_error_then_ends() {
        let mut s: ErrorStream<u32> = ErrorStream::new(err_msg("boom"));
        assert!(s.next().await.unwrap().is_err());
        assert!(s.next().await.is_none());
    }

    #[testcase]
    async fn channel_stream_round_trips() {
        let (mut tx, mut rx) = channel::<u32>(4);
        tx.send(Ok(1)).await;
        tx.send(Ok(2)).await;
        drop(tx);

        assert_eq!(rx.next().await.unwrap().unwrap(), 1);
        assert_eq!(rx.next().await.unwrap().unwrap(), 2);
        assert!(rx.next().await.is_none());
    }

    #[testcase]
    async fn cleanup_runs_on_normal_completion() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut s = WithCleanup::new(VecStream::new(vec![1]), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(s.next().await.unwrap().unwrap(), 1);
        assert_eq!(s.next().await, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[testcase]
    async fn cleanup_runs_exactly_once_on_early_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let s = WithCleanup::new(VecStream::new(vec![1, 2, 3]), move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        drop(s);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[testcase]
    async fn collect_stops_at_first_error() {
        let (mut tx, rx) = channel::<u32>(4);
        tx.send(Ok(1)).await;
        tx.send(Err(err_msg("boom"))).await;
        tx.send(Ok(3)).await;
        drop(tx);

        assert!(collect(rx).await.is_err());
    }
}
