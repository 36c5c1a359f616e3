use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use executor::cancellation::CancellationToken;

/// Edge-triggered, latched cancellation notification shared by a call's
/// `CallContext`/`CallOptions` and the code that needs to abort it.
///
/// Cloning a `Signal` shares the same underlying flag: once one clone
/// observes `aborted() == true`, all clones do, and any in-flight `wait()`
/// future unblocks within one scheduling turn.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

struct Inner {
    aborted: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
}

impl Signal {
    /// Returns a fresh, not-yet-aborted signal paired with the controller
    /// used to fire it.
    pub fn new() -> (Signal, SignalController) {
        let inner = Arc::new(Inner {
            aborted: AtomicBool::new(false),
            waiters: Mutex::new(vec![]),
        });

        (
            Signal {
                inner: inner.clone(),
            },
            SignalController { inner },
        )
    }

    /// Returns a signal that is already permanently aborted. Useful for
    /// constructing a `CallContext` for a call that is cancelled before it
    /// starts (e.g. the peer closed before the handler could be invoked).
    pub fn already_aborted() -> Signal {
        let (signal, controller) = Signal::new();
        controller.abort();
        signal
    }

    pub fn aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves as soon as the signal is aborted (immediately, if it already
    /// is).
    pub fn wait(&self) -> impl Future<Output = ()> + '_ {
        WaitFuture { signal: self }
    }
}

struct WaitFuture<'a> {
    signal: &'a Signal,
}

impl<'a> Future for WaitFuture<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.aborted() {
            return Poll::Ready(());
        }

        let mut waiters = self.signal.inner.waiters.lock().unwrap();
        // Re-check under the lock: abort() clears the waiter list only after
        // flipping the flag, so if we lost the race it is already visible.
        if self.signal.aborted() {
            return Poll::Ready(());
        }
        waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

#[async_trait]
impl CancellationToken for Signal {
    async fn wait(&self) {
        Signal::wait(self).await
    }
}

/// The write side of a `Signal`. Exactly one abort ever takes effect; later
/// calls are no-ops: edge-triggered then latched. Cloning shares the
/// same underlying flag, so any clone can fire the abort.
#[derive(Clone)]
pub struct SignalController {
    inner: Arc<Inner>,
}

impl SignalController {
    pub fn signal(&self) -> Signal {
        Signal {
            inner: self.inner.clone(),
        }
    }

    /// Fires the signal. Idempotent: only the first call has any effect.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut waiters = self.inner.waiters.lock().unwrap();
        for waker in waiters.drain(..) {
            waker.wake();
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

/// Wires `outer` so that its abort also aborts `inner`, without leaking a
/// listener if the returned guard is dropped first. Leaking the forward
/// listener on every call would be a memory-leak bug, so the cleanup path
/// must detach it.
///
/// Returns a `ChildTask` whose drop detaches the forwarding; callers keep it
/// alive for exactly as long as the cascade should apply.
pub fn cascade(outer: Signal, inner: SignalController) -> executor::child_task::ChildTask {
    executor::child_task::ChildTask::spawn(async move {
        outer.wait().await;
        inner.abort();
    })
}
