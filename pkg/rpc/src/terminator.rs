use std::collections::HashMap;
use std::sync::Arc;

use common::errors::*;
use executor::sync::AsyncMutex;

use crate::context::CallContext;
use crate::middleware::{Call, Middleware, Next, Yielder};
use crate::signal::{cascade, Signal, SignalController};
use crate::status::{ServerError, Status};

struct Registry {
    next_id: u64,
    controllers: HashMap<u64, SignalController>,
    terminated: bool,
}

/// The drain coordinator: lets handlers opt into being forcibly aborted when
/// the server begins a graceful shutdown, so a long-lived stream doesn't
/// block `Server::shutdown()` forever.
///
/// Owned by the `Server`; `middleware()` produces the `Middleware` that
/// wires each call into it, and `terminate()` is invoked by
/// `Server::shutdown()`.
pub struct Terminator {
    registry: Arc<AsyncMutex<Registry>>,
}

impl Terminator {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(AsyncMutex::new(Registry {
                next_id: 0,
                controllers: HashMap::new(),
                terminated: false,
            })),
        }
    }

    pub fn middleware(&self) -> Arc<TerminatorMiddleware> {
        Arc::new(TerminatorMiddleware {
            registry: self.registry.clone(),
        })
    }

    /// Aborts every currently-registered call and marks the terminator as
    /// terminated, so any later registration aborts immediately instead.
    /// Idempotent: a second call aborts exactly the (now-empty) set left
    /// over from the first.
    pub async fn terminate(&self) {
        let controllers = self
            .registry
            .apply(|r| {
                if r.terminated {
                    return vec![];
                }
                r.terminated = true;
                r.controllers.drain().map(|(_, c)| c).collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

        for controller in controllers {
            controller.abort();
        }
    }
}

/// Extension slot a handler retrieves from its `CallContext` to opt into
/// the terminator, extending the context with `abortOnTerminate()`.
pub struct TerminateHandle {
    registry: Arc<AsyncMutex<Registry>>,
    id: u64,
    controller: SignalController,
}

impl TerminateHandle {
    /// Registers this call's inner signal with the terminator, unless
    /// `terminate()` has already run — in which case it aborts immediately.
    pub async fn abort_on_terminate(&self) {
        let already_terminated = self
            .registry
            .apply(|r| {
                if r.terminated {
                    true
                } else {
                    r.controllers.insert(self.id, self.controller.clone());
                    false
                }
            })
            .await
            .unwrap_or(true);

        if already_terminated {
            self.controller.abort();
        }
    }
}

/// Middleware that derives a per-call inner signal cascaded from the
/// outer one, exposes `TerminateHandle` via the context, and translates a
/// handler error that happened because of a forced termination into
/// `ServerError(UNAVAILABLE, "Server shutting down")`.
pub struct TerminatorMiddleware {
    registry: Arc<AsyncMutex<Registry>>,
}

#[async_trait]
impl Middleware for TerminatorMiddleware {
    async fn handle(&self, call: Call, context: CallContext, emit: &mut Yielder, next: Next) -> Result<()> {
        let outer_signal = context.signal.clone();
        let (inner_signal, inner_controller) = Signal::new();

        // Detached when this future (and therefore `_cascade_guard`) drops,
        // on every exit path.
        let _cascade_guard = cascade(outer_signal.clone(), inner_controller.clone());

        let id = self
            .registry
            .apply(|r| {
                r.next_id += 1;
                r.next_id
            })
            .await
            .unwrap_or(0);

        let handle = Arc::new(TerminateHandle {
            registry: self.registry.clone(),
            id,
            controller: inner_controller.clone(),
        });

        let child_context = context.clone().with_signal(inner_signal.clone());
        child_context.set_extension(handle);

        let inner = next.call(call, child_context);
        let result = emit.forward(inner).await;

        let _ = self
            .registry
            .apply(|r| {
                r.controllers.remove(&id);
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if inner_signal.aborted() && !outer_signal.aborted() {
                    Err(ServerError::new(Status::Unavailable, "Server shutting down").into())
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[testcase]
    async fn terminate_is_idempotent_and_aborts_registered_calls() {
        let terminator = Terminator::new();

        let (signal_a, controller_a) = Signal::new();
        let id_a = terminator
            .registry
            .apply(|r| {
                r.next_id += 1;
                r.next_id
            })
            .await
            .unwrap();
        let handle_a = TerminateHandle {
            registry: terminator.registry.clone(),
            id: id_a,
            controller: controller_a,
        };
        handle_a.abort_on_terminate().await;

        terminator.terminate().await;
        assert!(signal_a.aborted());

        // A second terminate() is a no-op: nothing left to abort, and it
        // must not panic or double-fire anything.
        terminator.terminate().await;

        // Registering after terminate() aborts immediately.
        let (signal_b, controller_b) = Signal::new();
        let handle_b = TerminateHandle {
            registry: terminator.registry.clone(),
            id: id_a + 1,
            controller: controller_b,
        };
        handle_b.abort_on_terminate().await;
        assert!(signal_b.aborted());
    }
}
