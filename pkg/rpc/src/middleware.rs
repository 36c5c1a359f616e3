use std::sync::Arc;

use common::errors::*;
use executor::child_task::ChildTask;

use crate::context::CallContext;
use crate::method::{Message, MethodDescriptor};
use crate::stream::{BoxStream, Stream, TaskStream};

/// One call as seen by a `Middleware`: the method being invoked and the
/// (possibly already-transformed) request sequence.
///
/// For unary/server-streaming methods `request` yields exactly one item; for
/// client-streaming/bidi-streaming methods it may yield any number.
pub struct Call {
    pub method: Arc<MethodDescriptor>,
    pub request: BoxStream<Box<dyn Message>>,
}

/// A handle to the `sender` half of this middleware invocation's own output
/// sequence. A middleware yields zero or more responses before delegating
/// and zero or more after, though in practice both are rare.
pub type Yielder = crate::stream::Yielder<Box<dyn Message>>;

/// Type-erased handle to "the next middleware or the handler itself",
/// mirroring `call.next(request, contextOverride)`.
type NextFn = Arc<dyn Fn(Call, CallContext) -> BoxStream<Box<dyn Message>> + Send + Sync>;

pub struct Next(NextFn);

impl Next {
    /// Invokes the next layer with (possibly overridden) `call`/`context`,
    /// returning its lazy response sequence.
    pub fn call(&self, call: Call, context: CallContext) -> BoxStream<Box<dyn Message>> {
        (self.0)(call, context)
    }
}

/// A polymorphic operation over `{observe call start, transform requests,
/// transform responses, observe completion, replace context}`.
///
/// Implementations are plain `async fn`s: code before the first `next.call`
/// is the "pre-delegation" phase, code after is "post-delegation"; ordinary
/// Rust scoping (a guard value with a `Drop` impl, or code after the loop)
/// gives `finally`-style cleanup on every exit path including an early
/// `break` out of `Yielder::forward`'s loop.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, call: Call, context: CallContext, emit: &mut Yielder, next: Next) -> Result<()>;
}

/// Runs one middleware layer as a lazy response sequence: spawns
/// `middleware.handle` as a background task writing into a channel, and
/// returns the receiving half as a `Stream`. Dropping the returned stream
/// before it completes cancels the task (and, transitively, whatever it was
/// awaiting) — this is how an early consumer stop propagates into an abort
/// of everything downstream: a consumer that stops iterating early causes
/// the driver to cancel.
pub fn run_middleware(
    middleware: Arc<dyn Middleware>,
    call: Call,
    context: CallContext,
    next: NextFn,
) -> BoxStream<Box<dyn Message>> {
    let (sender, receiver) = crate::stream::channel(1);

    let task = ChildTask::spawn(async move {
        let mut yielder = Yielder::new(sender);
        let result = middleware.handle(call, context, &mut yielder, Next(next)).await;
        if let Err(e) = result {
            yielder.emit_error(e).await;
        }
    });

    Box::new(TaskStream::new(receiver, task))
}

/// An ordered composition of middlewares, outer-to-inner: `server.use(m1).
/// use(m2)` applied to handler `h` yields `m1(·, ctx → m2(·, ctx → h(·,
/// ctx)))`; the first `use` is outermost.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Wraps `handler` (the innermost terminal, typically the user's RPC
    /// handler already adapted into a `NextFn`-shaped closure) with every
    /// middleware in the chain, outermost first.
    pub(crate) fn compose(&self, handler: NextFn) -> NextFn {
        let mut next = handler;
        for middleware in self.middlewares.iter().rev() {
            let middleware = middleware.clone();
            let inner = next.clone();
            next = Arc::new(move |call, context| {
                run_middleware(middleware.clone(), call, context, inner.clone())
            });
        }
        next
    }

    /// Drives a call through the full chain ending in `handler`.
    pub fn run(
        &self,
        handler: NextFn,
        call: Call,
        context: CallContext,
    ) -> BoxStream<Box<dyn Message>> {
        let composed = self.compose(handler);
        composed(call, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{downcast, StreamingType};
    use crate::signal::Signal;
    use crate::stream::VecStream;
    use std::sync::Mutex;

    struct LoggingMiddleware {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for LoggingMiddleware {
        async fn handle(
            &self,
            call: Call,
            context: CallContext,
            emit: &mut Yielder,
            next: Next,
        ) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}-start", self.name));
            self.log.lock().unwrap().push(format!("{}-request", self.name));

            let inner = next.call(call, context);
            emit.forward(inner).await?;

            self.log.lock().unwrap().push(format!("{}-response", self.name));
            Ok(())
        }
    }

    struct EchoCodec;

    impl crate::method::Codec<String> for EchoCodec {
        fn encode(&self, message: &String) -> Result<Vec<u8>> {
            Ok(message.clone().into_bytes())
        }

        fn decode(&self, data: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(data).to_string())
        }
    }

    // The codecs are never exercised by these tests (the chain is driven
    // directly with already-typed `Box<dyn Message>`s); `String` is just a
    // concrete placeholder to satisfy `MethodDescriptor::new`'s signature.
    fn method() -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor::new::<_, _, String, EchoCodec, String, EchoCodec>(
            "test.Service",
            "Echo",
            StreamingType::Unary,
            EchoCodec,
            EchoCodec,
        ))
    }

    fn context() -> CallContext {
        let (signal, _controller) = Signal::new();
        CallContext::new(crate::metadata::Metadata::new(), signal, "peer".to_string())
    }

    #[testcase]
    async fn chain_preserves_nesting_order() {
        let log = Arc::new(Mutex::new(vec![]));

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(LoggingMiddleware {
            name: "m1",
            log: log.clone(),
        }));
        chain.push(Arc::new(LoggingMiddleware {
            name: "m2",
            log: log.clone(),
        }));

        let log2 = log.clone();
        let handler: NextFn = Arc::new(move |call, _context| {
            log2.lock().unwrap().push("request".to_string());
            drop(call.request);
            Box::new(VecStream::single(Box::new(5u32) as Box<dyn Message>))
        });

        let call = Call {
            method: method(),
            request: Box::new(VecStream::single(
                Box::new("test".to_string()) as Box<dyn Message>
            )),
        };

        let mut responses = chain.run(handler, call, context());
        let first = responses.next().await.unwrap().unwrap();
        let value: u32 = downcast(first).unwrap();
        assert_eq!(value, 5);
        assert!(responses.next().await.is_none());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "m1-start",
                "m1-request",
                "m2-start",
                "m2-request",
                "request",
                "m2-response",
                "m1-response",
            ]
        );
    }

    #[testcase]
    async fn error_from_handler_propagates_through_chain() {
        let mut chain = MiddlewareChain::new();
        let log = Arc::new(Mutex::new(vec![]));
        chain.push(Arc::new(LoggingMiddleware {
            name: "m1",
            log: log.clone(),
        }));

        let handler: NextFn = Arc::new(|_call, _context| {
            Box::new(crate::stream::ErrorStream::<Box<dyn Message>>::new(err_msg(
                "boom",
            )))
        });

        let call = Call {
            method: method(),
            request: Box::new(VecStream::<Box<dyn Message>>::new(vec![])),
        };

        let mut responses = chain.run(handler, call, context());
        assert!(responses.next().await.unwrap().is_err());
    }
}
