use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use common::errors::*;
use executor::child_task::ChildTask;
use executor::futures::map;
use executor::sync::AsyncMutex;

use crate::context::CallContext;
use crate::deadline;
use crate::method::{Message, MethodDescriptor, ServiceDescriptor};
use crate::middleware::{Call, Middleware, MiddlewareChain, Yielder};
use crate::signal::Signal;
use crate::status::{self, Status};
use crate::stream::{BoxStream, Stream, TaskStream};
use crate::terminator::Terminator;
use crate::transport::{ServerTransportCall, TransportListener};

/// A unary handler: exactly one request, exactly one response, mirroring
/// `server.add`'s `unary(request, context) → response`.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, request: Box<dyn Message>, context: CallContext) -> Result<Box<dyn Message>>;
}

/// A server-streaming handler: one request, a lazy sequence of responses.
#[async_trait]
pub trait ServerStreamHandler: Send + Sync {
    async fn call(&self, request: Box<dyn Message>, context: CallContext, emit: &mut Yielder) -> Result<()>;
}

/// A client-streaming handler: a lazy sequence of requests, one response.
#[async_trait]
pub trait ClientStreamHandler: Send + Sync {
    async fn call(&self, requests: BoxStream<Box<dyn Message>>, context: CallContext) -> Result<Box<dyn Message>>;
}

/// A bidi-streaming handler: a lazy sequence of requests, a lazy sequence of
/// responses.
#[async_trait]
pub trait BidiStreamHandler: Send + Sync {
    async fn call(
        &self,
        requests: BoxStream<Box<dyn Message>>,
        context: CallContext,
        emit: &mut Yielder,
    ) -> Result<()>;
}

/// The four handler shapes a method can be registered with.
enum Handler {
    Unary(Arc<dyn UnaryHandler>),
    ServerStream(Arc<dyn ServerStreamHandler>),
    ClientStream(Arc<dyn ClientStreamHandler>),
    BidiStream(Arc<dyn BidiStreamHandler>),
}

/// Reads exactly one item from a request sequence, erroring if it ends
/// early or yields an error before producing it (unary/serverStream's
/// `call.request` convention).
async fn read_single_request(mut request: BoxStream<Box<dyn Message>>) -> Result<Box<dyn Message>> {
    match request.next().await {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(e),
        None => Err(err_msg("Request stream ended without a message")),
    }
}

type NextFn = Arc<dyn Fn(Call, CallContext) -> BoxStream<Box<dyn Message>> + Send + Sync>;

/// Adapts one registered handler into the `NextFn` shape the middleware
/// chain composes around: runs the handler as a background task writing
/// into a channel-backed response `Stream`, mirroring
/// `middleware::run_middleware`: a wrapper handler adapter that exposes the
/// handler as an `AsyncSequence<Response>`.
fn adapt_handler(handler: Arc<Handler>) -> NextFn {
    Arc::new(move |call: Call, context: CallContext| -> BoxStream<Box<dyn Message>> {
        let handler = handler.clone();
        let (sender, receiver) = crate::stream::channel(1);

        let task = ChildTask::spawn(async move {
            let mut yielder = Yielder::new(sender);

            let result: Result<()> = async {
                match handler.as_ref() {
                    Handler::Unary(h) => {
                        let request = read_single_request(call.request).await?;
                        let response = h.call(request, context).await?;
                        yielder.emit(response).await;
                        Ok(())
                    }
                    Handler::ServerStream(h) => {
                        let request = read_single_request(call.request).await?;
                        h.call(request, context, &mut yielder).await
                    }
                    Handler::ClientStream(h) => {
                        let response = h.call(call.request, context).await?;
                        yielder.emit(response).await;
                        Ok(())
                    }
                    Handler::BidiStream(h) => h.call(call.request, context, &mut yielder).await,
                }
            }
            .await;

            if let Err(e) = result {
                yielder.emit_error(e).await;
            }
        });

        Box::new(TaskStream::new(receiver, task))
    })
}

/// Tracks in-flight calls so `shutdown()` can wait for them to drain, and
/// owns the (idempotent) "drained" notification fired once the last
/// in-flight call finishes after shutdown has been requested, the
/// `server.shutdown()` graceful drain.
struct CallTracker {
    in_flight: u64,
    shutting_down: bool,
    drained: Option<crate::signal::SignalController>,
}

/// Decrements the in-flight count on every exit path of a dispatched call,
/// including the middleware task being cancelled out from under it.
struct CallGuard {
    tracker: Arc<AsyncMutex<CallTracker>>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let tracker = self.tracker.clone();
        // `drop` cannot be async; hand the bookkeeping to a detached task.
        // Dropping the returned `JoinHandle` does not cancel it: only a
        // `ChildTask` does that (see `executor::child_task`).
        executor::spawn(async move {
            let drained = tracker
                .apply(|t| {
                    t.in_flight -= 1;
                    if t.shutting_down && t.in_flight == 0 {
                        t.drained.take()
                    } else {
                        None
                    }
                })
                .await
                .ok()
                .flatten();

            if let Some(controller) = drained {
                controller.abort();
            }
        });
    }
}

/// The server-side call dispatcher. Registers handlers per method,
/// wraps every call in the registered middleware chain, and bridges the
/// chain's lazy response sequence to a `ServerTransportCall`.
///
/// A `TerminatorMiddleware` is installed as the innermost-registered (hence
/// outermost-running, per the composition law) middleware automatically, so
/// every handler can call `context.get_extension::<TerminateHandle>()`
/// without the caller having to wire up the terminator by hand.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

fn default_error_hook() -> ErrorHook {
    Arc::new(|e| eprintln!("rpc: unhandled handler error: {}", e))
}

pub struct Server {
    handlers: HashMap<String, (Arc<MethodDescriptor>, Arc<Handler>)>,
    chain: MiddlewareChain,
    terminator: Terminator,
    calls: Arc<AsyncMutex<CallTracker>>,
    force_shutdown: Arc<AtomicBool>,
    error_hook: ErrorHook,
}

impl Server {
    pub fn new() -> Self {
        let terminator = Terminator::new();
        let mut chain = MiddlewareChain::new();
        chain.push(terminator.middleware());

        Self {
            handlers: HashMap::new(),
            chain,
            terminator,
            calls: Arc::new(AsyncMutex::new(CallTracker {
                in_flight: 0,
                shutting_down: false,
                drained: None,
            })),
            force_shutdown: Arc::new(AtomicBool::new(false)),
            error_hook: default_error_hook(),
        }
    }

    /// Overrides the hook invoked with the full (unsanitized) error whenever
    /// a handler fails with anything other than a `ServerError` — the full
    /// error is surfaced to a local error hook only. The default hook prints
    /// a one-line message to stderr, the
    /// same way the rest of this workspace's servers log (`pkg/http/src/server.rs`).
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(&mut self, hook: F) -> &mut Self {
        self.error_hook = Arc::new(hook);
        self
    }

    /// Appends a middleware to the chain. Earlier calls are outermost:
    /// `server.use_middleware(m1).use_middleware(m2)` applied to handler
    /// `h` yields `m1(·, ctx → m2(·, ctx → h(·, ctx)))`.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.chain.push(middleware);
        self
    }

    fn register(&mut self, method: MethodDescriptor, handler: Handler) -> &mut Self {
        self.handlers
            .insert(method.full_path(), (Arc::new(method), Arc::new(handler)));
        self
    }

    pub fn add_unary<H: UnaryHandler + 'static>(&mut self, method: MethodDescriptor, handler: H) -> &mut Self {
        self.register(method, Handler::Unary(Arc::new(handler)))
    }

    pub fn add_server_stream<H: ServerStreamHandler + 'static>(
        &mut self,
        method: MethodDescriptor,
        handler: H,
    ) -> &mut Self {
        self.register(method, Handler::ServerStream(Arc::new(handler)))
    }

    pub fn add_client_stream<H: ClientStreamHandler + 'static>(
        &mut self,
        method: MethodDescriptor,
        handler: H,
    ) -> &mut Self {
        self.register(method, Handler::ClientStream(Arc::new(handler)))
    }

    pub fn add_bidi_stream<H: BidiStreamHandler + 'static>(
        &mut self,
        method: MethodDescriptor,
        handler: H,
    ) -> &mut Self {
        self.register(method, Handler::BidiStream(Arc::new(handler)))
    }

    /// The methods declared by a service descriptor, for callers that want
    /// to assert every one of them got registered.
    pub fn service_methods<'a>(&self, service: &'a ServiceDescriptor) -> &'a [MethodDescriptor] {
        &service.methods
    }

    /// Binds `listener` and serves calls from it until the listener itself
    /// ends (e.g. its connection was closed) or `force_shutdown()` was
    /// called. Binding the address itself is the `TransportListener`'s job,
    /// consumed here as a black box.
    pub async fn serve(&self, mut listener: Box<dyn TransportListener>) -> Result<()> {
        loop {
            if self.force_shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let call = match listener.accept().await {
                Some(call) => call,
                None => return Ok(()),
            };

            let entry = self.handlers.get(call.method_path()).cloned();

            let shutting_down = self
                .calls
                .apply(|t| {
                    if t.shutting_down {
                        true
                    } else {
                        t.in_flight += 1;
                        false
                    }
                })
                .await?;

            if shutting_down {
                reject_shutting_down(call).await;
                continue;
            }

            let guard = CallGuard {
                tracker: self.calls.clone(),
            };

            let chain = self.chain.clone();
            let force_shutdown = self.force_shutdown.clone();
            let error_hook = self.error_hook.clone();

            // Fire-and-forget: a `ChildTask` would cancel the call the
            // instant this loop iteration drops its handle, since
            // `serve()`'s own lifetime has nothing to do with any one
            // call's. Plain `executor::spawn` runs to completion
            // independently, exactly like `CallGuard::drop`'s cleanup task
            // below.
            match entry {
                Some((method, handler)) => {
                    let next = adapt_handler(handler);
                    executor::spawn(async move {
                        let _guard = guard;
                        if force_shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        dispatch_call(call, method, chain, next, error_hook).await;
                    });
                }
                None => {
                    executor::spawn(async move {
                        let _guard = guard;
                        reject_unimplemented(call).await;
                    });
                }
            }
        }
    }

    /// Performs a graceful drain: stops accepting new calls, aborts every
    /// call registered via `abortOnTerminate()`, and waits for all
    /// currently in-flight calls to finish. Idempotent: calling this twice
    /// is indistinguishable from calling it once.
    pub async fn shutdown(&self) {
        let wait_signal = self
            .calls
            .apply(|t| {
                if t.shutting_down {
                    return None;
                }
                t.shutting_down = true;
                if t.in_flight == 0 {
                    None
                } else {
                    let (signal, controller) = Signal::new();
                    t.drained = Some(controller);
                    Some(signal)
                }
            })
            .await
            .unwrap_or(None);

        self.terminator.terminate().await;

        if let Some(signal) = wait_signal {
            signal.wait().await;
        }
    }

    /// Aborts every in-flight call immediately instead of draining them.
    pub async fn force_shutdown(&self) {
        self.force_shutdown.store(true, Ordering::SeqCst);
        self.terminator.terminate().await;
    }
}

async fn reject_shutting_down(call: Box<dyn ServerTransportCall>) {
    let _ = call
        .send_trailer(
            crate::metadata::Metadata::new(),
            Status::Unavailable,
            "Server shutting down".to_string(),
        )
        .await;
}

async fn reject_unimplemented(call: Box<dyn ServerTransportCall>) {
    let path = call.method_path().to_string();
    let _ = call
        .send_trailer(
            crate::metadata::Metadata::new(),
            Status::Unimplemented,
            format!("Method not implemented: {}", path),
        )
        .await;
}

enum DispatchEvent {
    Response(Option<Result<Box<dyn Message>>>),
    PeerCancelled,
}

/// The per-call dispatch algorithm, abstracted over call kind (the kind
/// difference is already folded into `next` by `adapt_handler`).
async fn dispatch_call(
    call: Box<dyn ServerTransportCall>,
    method: Arc<MethodDescriptor>,
    chain: MiddlewareChain,
    next: NextFn,
    error_hook: ErrorHook,
) {
    let call: Arc<dyn ServerTransportCall> = Arc::from(call);
    let metadata = call.metadata().clone();
    let peer = call.peer();

    let deadline_at = metadata
        .get(deadline::HEADER_NAME)
        .and_then(|v| v.as_str())
        .and_then(|v| deadline::decode_absolute(v, Instant::now()).ok());

    let (signal, controller) = Signal::new();

    // Arms `signal` when the deadline elapses. Detached when this call ends
    // (dropping a `ChildTask` cancels it): the grpc-timeout header decodes
    // to an absolute deadline, and an internal timer arms the signal.
    let _deadline_guard = deadline_at.map(|at| {
        let controller = controller.clone();
        ChildTask::spawn(async move {
            if let Some(remaining) = at.checked_duration_since(Instant::now()) {
                let _ = executor::sleep(remaining).await;
            }
            controller.abort();
        })
    });

    let context = CallContext::new(metadata, signal.clone(), peer);

    let request_stream = RequestReader {
        call: call.clone(),
        codec: method.request_codec.clone(),
    };

    let call_bundle = Call {
        method: method.clone(),
        request: Box::new(request_stream),
    };

    let mut responses = chain.run(next, call_bundle, context.clone());

    let mut header_sent = false;
    let mut peer_cancelled = false;
    let mut final_result: Result<()> = Ok(());

    // Drives responses and peer cancellation concurrently until the
    // response sequence reaches its terminal value (Ok(()) or Err) or the
    // peer tears the call down first.
    loop {
        let event = race!(
            map(responses.next(), DispatchEvent::Response),
            map(call.wait_for_peer_cancellation(), |_| DispatchEvent::PeerCancelled),
        )
        .await;

        match event {
            DispatchEvent::PeerCancelled => {
                peer_cancelled = true;
                controller.abort();
                break;
            }
            DispatchEvent::Response(Some(Ok(message))) => {
                if !header_sent {
                    if let Err(e) = send_initial_header(&call, &context).await {
                        final_result = Err(e);
                        break;
                    }
                    header_sent = true;
                }

                let bytes = match method.response_codec.encode(message.as_ref()) {
                    Ok(b) => b,
                    Err(e) => {
                        final_result = Err(status::CodecError::new(e.to_string()).into());
                        break;
                    }
                };

                if let Err(e) = call.send_message(bytes).await {
                    final_result = Err(e);
                    break;
                }
            }
            DispatchEvent::Response(Some(Err(e))) => {
                final_result = Err(e);
                break;
            }
            DispatchEvent::Response(None) => {
                final_result = Ok(());
                break;
            }
        }
    }

    if peer_cancelled {
        return;
    }

    if !header_sent {
        let _ = send_initial_header(&call, &context).await;
    }

    send_terminal_trailer(&call, &context, final_result, &error_hook).await;
}

async fn send_initial_header(call: &Arc<dyn ServerTransportCall>, context: &CallContext) -> Result<()> {
    context.send_header();
    call.send_initial_metadata(context.header_snapshot()).await
}

async fn send_terminal_trailer(
    call: &Arc<dyn ServerTransportCall>,
    context: &CallContext,
    result: Result<()>,
    error_hook: &ErrorHook,
) {
    let trailer = context.trailer_snapshot();

    match result {
        Ok(()) => {
            let _ = call.send_trailer(trailer, Status::Ok, String::new()).await;
        }
        Err(e) => {
            if let Some(server_error) = status::as_server_error(&e) {
                let _ = call
                    .send_trailer(trailer, server_error.status, server_error.details.clone())
                    .await;
            } else if e.downcast_ref::<status::CodecError>().is_some() {
                error_hook(&e);
                let _ = call.send_trailer(trailer, Status::Internal, "Internal error".to_string()).await;
            } else {
                error_hook(&e);
                let _ = call.send_trailer(trailer, Status::Unknown, "Internal error".to_string()).await;
            }
        }
    }
}

/// Reads raw request frames off the transport and decodes each one through
/// the method's registered codec, so `call.request` inside the middleware
/// chain and handler always yields the concrete message type, never raw
/// bytes. A decode failure maps to a server-side trailer of INTERNAL.
struct RequestReader {
    call: Arc<dyn ServerTransportCall>,
    codec: Arc<dyn crate::method::ErasedCodec>,
}

#[async_trait]
impl Stream<Box<dyn Message>> for RequestReader {
    async fn next(&mut self) -> Option<Result<Box<dyn Message>>> {
        match self.call.receive_message().await {
            Ok(Some(bytes)) => Some(
                self.codec
                    .decode(&bytes)
                    .map_err(|e| status::CodecError::new(e.to_string()).into()),
            ),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
