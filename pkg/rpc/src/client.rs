use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use common::errors::*;
use executor::child_task::ChildTask;
use executor::futures::map;

use crate::context::CallOptions;
use crate::method::{downcast, Message, MethodDescriptor};
use crate::metadata::Metadata;
use crate::signal::{cascade, Signal, SignalController};
use crate::status::{AbortError, ClientError, CodecError, Status};
use crate::stream::{BoxStream, Stream, TaskStream, VecStream};
use crate::transport::{ClientTransportCall, Transport};

/// A connection to a server, opened once per call.
///
/// Cloning a `Channel` is cheap and shares the same underlying `Transport`
/// and closed-state; closing any clone closes all of them, since a
/// `Channel` is reference-shared across calls.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn Transport>,
    closed: Signal,
    closed_controller: SignalController,
}

impl Channel {
    pub fn create(transport: Arc<dyn Transport>) -> Self {
        let (closed, closed_controller) = Signal::new();
        Self {
            transport,
            closed,
            closed_controller,
        }
    }

    /// Cancels every call still running on this channel with
    /// `ClientError(UNAVAILABLE)` and makes every future call on it fail
    /// immediately the same way. Idempotent.
    pub fn close(&self) {
        self.closed_controller.abort();
    }

    pub async fn unary<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<Res> {
        let requests: BoxStream<Box<dyn Message>> =
            Box::new(EraseStream::new(Box::new(VecStream::single(request))));
        let mut responses = self.start_call::<Res>(method, requests, options).await?;
        expect_single_response(&mut responses).await
    }

    pub async fn server_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<BoxStream<Res>> {
        let requests: BoxStream<Box<dyn Message>> =
            Box::new(EraseStream::new(Box::new(VecStream::single(request))));
        self.start_call::<Res>(method, requests, options).await
    }

    pub async fn client_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        requests: BoxStream<Req>,
        options: CallOptions,
    ) -> Result<Res> {
        let requests: BoxStream<Box<dyn Message>> = Box::new(EraseStream::new(requests));
        let mut responses = self.start_call::<Res>(method, requests, options).await?;
        expect_single_response(&mut responses).await
    }

    pub async fn bidi_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        requests: BoxStream<Req>,
        options: CallOptions,
    ) -> Result<BoxStream<Res>> {
        let requests: BoxStream<Box<dyn Message>> = Box::new(EraseStream::new(requests));
        self.start_call::<Res>(method, requests, options).await
    }

    /// Opens the transport call, wires up cancellation (external signal,
    /// deadline, channel close), and spawns the background task that drives
    /// it to completion.
    async fn start_call<Res: Message>(
        &self,
        method: &MethodDescriptor,
        requests: BoxStream<Box<dyn Message>>,
        options: CallOptions,
    ) -> Result<BoxStream<Res>> {
        let path = method.full_path();

        let (signal, controller) = Signal::new();
        let mut guards = vec![cascade(self.closed.clone(), controller.clone())];

        if let Some(external) = &options.signal {
            guards.push(cascade(external.clone(), controller.clone()));
        }

        if let Some(deadline) = options.deadline {
            let controller = controller.clone();
            guards.push(ChildTask::spawn(async move {
                if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                    let _ = executor::sleep(remaining).await;
                }
                controller.abort();
            }));
        }

        if self.closed.aborted() {
            return Err(ClientError {
                path,
                status: Status::Unavailable,
                details: "Channel is closed".to_string(),
                trailer: Metadata::new(),
            }
            .into());
        }

        // The `grpc-timeout` header is a reserved key (`Metadata::set` would
        // reject it); the transport encodes `deadline` onto the wire itself,
        // the same way it is the one to decode it back on the server side
        // via `Transport::open`'s `deadline` parameter.
        let call = match self.transport.open(&path, options.metadata, options.deadline).await {
            Ok(call) => Arc::from(call),
            Err(e) => {
                return Err(ClientError {
                    path,
                    status: Status::Unavailable,
                    details: e.to_string(),
                    trailer: Metadata::new(),
                }
                .into())
            }
        };

        let method = Arc::new(method.clone());
        let channel_closed = self.closed.clone();
        let on_header = options.on_header;
        let on_trailer = options.on_trailer;

        let (sender, receiver) = crate::stream::channel(1);
        let task = ChildTask::spawn(async move {
            let _guards = guards;
            let mut emit = crate::stream::Yielder::new(sender);
            let result = run_call(
                call,
                method,
                requests,
                path,
                signal,
                channel_closed,
                on_header,
                on_trailer,
                &mut emit,
            )
            .await;
            if let Err(e) = result {
                emit.emit_error(e).await;
            }
        });

        let responses: BoxStream<Box<dyn Message>> = Box::new(TaskStream::new(receiver, task));
        Ok(Box::new(DowncastStream::<Res>::new(responses)))
    }
}

/// A thin pairing of a `Channel` with metadata applied to every call made
/// through it, mirroring `createClient(descriptor, channel, defaultOptions)`.
/// A generated (or hand-written) per-service client builds its
/// method-specific wrappers on top of these four call kinds, merging in
/// whatever method-level options the caller passes.
#[derive(Clone)]
pub struct Client {
    pub channel: Channel,
    pub default_metadata: Metadata,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            default_metadata: Metadata::new(),
        }
    }

    pub fn with_default_metadata(mut self, metadata: Metadata) -> Self {
        self.default_metadata = metadata;
        self
    }

    /// Applies `default_metadata` under whatever the caller already set on
    /// `options.metadata` (the per-call entries win on key conflicts).
    fn merge_options(&self, mut options: CallOptions) -> CallOptions {
        let mut merged = self.default_metadata.clone();
        options.metadata.for_each(|k, vs| {
            let _ = merged.set_all(k.to_string(), vs.iter().cloned());
        });
        options.metadata = merged;
        options
    }

    pub async fn unary<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<Res> {
        self.channel.unary(method, request, self.merge_options(options)).await
    }

    pub async fn server_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<BoxStream<Res>> {
        self.channel
            .server_streaming(method, request, self.merge_options(options))
            .await
    }

    pub async fn client_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        requests: BoxStream<Req>,
        options: CallOptions,
    ) -> Result<Res> {
        self.channel
            .client_streaming(method, requests, self.merge_options(options))
            .await
    }

    pub async fn bidi_streaming<Req: Message, Res: Message>(
        &self,
        method: &MethodDescriptor,
        requests: BoxStream<Req>,
        options: CallOptions,
    ) -> Result<BoxStream<Res>> {
        self.channel
            .bidi_streaming(method, requests, self.merge_options(options))
            .await
    }
}

async fn expect_single_response<Res: Message>(responses: &mut BoxStream<Res>) -> Result<Res> {
    let first = match responses.next().await {
        Some(Ok(message)) => message,
        Some(Err(e)) => return Err(e),
        None => return Err(err_msg("Call completed without a response message")),
    };

    match responses.next().await {
        None => Ok(first),
        Some(Err(e)) => Err(e),
        Some(Ok(_)) => Err(err_msg("Unary call received more than one response message")),
    }
}

/// Erases a typed request sequence into the `Box<dyn Message>` shape the
/// driver moves over the wire, deferring the actual encode to the method's
/// registered codec (mirrors `RequestReader` on the server side).
struct EraseStream<T: Message> {
    inner: BoxStream<T>,
}

impl<T: Message> EraseStream<T> {
    fn new(inner: BoxStream<T>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: Message> Stream<Box<dyn Message>> for EraseStream<T> {
    async fn next(&mut self) -> Option<Result<Box<dyn Message>>> {
        match self.inner.next().await {
            Some(Ok(v)) => Some(Ok(Box::new(v))),
            Some(Err(e)) => Some(Err(e)),
            None => None,
        }
    }
}

/// Downcasts a decoded-but-still-erased response sequence back to its
/// concrete type, the mirror image of `EraseStream` on the way in.
struct DowncastStream<T> {
    inner: BoxStream<Box<dyn Message>>,
    _marker: PhantomData<T>,
}

impl<T: Message> DowncastStream<T> {
    fn new(inner: BoxStream<Box<dyn Message>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Message> Stream<T> for DowncastStream<T> {
    async fn next(&mut self) -> Option<Result<T>> {
        match self.inner.next().await {
            Some(Ok(msg)) => Some(downcast::<T>(msg)),
            Some(Err(e)) => Some(Err(e)),
            None => None,
        }
    }
}

async fn cancel_call(call: &Arc<dyn ClientTransportCall>) {
    call.cancel().await;
}

/// Drives one call to completion: writes the request sequence, invokes
/// `on_header` once headers arrive, emits every decoded response, and
/// resolves the terminal result from the trailer's status.
///
/// Both directions share one `Arc<dyn ClientTransportCall>` — `&self`
/// methods, per the transport contract, so the write side (below) and this
/// function's own read side can run concurrently without a lock.
async fn run_call<Res: Message>(
    call: Arc<dyn ClientTransportCall>,
    method: Arc<MethodDescriptor>,
    requests: BoxStream<Box<dyn Message>>,
    path: String,
    signal: Signal,
    channel_closed: Signal,
    on_header: Option<Box<dyn Fn(&Metadata) + Send + Sync>>,
    on_trailer: Option<Box<dyn Fn(&Metadata) + Send + Sync>>,
    emit: &mut crate::stream::Yielder<Box<dyn Message>>,
) -> Result<()> {
    let writer = spawn_writer(call.clone(), method.clone(), requests, signal.clone());

    enum HeaderEvent {
        Headers(Result<Metadata>),
        Aborted,
    }

    let header_event = race!(
        map(call.receive_initial_metadata(), HeaderEvent::Headers),
        map(signal.wait(), |_| HeaderEvent::Aborted),
    )
    .await;

    let headers = match header_event {
        HeaderEvent::Aborted => {
            cancel_call(&call).await;
            writer.cancel().await;
            return Err(abort_or_unavailable(&path, &channel_closed));
        }
        HeaderEvent::Headers(Ok(meta)) => meta,
        HeaderEvent::Headers(Err(e)) => {
            writer.cancel().await;
            return Err(e);
        }
    };

    if let Some(f) = &on_header {
        f(&headers);
    }

    enum RecvEvent {
        Message(Result<Option<Vec<u8>>>),
        Aborted,
    }

    loop {
        let event = race!(
            map(call.receive_message(), RecvEvent::Message),
            map(signal.wait(), |_| RecvEvent::Aborted),
        )
        .await;

        match event {
            RecvEvent::Aborted => {
                cancel_call(&call).await;
                writer.cancel().await;
                return Err(abort_or_unavailable(&path, &channel_closed));
            }
            RecvEvent::Message(Ok(Some(bytes))) => {
                let message = method
                    .response_codec
                    .decode(&bytes)
                    .map_err(|e| -> Error { CodecError::new(e.to_string()).into() })?;

                if !emit.emit(message).await {
                    cancel_call(&call).await;
                    writer.cancel().await;
                    return Ok(());
                }
            }
            RecvEvent::Message(Ok(None)) => break,
            RecvEvent::Message(Err(e)) => {
                writer.cancel().await;
                return Err(e);
            }
        }
    }

    let trailer_result = call.receive_trailer().await;
    let write_result = writer.join().await;

    // A failed trailer read (e.g. the transport side was torn down because
    // the writer cancelled it) is usually just a symptom of the write side
    // having already failed for a more specific reason; prefer that reason
    // over the generic transport error.
    let (trailer, status, details) = match trailer_result {
        Ok(v) => v,
        Err(transport_err) => {
            return Err(match write_result {
                Err(write_err) => write_err,
                Ok(()) => transport_err,
            });
        }
    };

    if let Some(f) = &on_trailer {
        f(&trailer);
    }

    if !status.is_ok() {
        return Err(ClientError {
            path,
            status,
            details,
            trailer,
        }
        .into());
    }

    write_result
}

fn abort_or_unavailable(path: &str, channel_closed: &Signal) -> Error {
    if channel_closed.aborted() {
        ClientError {
            path: path.to_string(),
            status: Status::Unavailable,
            details: "Channel is closed".to_string(),
            trailer: Metadata::new(),
        }
        .into()
    } else {
        AbortError.into()
    }
}

/// Spawns the task that encodes and sends every outgoing request, then
/// half-closes the write side. On a request-sequence error it cancels the
/// transport call instead and returns the error to be rethrown to the
/// consumer.
fn spawn_writer(
    call: Arc<dyn ClientTransportCall>,
    method: Arc<MethodDescriptor>,
    mut requests: BoxStream<Box<dyn Message>>,
    signal: Signal,
) -> ChildTask<Result<()>> {
    ChildTask::spawn(async move {
        enum Event {
            Next(Option<Result<Box<dyn Message>>>),
            Aborted,
        }

        loop {
            let event = race!(
                map(requests.next(), Event::Next),
                map(signal.wait(), |_| Event::Aborted),
            )
            .await;

            match event {
                Event::Aborted => {
                    call.cancel().await;
                    return Ok(());
                }
                Event::Next(Some(Ok(message))) => {
                    let bytes = method
                        .request_codec
                        .encode(message.as_ref())
                        .map_err(|e| -> Error { CodecError::new(e.to_string()).into() })?;
                    call.send_message(bytes).await?;
                }
                Event::Next(Some(Err(e))) => {
                    call.cancel().await;
                    return Err(e);
                }
                Event::Next(None) => {
                    call.half_close().await;
                    return Ok(());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{Codec, StreamingType};
    use crate::stream::EmptyStream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct EchoCodec;

    impl Codec<String> for EchoCodec {
        fn encode(&self, message: &String) -> Result<Vec<u8>> {
            Ok(message.clone().into_bytes())
        }

        fn decode(&self, data: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(data).to_string())
        }
    }

    fn method() -> MethodDescriptor {
        MethodDescriptor::new("test.Service", "Echo", StreamingType::Unary, EchoCodec, EchoCodec)
    }

    /// A loopback `ClientTransportCall` that echoes back exactly the first
    /// request it receives (later ones are accepted but not echoed, as a
    /// unary-shaped server would), used to exercise the driver without
    /// pulling in `rpc_util`'s real transport.
    struct FakeCall {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        responded: Mutex<bool>,
        half_closed: Mutex<bool>,
    }

    impl FakeCall {
        fn new() -> Self {
            Self {
                inbox: Mutex::new(VecDeque::new()),
                responded: Mutex::new(false),
                half_closed: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ClientTransportCall for FakeCall {
        async fn send_message(&self, data: Vec<u8>) -> Result<()> {
            let mut responded = self.responded.lock().unwrap();
            if !*responded {
                *responded = true;
                self.inbox.lock().unwrap().push_back(data);
            }
            Ok(())
        }

        async fn half_close(&self) {
            *self.half_closed.lock().unwrap() = true;
        }

        async fn receive_message(&self) -> Result<Option<Vec<u8>>> {
            loop {
                if let Some(v) = self.inbox.lock().unwrap().pop_front() {
                    return Ok(Some(v));
                }
                if *self.half_closed.lock().unwrap() {
                    return Ok(None);
                }
                let _ = executor::sleep(std::time::Duration::from_millis(1)).await;
            }
        }

        async fn receive_initial_metadata(&self) -> Result<Metadata> {
            Ok(Metadata::new())
        }

        async fn receive_trailer(&self) -> Result<(Metadata, Status, String)> {
            Ok((Metadata::new(), Status::Ok, String::new()))
        }

        async fn cancel(&self) {}
    }

    struct FakeTransport;

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(
            &self,
            _method_path: &str,
            _metadata: Metadata,
            _deadline: Option<Instant>,
        ) -> Result<Box<dyn ClientTransportCall>> {
            Ok(Box::new(FakeCall::new()))
        }
    }

    #[testcase]
    async fn unary_round_trips_through_loopback_call() {
        let channel = Channel::create(Arc::new(FakeTransport));
        let response: String = channel
            .unary(&method(), "hello".to_string(), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(response, "hello");
    }

    #[testcase]
    async fn on_header_fires_before_response_is_observed() {
        let seen_header = Arc::new(std::sync::Mutex::new(false));
        let seen_header2 = seen_header.clone();

        let channel = Channel::create(Arc::new(FakeTransport));
        let options = CallOptions::new().on_header(move |_| {
            *seen_header2.lock().unwrap() = true;
        });

        let response: String = channel.unary(&method(), "x".to_string(), options).await.unwrap();
        assert_eq!(response, "x");
        assert!(*seen_header.lock().unwrap());
    }

    #[testcase]
    async fn cancelling_before_headers_raises_abort_error() {
        let channel = Channel::create(Arc::new(FakeTransport));
        let (signal, controller) = Signal::new();
        controller.abort();

        let options = CallOptions::new().with_signal(signal);
        let result: Result<String> = channel.unary(&method(), "x".to_string(), options).await;
        assert!(result.is_err());
    }

    #[testcase]
    async fn closing_the_channel_fails_subsequent_calls_with_unavailable() {
        let channel = Channel::create(Arc::new(FakeTransport));
        channel.close();

        let result: Result<String> = channel.unary(&method(), "x".to_string(), CallOptions::new()).await;
        let err = result.unwrap_err();
        let client_error = err.downcast_ref::<ClientError>().unwrap();
        assert_eq!(client_error.status, Status::Unavailable);
    }

    #[testcase]
    async fn client_streaming_sends_every_request_before_completing() {
        let channel = Channel::create(Arc::new(FakeTransport));
        let requests: BoxStream<String> = Box::new(VecStream::new(vec!["a".to_string(), "b".to_string()]));

        // FakeCall only ever answers the *first* request with a response
        // (others are just queued for `receive_message`); client_streaming
        // only reads the first one back.
        let response: String = channel
            .client_streaming(&method(), requests, CallOptions::new())
            .await
            .unwrap();
        assert_eq!(response, "a");
    }

    #[testcase]
    async fn unary_over_empty_response_errors() {
        struct EmptyCall;

        #[async_trait]
        impl ClientTransportCall for EmptyCall {
            async fn send_message(&self, _data: Vec<u8>) -> Result<()> {
                Ok(())
            }
            async fn half_close(&self) {}
            async fn receive_message(&self) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn receive_initial_metadata(&self) -> Result<Metadata> {
                Ok(Metadata::new())
            }
            async fn receive_trailer(&self) -> Result<(Metadata, Status, String)> {
                Ok((Metadata::new(), Status::Ok, String::new()))
            }
            async fn cancel(&self) {}
        }

        struct EmptyTransport;

        #[async_trait]
        impl Transport for EmptyTransport {
            async fn open(
                &self,
                _method_path: &str,
                _metadata: Metadata,
                _deadline: Option<Instant>,
            ) -> Result<Box<dyn ClientTransportCall>> {
                Ok(Box::new(EmptyCall))
            }
        }

        let channel = Channel::create(Arc::new(EmptyTransport));
        let result: Result<String> = channel.unary(&method(), "x".to_string(), CallOptions::new()).await;
        assert!(result.is_err());
        let _ = EmptyStream::<String>::new();
    }
}
