use core::any::Any;
use std::sync::Arc;

use common::errors::*;

/// Type-erasure helper mirroring the `AsAny` pattern used elsewhere in this
/// workspace for boxed trait objects that need an escape hatch back to a
/// concrete type (see `pkg/http/src/body.rs`'s `Box<dyn Body>`).
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Blanket-implemented marker for request/response payload types that can
/// flow through a generic `Middleware` chain.
///
/// Concrete `Req`/`Res` types differ per method, so the chain itself only
/// ever holds `Box<dyn Message>` and downcasts at the two points that
/// actually know the concrete type: the handler the method was registered
/// with, and the caller of `Channel::unary`/`::client_streaming`/etc.
pub trait Message: AsAny + Send + 'static {}

impl<T: AsAny + Send + 'static> Message for T {}

/// Downcasts a type-erased message, returning a descriptive error instead of
/// panicking if a middleware or codec handed back the wrong concrete type.
pub fn downcast<T: 'static>(message: Box<dyn Message>) -> Result<T> {
    let any: Box<dyn Any> = AsAny::into_any(message);
    any.downcast::<T>()
        .map(|b| *b)
        .map_err(|_| err_msg("Message did not downcast to the expected type"))
}

/// Whether a method's request and/or response sides are a single message or
/// an open-ended sequence of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingType {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl StreamingType {
    pub fn request_is_stream(&self) -> bool {
        matches!(self, StreamingType::ClientStreaming | StreamingType::BidiStreaming)
    }

    pub fn response_is_stream(&self) -> bool {
        matches!(self, StreamingType::ServerStreaming | StreamingType::BidiStreaming)
    }
}

/// Encodes/decodes a single logical message to/from the bytes the transport
/// moves on the wire. Deliberately not tied to any one wire format — concrete
/// serialization is left out of scope, so callers plug in their own
/// (protobuf, JSON, ...).
pub trait Codec<M>: Send + Sync + 'static {
    fn encode(&self, message: &M) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<M>;
}

/// A `Codec<M>` with the concrete `M` erased, used both ways: the server
/// dispatcher decodes inbound requests and encodes outbound responses; the
/// client driver does the opposite, encoding requests and decoding
/// responses, mirroring a service descriptor's `requestCodec`/
/// `responseCodec`. Neither side needs to know `M` at
/// compile time — a `MethodDescriptor` carries the erased codec, and only
/// the two ends that do know `M` (the registered handler, the calling
/// client code) ever downcast.
pub trait ErasedCodec: Send + Sync {
    fn encode(&self, message: &dyn Message) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Box<dyn Message>>;
}

/// Adapts a concrete `Codec<M>` to the erased trait the dispatcher/driver
/// use.
pub struct ErasedCodecAdapter<M, C> {
    codec: C,
    _marker: core::marker::PhantomData<fn() -> M>,
}

impl<M, C> ErasedCodecAdapter<M, C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            _marker: core::marker::PhantomData,
        }
    }
}

impl<M: Message, C: Codec<M>> ErasedCodec for ErasedCodecAdapter<M, C> {
    fn encode(&self, message: &dyn Message) -> Result<Vec<u8>> {
        let concrete = message
            .as_any()
            .downcast_ref::<M>()
            .ok_or_else(|| err_msg("Message did not match the method's registered codec type"))?;
        self.codec.encode(concrete)
    }

    fn decode(&self, data: &[u8]) -> Result<Box<dyn Message>> {
        Ok(Box::new(self.codec.decode(data)?))
    }
}

/// Identifies one RPC method within a service, e.g. `/greet.Greeter/SayHello`.
///
/// Carries the method's request/response codecs in erased form so the
/// server dispatcher can decode/encode wire bytes purely from the method
/// path, without any per-method generated glue.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub service_name: String,
    pub method_name: String,
    pub streaming_type: StreamingType,
    pub request_codec: Arc<dyn ErasedCodec>,
    pub response_codec: Arc<dyn ErasedCodec>,
}

impl core::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("streaming_type", &self.streaming_type)
            .finish()
    }
}

impl MethodDescriptor {
    pub fn new<S: Into<String>, N: Into<String>, Req: Message, ReqC: Codec<Req>, Res: Message, ResC: Codec<Res>>(
        service_name: S,
        method_name: N,
        streaming_type: StreamingType,
        request_codec: ReqC,
        response_codec: ResC,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            streaming_type,
            request_codec: Arc::new(ErasedCodecAdapter::<Req, ReqC>::new(request_codec)),
            response_codec: Arc::new(ErasedCodecAdapter::<Res, ResC>::new(response_codec)),
        }
    }

    /// The full path used to route a call, e.g. `/greet.Greeter/SayHello`.
    pub fn full_path(&self) -> String {
        format!("/{}/{}", self.service_name, self.method_name)
    }
}

/// A named group of methods, registered together on a `Server`.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            methods: vec![],
        }
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCodec;

    impl Codec<String> for EchoCodec {
        fn encode(&self, message: &String) -> Result<Vec<u8>> {
            Ok(message.clone().into_bytes())
        }

        fn decode(&self, data: &[u8]) -> Result<String> {
            String::from_utf8(data.to_vec()).map_err(|e| format_err!("{}", e))
        }
    }

    #[test]
    fn full_path_formats_correctly() {
        let m = MethodDescriptor::new(
            "greet.Greeter",
            "SayHello",
            StreamingType::Unary,
            EchoCodec,
            EchoCodec,
        );
        assert_eq!(m.full_path(), "/greet.Greeter/SayHello");
    }

    #[test]
    fn erased_codec_round_trips_through_dyn_message() {
        let erased = ErasedCodecAdapter::<String, EchoCodec>::new(EchoCodec);
        let decoded: Box<dyn Message> = ErasedCodec::decode(&erased, b"hi").unwrap();
        let encoded = ErasedCodec::encode(&erased, decoded.as_ref()).unwrap();
        assert_eq!(encoded, b"hi");
    }

    #[test]
    fn erased_codec_rejects_mismatched_message_type() {
        let erased = ErasedCodecAdapter::<String, EchoCodec>::new(EchoCodec);
        let wrong: Box<dyn Message> = Box::new(5u32);
        assert!(ErasedCodec::encode(&erased, wrong.as_ref()).is_err());
    }

    #[test]
    fn streaming_type_classifies_request_and_response_sides() {
        assert!(!StreamingType::Unary.request_is_stream());
        assert!(!StreamingType::Unary.response_is_stream());
        assert!(StreamingType::ClientStreaming.request_is_stream());
        assert!(!StreamingType::ClientStreaming.response_is_stream());
        assert!(!StreamingType::ServerStreaming.request_is_stream());
        assert!(StreamingType::ServerStreaming.response_is_stream());
        assert!(StreamingType::BidiStreaming.request_is_stream());
        assert!(StreamingType::BidiStreaming.response_is_stream());
    }

    #[test]
    fn codec_round_trips() {
        let codec = EchoCodec;
        let encoded = codec.encode(&"hello".to_string()).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn downcast_rejects_wrong_type() {
        let message: Box<dyn Message> = Box::new(5u32);
        let result: Result<String> = downcast(message);
        assert!(result.is_err());
    }

    #[test]
    fn downcast_accepts_matching_type() {
        let message: Box<dyn Message> = Box::new("hi".to_string());
        let result: Result<String> = downcast(message);
        assert_eq!(result.unwrap(), "hi");
    }
}
