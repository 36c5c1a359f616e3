use std::time::Instant;

use common::errors::*;
use rpc::context::CallContext;
use rpc::middleware::{Call, Middleware, Next, Yielder};

/// Logs one line per call to stdout: the method path on entry, and the
/// elapsed time plus outcome on exit.
///
/// Grounded on the bare `println!`-based request logging this workspace's
/// own servers use (`pkg/http/src/server.rs`) rather than a structured
/// logging façade — there is no `log`/`tracing` dependency anywhere in this
/// corpus outside of the embedded `pkg/logging` device ring-buffer.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, call: Call, context: CallContext, emit: &mut Yielder, next: Next) -> Result<()> {
        let path = call.method.full_path();
        println!("rpc: {} start", path);
        let started = Instant::now();

        let inner = next.call(call, context);
        let result = emit.forward(inner).await;

        match &result {
            Ok(()) => println!("rpc: {} ok ({:?})", path, started.elapsed()),
            Err(e) => println!("rpc: {} error ({:?}): {}", path, started.elapsed(), e),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::method::{downcast, Codec, Message, MethodDescriptor, StreamingType};
    use rpc::middleware::MiddlewareChain;
    use rpc::signal::Signal;
    use rpc::stream::VecStream;
    use std::sync::Arc;

    struct EchoCodec;

    impl Codec<String> for EchoCodec {
        fn encode(&self, message: &String) -> Result<Vec<u8>> {
            Ok(message.clone().into_bytes())
        }

        fn decode(&self, data: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(data).to_string())
        }
    }

    #[testcase]
    async fn passes_responses_through_unchanged() {
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(LoggingMiddleware));

        let handler: Arc<dyn Fn(Call, CallContext) -> rpc::stream::BoxStream<Box<dyn Message>> + Send + Sync> =
            Arc::new(|_call, _context| Box::new(VecStream::single(Box::new(5u32) as Box<dyn Message>)));

        let method = Arc::new(MethodDescriptor::new(
            "test.Service",
            "Echo",
            StreamingType::Unary,
            EchoCodec,
            EchoCodec,
        ));

        let (signal, _controller) = Signal::new();
        let context = CallContext::new(rpc::metadata::Metadata::new(), signal, "peer".to_string());

        let call = Call {
            method,
            request: Box::new(VecStream::<Box<dyn Message>>::new(vec![])),
        };

        let mut responses = chain.run(handler, call, context);
        let value: u32 = downcast(responses.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(value, 5);
        assert!(responses.next().await.is_none());
    }
}
