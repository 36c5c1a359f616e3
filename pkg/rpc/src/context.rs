use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use common::errors::*;

use crate::metadata::Metadata;
use crate::signal::Signal;

/// Untyped per-call slots that middleware can use to pass data to handlers
/// (or to itself across `call.next` boundaries) without the chain needing to
/// know every middleware's concrete type.
#[derive(Default, Clone)]
struct Extensions {
    slots: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.slots.insert(TypeId::of::<T>(), Arc::new(value));
    }
}

/// Holds response-header metadata and whether it has already been handed to
/// the transport.
struct HeaderState {
    metadata: Metadata,
    sent: bool,
}

/// Per-call mutable record threaded through the middleware chain to the
/// handler.
///
/// Cloning a `CallContext` is cheap and shares the same header/trailer/
/// extension storage (they are append-only/idempotent, so sharing is safe);
/// `signal`, `peer`, and `metadata` may be swapped out per layer via the
/// `with_*` builders to let an outer middleware override what an inner one
/// sees.
#[derive(Clone)]
pub struct CallContext {
    /// Incoming request metadata. Logically frozen: this is a snapshot, not
    /// a handle into the transport's own copy.
    pub metadata: Arc<Metadata>,
    header: Arc<Mutex<HeaderState>>,
    trailer: Arc<Mutex<Metadata>>,
    pub signal: Signal,
    pub peer: String,
    extensions: Arc<Mutex<Extensions>>,
}

impl CallContext {
    pub fn new(metadata: Metadata, signal: Signal, peer: String) -> Self {
        let mut frozen_metadata = metadata;
        frozen_metadata.freeze();

        Self {
            metadata: Arc::new(frozen_metadata),
            header: Arc::new(Mutex::new(HeaderState {
                metadata: Metadata::new(),
                sent: false,
            })),
            trailer: Arc::new(Mutex::new(Metadata::new())),
            signal,
            peer,
            extensions: Arc::new(Mutex::new(Extensions::default())),
        }
    }

    /// Returns a copy of `self` with a different signal. Downstream
    /// middleware/handlers observe this signal instead of
    /// the original; cascading an outer abort into it is the caller's
    /// responsibility (see `signal::cascade`).
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        let mut frozen = metadata;
        frozen.freeze();
        self.metadata = Arc::new(frozen);
        self
    }

    /// Mutates the outgoing response header. Fails once the header has
    /// already been sent.
    pub fn set_header<K: Into<String>, V: Into<crate::metadata::MetadataValue>>(
        &self,
        key: K,
        value: V,
    ) -> Result<()> {
        let mut state = self.header.lock().unwrap();
        if state.sent {
            return Err(err_msg("Cannot mutate header: it has already been sent"));
        }
        state.metadata.set(key, value)
    }

    /// Idempotent: transitions the header from mutable to sent. Returns
    /// `true` if this call performed the transition, `false` if it was
    /// already sent.
    ///
    /// Headers are still only written to the transport by the dispatcher at
    /// the first-response-frame boundary (see `server.rs`); calling this
    /// early only freezes further mutation.
    pub fn send_header(&self) -> bool {
        let mut state = self.header.lock().unwrap();
        if state.sent {
            return false;
        }
        state.metadata.freeze();
        state.sent = true;
        true
    }

    pub fn is_header_sent(&self) -> bool {
        self.header.lock().unwrap().sent
    }

    pub fn header_snapshot(&self) -> Metadata {
        self.header.lock().unwrap().metadata.clone()
    }

    /// Mutates the outgoing response trailer. Unlike the header, this stays
    /// mutable until the call itself ends, including from inside a
    /// `ServerError` handler right before it is thrown.
    pub fn set_trailer<K: Into<String>, V: Into<crate::metadata::MetadataValue>>(
        &self,
        key: K,
        value: V,
    ) -> Result<()> {
        self.trailer.lock().unwrap().set(key, value)
    }

    pub fn trailer_snapshot(&self) -> Metadata {
        self.trailer.lock().unwrap().clone()
    }

    /// Appends a value to the outgoing trailer's `key`, preserving whatever
    /// is already there instead of replacing it (unlike `set_trailer`).
    pub fn append_trailer<K: Into<String>, V: Into<crate::metadata::MetadataValue>>(
        &self,
        key: K,
        value: V,
    ) -> Result<()> {
        self.trailer.lock().unwrap().append(key, value)
    }

    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.extensions.lock().unwrap().get::<T>()
    }

    pub fn set_extension<T: Send + Sync + 'static>(&self, value: T) {
        self.extensions.lock().unwrap().set(value);
    }
}

/// Client-side per-call options.
pub struct CallOptions {
    pub metadata: Metadata,
    pub on_header: Option<Box<dyn Fn(&Metadata) + Send + Sync>>,
    pub on_trailer: Option<Box<dyn Fn(&Metadata) + Send + Sync>>,
    pub signal: Option<Signal>,
    pub deadline: Option<Instant>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            metadata: Metadata::new(),
            on_header: None,
            on_trailer: None,
            signal: None,
            deadline: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn on_header<F: Fn(&Metadata) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_header = Some(Box::new(f));
        self
    }

    pub fn on_trailer<F: Fn(&Metadata) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_trailer = Some(Box::new(f));
        self
    }
}

/// Helper used by call drivers to invoke `on_header`/`on_trailer` exactly
/// once.
pub(crate) struct OnceCallback(AtomicBool);

impl OnceCallback {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` the first time this is called, `false` every time
    /// after.
    pub fn fire_once(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> CallContext {
        let (signal, _controller) = Signal::new();
        CallContext::new(Metadata::new(), signal, "127.0.0.1:1234".to_string())
    }

    #[test]
    fn send_header_is_idempotent() {
        let ctx = test_context();
        assert!(ctx.send_header());
        assert!(!ctx.send_header());
        assert!(ctx.is_header_sent());
    }

    #[test]
    fn set_header_fails_after_send() {
        let ctx = test_context();
        ctx.set_header("x", "1").unwrap();
        ctx.send_header();
        assert!(ctx.set_header("y", "2").is_err());
    }

    #[test]
    fn trailer_stays_mutable_after_header_sent() {
        let ctx = test_context();
        ctx.send_header();
        ctx.set_trailer("test", "v1").unwrap();
        ctx.set_trailer("test", "v1").unwrap();
        assert_eq!(
            ctx.trailer_snapshot().get("test").unwrap().as_str(),
            Some("v1")
        );
    }

    #[test]
    fn extensions_round_trip() {
        let ctx = test_context();
        assert!(ctx.get_extension::<u32>().is_none());
        ctx.set_extension(42u32);
        assert_eq!(*ctx.get_extension::<u32>().unwrap(), 42);
    }

    #[test]
    fn with_signal_overrides_without_mutating_original() {
        let ctx = test_context();
        let (new_signal, controller) = Signal::new();
        let overridden = ctx.clone().with_signal(new_signal);

        controller.abort();
        assert!(overridden.signal.aborted());
        assert!(!ctx.signal.aborted());
    }
}
