use std::time::Instant;

use common::errors::*;

use crate::metadata::Metadata;
use crate::status::Status;

/// One inbound call as handed to the server dispatcher, black-boxing
/// whatever HTTP/2-and-below machinery produced it.
///
/// `&self`, not `&mut self`: the dispatcher reads requests, writes responses,
/// and watches for peer cancellation concurrently from different tasks
/// racing against each other, the same
/// way a real HTTP/2 stream's header/data/trailer frames and RST_STREAM
/// notification are independent directions on one connection. A concrete
/// transport is free to synchronize internally (e.g. one lock per
/// direction); this trait only promises that calls on different directions
/// don't have to wait on each other.
#[async_trait]
pub trait ServerTransportCall: Send + Sync {
    /// The canonical `/package.Service/Method` path the peer dialed.
    fn method_path(&self) -> &str;

    fn metadata(&self) -> &Metadata;

    fn peer(&self) -> String;

    /// Reads the next request message's raw bytes. `Ok(None)` means the peer
    /// half-closed (no more requests); an `Err` means the peer vanished or
    /// violated the protocol.
    async fn receive_message(&self) -> Result<Option<Vec<u8>>>;

    async fn send_initial_metadata(&self, metadata: Metadata) -> Result<()>;

    async fn send_message(&self, data: Vec<u8>) -> Result<()>;

    /// Always the last thing sent on a call that got far enough to send
    /// headers; never called for a call the peer cancelled out from under:
    /// on abort of signal with an underlying peer cancellation, no trailer
    /// is emitted.
    async fn send_trailer(&self, metadata: Metadata, status: Status, details: String) -> Result<()>;

    /// Fires if the peer tears down the call (RST_STREAM) before the server
    /// finishes. The dispatcher races this against handler progress to drive
    /// `CallContext::signal`.
    async fn wait_for_peer_cancellation(&self);
}

/// Accepts inbound calls for one bound address.
#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> Option<Box<dyn ServerTransportCall>>;

    fn local_address(&self) -> String;
}

/// One outbound call as opened by the client driver.
///
/// `&self`, not `&mut self`, for the same reason as `ServerTransportCall`:
/// the client driver writes the request sequence and reads the response
/// sequence concurrently (most visibly for bidi-streaming calls), each
/// racing against the call's own cancellation signal.
#[async_trait]
pub trait ClientTransportCall: Send + Sync {
    async fn send_message(&self, data: Vec<u8>) -> Result<()>;

    /// Closes the write half. Idempotent from the driver's perspective: it
    /// is called at most once, either after the last request or when the
    /// request producer errors.
    async fn half_close(&self);

    async fn receive_message(&self) -> Result<Option<Vec<u8>>>;

    async fn receive_initial_metadata(&self) -> Result<Metadata>;

    async fn receive_trailer(&self) -> Result<(Metadata, Status, String)>;

    async fn cancel(&self);
}

/// A channel to a server, opened once per call, mirroring `createChannel`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        method_path: &str,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Result<Box<dyn ClientTransportCall>>;
}
