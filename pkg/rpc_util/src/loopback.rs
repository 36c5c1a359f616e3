use std::time::Instant;

use common::errors::*;
use executor::channel::{oneshot, spsc};
use executor::lock_async;
use executor::sync::AsyncMutex;

use rpc::deadline;
use rpc::metadata::Metadata;
use rpc::signal::{Signal, SignalController};
use rpc::status::Status;
use rpc::transport::{ClientTransportCall, ServerTransportCall, Transport, TransportListener};

/// Capacity of every loopback channel (accept queue, per-call request/
/// response queues). Small and fixed: this transport exists for tests, not
/// for tuning throughput.
const CHANNEL_CAPACITY: usize = 16;

/// An in-process `Transport`/`TransportListener` pair that bridges a client
/// `Channel` directly to a `Server`, with no socket or HTTP/2 framing in
/// between. Modeled on `pkg/http`'s in-memory `pipe()` used to drive its own
/// connection tests without a real TCP listener.
///
/// `Transport::open` is the client side; the matching `ServerTransportCall`
/// is handed to whichever task is running `Server::serve` against the
/// `TransportListener` returned by `loopback()`.
pub struct LoopbackTransport {
    accept_tx: AsyncMutex<spsc::Sender<Box<dyn ServerTransportCall>>>,
    local_address: String,
}

pub struct LoopbackListener {
    accept_rx: spsc::Receiver<Box<dyn ServerTransportCall>>,
    local_address: String,
}

/// Creates a connected loopback transport/listener pair. `local_address` is
/// purely cosmetic (returned by `TransportListener::local_address`); this
/// transport never binds an actual socket.
pub fn loopback(local_address: impl Into<String>) -> (std::sync::Arc<LoopbackTransport>, Box<dyn TransportListener>) {
    let (accept_tx, accept_rx) = spsc::bounded(CHANNEL_CAPACITY);
    let local_address = local_address.into();

    let transport = std::sync::Arc::new(LoopbackTransport {
        accept_tx: AsyncMutex::new(accept_tx),
        local_address: local_address.clone(),
    });

    let listener: Box<dyn TransportListener> = Box::new(LoopbackListener {
        accept_rx,
        local_address,
    });

    (transport, listener)
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        method_path: &str,
        mut metadata: Metadata,
        deadline_at: Option<Instant>,
    ) -> Result<Box<dyn ClientTransportCall>> {
        if let Some(at) = deadline_at {
            let remaining = at.saturating_duration_since(Instant::now());
            metadata.set_transport(deadline::HEADER_NAME, deadline::encode(remaining))?;
        }
        metadata.freeze();

        let (request_tx, request_rx) = spsc::bounded(CHANNEL_CAPACITY);
        let (response_tx, response_rx) = spsc::bounded(CHANNEL_CAPACITY);
        let (header_tx, header_rx) = oneshot::channel();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        let (cancel_signal, cancel_controller) = Signal::new();

        let server_call: Box<dyn ServerTransportCall> = Box::new(LoopbackServerCall {
            method_path: method_path.to_string(),
            metadata,
            peer: self.local_address.clone(),
            requests: AsyncMutex::new(request_rx),
            responses: AsyncMutex::new(response_tx),
            header_tx: AsyncMutex::new(Some(header_tx)),
            trailer_tx: AsyncMutex::new(Some(trailer_tx)),
            cancel_signal,
        });

        lock_async!(tx <= self.accept_tx.lock().await?, {
            tx.send(server_call)
                .await
                .map_err(|_| err_msg("Loopback listener is no longer accepting calls"))
        })?;

        Ok(Box::new(LoopbackClientCall {
            requests: AsyncMutex::new(Some(request_tx)),
            responses: AsyncMutex::new(response_rx),
            header_rx: AsyncMutex::new(Some(header_rx)),
            trailer_rx: AsyncMutex::new(Some(trailer_rx)),
            cancel_controller,
        }))
    }
}

#[async_trait]
impl TransportListener for LoopbackListener {
    async fn accept(&mut self) -> Option<Box<dyn ServerTransportCall>> {
        self.accept_rx.recv().await.ok()
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }
}

/// The server side of one loopback call. All fields sit behind an
/// `AsyncMutex` because `ServerTransportCall`'s methods take `&self`: the
/// dispatcher drives `receive_message`/`send_message`/`wait_for_peer_cancellation`
/// concurrently from different tasks.
struct LoopbackServerCall {
    method_path: String,
    metadata: Metadata,
    peer: String,
    requests: AsyncMutex<spsc::Receiver<Vec<u8>>>,
    responses: AsyncMutex<spsc::Sender<Vec<u8>>>,
    header_tx: AsyncMutex<Option<oneshot::Sender<Metadata>>>,
    trailer_tx: AsyncMutex<Option<oneshot::Sender<(Metadata, Status, String)>>>,
    cancel_signal: Signal,
}

#[async_trait]
impl ServerTransportCall for LoopbackServerCall {
    fn method_path(&self) -> &str {
        &self.method_path
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn receive_message(&self) -> Result<Option<Vec<u8>>> {
        lock_async!(rx <= self.requests.lock().await?, {
            match rx.recv().await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(_) => Ok(None),
            }
        })
    }

    async fn send_initial_metadata(&self, metadata: Metadata) -> Result<()> {
        lock_async!(slot <= self.header_tx.lock().await?, {
            if let Some(tx) = slot.take() {
                // A dropped client receiver just means it stopped waiting for
                // headers (e.g. it was cancelled); nothing left to report.
                let _ = tx.send(metadata);
            }
            Ok(())
        })
    }

    async fn send_message(&self, data: Vec<u8>) -> Result<()> {
        lock_async!(tx <= self.responses.lock().await?, {
            tx.send(data)
                .await
                .map_err(|_| err_msg("Loopback client dropped the response stream"))
        })
    }

    async fn send_trailer(&self, metadata: Metadata, status: Status, details: String) -> Result<()> {
        lock_async!(slot <= self.trailer_tx.lock().await?, {
            if let Some(tx) = slot.take() {
                let _ = tx.send((metadata, status, details));
            }
            Ok(())
        })
    }

    async fn wait_for_peer_cancellation(&self) {
        self.cancel_signal.wait().await;
    }
}

/// The client side of one loopback call, symmetric to `LoopbackServerCall`.
struct LoopbackClientCall {
    requests: AsyncMutex<Option<spsc::Sender<Vec<u8>>>>,
    responses: AsyncMutex<spsc::Receiver<Vec<u8>>>,
    header_rx: AsyncMutex<Option<oneshot::Receiver<Metadata>>>,
    trailer_rx: AsyncMutex<Option<oneshot::Receiver<(Metadata, Status, String)>>>,
    cancel_controller: SignalController,
}

#[async_trait]
impl ClientTransportCall for LoopbackClientCall {
    async fn send_message(&self, data: Vec<u8>) -> Result<()> {
        lock_async!(slot <= self.requests.lock().await?, {
            match slot.as_mut() {
                Some(tx) => tx
                    .send(data)
                    .await
                    .map_err(|_| err_msg("Loopback server dropped the request stream")),
                None => Err(err_msg("Cannot send: the request stream was already half-closed")),
            }
        })
    }

    async fn half_close(&self) {
        if let Ok(permit) = self.requests.lock().await {
            lock_async!(slot <= permit, {
                // Dropping the sender is what signals end-of-stream to the
                // server's `receive_message` (it sees `RecvError::SenderDropped`).
                slot.take();
            })
        }
    }

    async fn receive_message(&self) -> Result<Option<Vec<u8>>> {
        lock_async!(rx <= self.responses.lock().await?, {
            match rx.recv().await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(_) => Ok(None),
            }
        })
    }

    async fn receive_initial_metadata(&self) -> Result<Metadata> {
        lock_async!(slot <= self.header_rx.lock().await?, {
            match slot.take() {
                Some(rx) => rx
                    .recv()
                    .await
                    .map_err(|_| err_msg("Loopback server dropped before sending headers")),
                None => Err(err_msg("Initial metadata was already received")),
            }
        })
    }

    async fn receive_trailer(&self) -> Result<(Metadata, Status, String)> {
        lock_async!(slot <= self.trailer_rx.lock().await?, {
            match slot.take() {
                Some(rx) => rx
                    .recv()
                    .await
                    .map_err(|_| err_msg("Loopback server dropped before sending a trailer")),
                None => Err(err_msg("Trailer was already received")),
            }
        })
    }

    async fn cancel(&self) {
        self.cancel_controller.abort();
    }
}
