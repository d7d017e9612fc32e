//! Request/reply messaging over a packet stream
//!
//! A [`Transmitter`] owns both halves of a connection. One writer task serializes every outbound
//! packet, a reader task routes replies to the pending call and queues inbound requests, and a
//! dispatch task runs the registered [`Handlers`] for those requests one at a time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex, PoisonError,
};

use futures::prelude::*;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, Mutex},
    time::Instant,
};
use tokio_util::{
    codec::Framed,
    sync::{CancellationToken, DropGuard},
};

use crate::{
    api::{
        message::{DecodeError, ErrorReply, KeepAliveReply, KeepAliveRequest},
        CodecError, Message, Packet, PacketCodec, PacketId,
    },
    models::TransmitterOptions,
};

mod handler;
pub use handler::*;

#[derive(Debug, Error)]
pub enum TransmitterError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("remote failure: {0}")]
    Remote(#[from] ErrorReply),
    #[error("invalid reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("{0} packets cannot be sent as requests")]
    NotARequest(PacketId),
}

struct Shared {
    peer: String,
    options: TransmitterOptions,
    outbound: mpsc::UnboundedSender<Packet>,
    pending: StdMutex<Option<oneshot::Sender<Packet>>>,
    call_lock: Mutex<()>,
    received: AtomicBool,
    timed_out: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn enqueue(&self, packet: Packet) -> Result<(), TransmitterError> {
        if self.cancel.is_cancelled() {
            return Err(self.close_error());
        }

        self.outbound
            .send(packet)
            .map_err(|_| TransmitterError::ConnectionLost)
    }

    fn close_error(&self) -> TransmitterError {
        if self.timed_out.load(Ordering::SeqCst) {
            TransmitterError::Timeout
        } else {
            TransmitterError::ConnectionLost
        }
    }

    fn complete(&self, reply: Packet) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pending {
            Some(tx) => {
                // The caller may have given up in the meantime
                let _ = tx.send(reply);
            }
            None => {
                warn!(peer = %self.peer, id = %reply.id, "discarding unexpected reply");
            }
        }
    }

    fn teardown(&self, timed_out: bool) {
        if timed_out {
            self.timed_out.store(true, Ordering::SeqCst);
        }

        self.cancel.cancel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Tears the connection down if a call is abandoned after its request was queued
struct InFlight<'s> {
    shared: &'s Shared,
    id: PacketId,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(peer = %self.shared.peer, id = %self.id, "call abandoned while in flight, closing connection");
            self.shared.teardown(false);
        }
    }
}

/// Handle to a request/reply session with a peer
///
/// Clones share the same session. The session is closed once every handle is dropped, when
/// [`Transmitter::close`] is called, or when the transport fails.
#[derive(Clone)]
pub struct Transmitter {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transmitter {
    /// Start the session tasks over `stream`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        peer: impl Into<String>,
        options: &TransmitterOptions,
        handlers: Handlers,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, PacketCodec::new(options.max_frame_length));
        let (sink, stream) = framed.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            peer: peer.into(),
            options: options.clone(),
            outbound: outbound_tx,
            pending: StdMutex::new(None),
            call_lock: Mutex::new(()),
            received: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            cancel: cancel.clone(),
        });

        debug!(peer = %shared.peer, handlers = ?handlers, "starting transmitter");

        tokio::spawn(write_loop(shared.clone(), sink, outbound_rx));
        tokio::spawn(read_loop(shared.clone(), stream, request_tx));
        tokio::spawn(dispatch_loop(shared.clone(), handlers, request_rx));
        tokio::spawn(keep_alive_loop(shared.clone()));

        Self {
            shared,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Send `request` and wait for the peer's reply
    ///
    /// An [`ErrorReply`] from the peer is returned as [`TransmitterError::Remote`].
    pub async fn call<Req, Rep>(&self, request: &Req) -> Result<Rep, TransmitterError>
    where
        Req: Message,
        Rep: Message,
    {
        let reply = self.call_packet(request.to_packet()).await?;

        if reply.id == PacketId::ErrorReply && Rep::ID != PacketId::ErrorReply {
            return Err(ErrorReply::from_packet(reply)?.into());
        }

        Ok(Rep::from_packet(reply)?)
    }

    /// Send a raw request packet and wait for the reply packet
    pub async fn call_packet(&self, request: Packet) -> Result<Packet, TransmitterError> {
        let id = request.id;
        if !id.expects_reply() {
            return Err(TransmitterError::NotARequest(id));
        }

        let shared = &*self.shared;
        let _lock = shared.call_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *shared.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        shared.enqueue(request)?;
        let in_flight = InFlight {
            shared,
            id,
            armed: true,
        };

        trace!(peer = %shared.peer, %id, "waiting for reply");

        let result = tokio::select! {
            reply = tokio::time::timeout(shared.options.call_timeout(), rx) => match reply {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(shared.close_error()),
                Err(_) => {
                    warn!(peer = %shared.peer, %id, "call timed out, closing connection");
                    shared.teardown(true);
                    Err(TransmitterError::Timeout)
                }
            },
            _ = shared.cancel.cancelled() => Err(shared.close_error()),
        };

        in_flight.disarm();
        result
    }

    /// Send `message` without waiting for any reply
    pub fn send<M: Message>(&self, message: &M) -> Result<(), TransmitterError> {
        self.shared.enqueue(message.to_packet())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the session has been torn down
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Close the session after flushing the packets already queued
    pub fn close(&self) {
        if !self.is_closed() {
            debug!(peer = %self.shared.peer, "closing transmitter");
            self.shared.teardown(false);
        }
    }
}

async fn write_loop<S>(shared: Arc<Shared>, mut sink: S, mut outbound: mpsc::UnboundedReceiver<Packet>)
where
    S: Sink<Packet, Error = CodecError> + Unpin,
{
    loop {
        let packet = tokio::select! {
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = shared.cancel.cancelled() => break,
        };

        trace!(peer = %shared.peer, id = %packet.id, len = packet.payload.len(), "sending packet");

        if let Err(error) = sink.send(packet).await {
            warn!(peer = %shared.peer, error = %error, "failed to write packet");
            shared.teardown(false);
            return;
        }
    }

    shared.teardown(false);

    // Flush what was queued before the session closed
    while let Ok(packet) = outbound.try_recv() {
        if sink.feed(packet).await.is_err() {
            return;
        }
    }

    if let Err(error) = sink.close().await {
        debug!(peer = %shared.peer, error = %error, "error while closing connection");
    }
}

async fn read_loop<S>(shared: Arc<Shared>, mut stream: S, requests: mpsc::UnboundedSender<Packet>)
where
    S: Stream<Item = Result<Packet, CodecError>> + Unpin,
{
    loop {
        let packet = tokio::select! {
            packet = stream.next() => packet,
            _ = shared.cancel.cancelled() => break,
        };

        let packet = match packet {
            Some(Ok(packet)) => packet,
            Some(Err(error)) => {
                warn!(peer = %shared.peer, error = %error, "failed to read packet");
                break;
            }
            None => {
                debug!(peer = %shared.peer, "connection closed by peer");
                break;
            }
        };

        shared.received.store(true, Ordering::SeqCst);
        trace!(peer = %shared.peer, id = %packet.id, len = packet.payload.len(), "received packet");

        match packet.id {
            PacketId::KeepAliveRequest => {
                let _ = shared.enqueue(KeepAliveReply.to_packet());
            }
            PacketId::KeepAliveReply => {}
            id if id.is_reply() => shared.complete(packet),
            _ => {
                if requests.send(packet).is_err() {
                    break;
                }
            }
        }
    }

    shared.teardown(false);
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    handlers: Handlers,
    mut requests: mpsc::UnboundedReceiver<Packet>,
) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shared.cancel.cancelled() => break,
        };

        let id = request.id;
        let result = match handlers.get(id) {
            Some(handler) => tokio::select! {
                result = handler.handle(request) => result,
                _ = shared.cancel.cancelled() => break,
            },
            None => Err(HandlerError::unhandled(id)),
        };

        if !id.expects_reply() {
            if let Err(error) = result {
                warn!(peer = %shared.peer, %id, error = %error, "failed to handle message");
            }

            continue;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                debug!(peer = %shared.peer, %id, error = %error, "request failed");
                error.into_reply().to_packet()
            }
        };

        if shared.enqueue(reply).is_err() {
            break;
        }
    }
}

async fn keep_alive_loop(shared: Arc<Shared>) {
    let period = shared.options.keep_alive_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    let mut missed = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = shared.cancel.cancelled() => break,
        }

        if shared.received.swap(false, Ordering::SeqCst) {
            missed = 0;
            continue;
        }

        missed += 1;
        if missed > shared.options.keep_alive_retries {
            warn!(peer = %shared.peer, missed, "peer stopped responding, closing connection");
            shared.teardown(true);
            break;
        }

        trace!(peer = %shared.peer, missed, "sending keep-alive");
        if shared.enqueue(KeepAliveRequest.to_packet()).is_err() {
            break;
        }
    }
}
