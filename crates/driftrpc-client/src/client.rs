//! The client connection.
//!
//! A client owns one ordered stream to a server. Calls are multiplexed:
//! the send loop writes request frames from a FIFO queue, the read loop
//! correlates response frames to pending calls by message id. Message ids
//! are allocated monotonically from 1 and never reused for the life of the
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use driftrpc_common::compress::CompressorFactory;
use driftrpc_common::error::Result;
use driftrpc_common::frame::{
    read_negotiation_frame, run_send_loop, write_negotiation_frame, ExceptionPayload,
    FeatureMap, FrameReader, FrameWriter, FEATURE_COMPRESS, FEATURE_TIMEOUT,
};
use driftrpc_common::marshal::Serializer;

use crate::pending::{PendingReplies, ReplyCompletion};

/// Client-side connection options.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Advertise the TIMEOUT feature and transmit the remaining call time
    /// in every request header once the server accepts it.
    pub send_timeout_data: bool,
    /// Advertise the COMPRESS feature with this factory's payload.
    pub compressor_factory: Option<Arc<dyn CompressorFactory>>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_timeout_data(mut self, send: bool) -> Self {
        self.send_timeout_data = send;
        self
    }

    pub fn with_compressor_factory(mut self, factory: Arc<dyn CompressorFactory>) -> Self {
        self.compressor_factory = Some(factory);
        self
    }
}

/// Call counters for one client connection.
#[derive(Default)]
pub struct ClientStats {
    pub(crate) sent_messages: AtomicU64,
    pub(crate) replied: AtomicU64,
    pub(crate) exception_received: AtomicU64,
    pub(crate) timed_out: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub sent_messages: u64,
    pub replied: u64,
    pub exception_received: u64,
    pub timed_out: u64,
}

impl ClientStats {
    fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            exception_received: self.exception_received.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ClientInner<S> {
    serializer: Arc<S>,
    pending: PendingReplies,
    next_id: AtomicI64,
    send_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    error: AtomicBool,
    timeout_negotiated: bool,
    stats: Arc<ClientStats>,
    shutdown: CancellationToken,
    stopped: watch::Sender<bool>,
}

/// One client connection. Cheap to clone; all clones share the connection.
pub struct RpcClient<S> {
    inner: Arc<ClientInner<S>>,
}

impl<S> Clone for RpcClient<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S> std::fmt::Debug for RpcClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

impl<S: Serializer> RpcClient<S> {
    /// Connects over TCP, disables Nagle and performs the negotiation
    /// handshake.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        serializer: Arc<S>,
        options: ClientOptions,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Self::from_stream(stream, Some(peer), serializer, options).await
    }

    /// Builds a client over an already-established stream. `peer` is used
    /// for log context only.
    pub async fn from_stream<IO>(
        io: IO,
        peer: Option<SocketAddr>,
        serializer: Arc<S>,
        options: ClientOptions,
    ) -> Result<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(io);

        let mut features = FeatureMap::new();
        if let Some(factory) = &options.compressor_factory {
            features.insert(FEATURE_COMPRESS, factory.supported());
        }
        if options.send_timeout_data {
            features.insert(FEATURE_TIMEOUT, Bytes::new());
        }
        write_negotiation_frame(&mut write_half, &features).await?;

        let provided = match read_negotiation_frame(&mut read_half).await {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(peer = ?peer, "fail to connect: {e}");
                return Err(e);
            }
        };

        let mut compressor = None;
        let mut timeout_negotiated = false;
        for (feature, payload) in &provided {
            match *feature {
                FEATURE_COMPRESS => {
                    if let Some(factory) = &options.compressor_factory {
                        compressor = factory.negotiate(payload, false);
                    }
                }
                FEATURE_TIMEOUT => timeout_negotiated = true,
                _ => {}
            }
        }

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (stopped, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            serializer,
            pending: PendingReplies::new(),
            next_id: AtomicI64::new(0),
            send_tx: Mutex::new(Some(send_tx)),
            error: AtomicBool::new(false),
            timeout_negotiated,
            stats: Arc::new(ClientStats::default()),
            shutdown: CancellationToken::new(),
            stopped,
        });

        let send_task = {
            let inner = inner.clone();
            let writer = FrameWriter::new(write_half, compressor.clone());
            tokio::spawn(async move {
                if let Err(e) = run_send_loop(writer, send_rx).await {
                    tracing::warn!(peer = ?peer, "send loop failed: {e}");
                    inner.error.store(true, Ordering::SeqCst);
                    inner.shutdown.cancel();
                }
            })
        };

        {
            let inner = inner.clone();
            let reader = FrameReader::new(read_half, compressor);
            tokio::spawn(async move {
                read_loop(&inner, reader, peer).await;

                // Teardown: poison, complete every pending call with
                // closed, let the send loop drain, then report stopped.
                inner.error.store(true, Ordering::SeqCst);
                inner.shutdown.cancel();
                drop(inner.pending.drain());
                inner.send_tx.lock().unwrap().take();
                let _ = send_task.await;
                let _ = inner.stopped.send(true);
                tracing::debug!(peer = ?peer, "client connection stopped");
            });
        }

        Ok(Self { inner })
    }

    /// True once the connection is poisoned; new calls fail immediately
    /// with a closed error.
    pub fn is_error(&self) -> bool {
        self.inner.error.load(Ordering::SeqCst)
    }

    /// Counters for this connection.
    pub fn stats(&self) -> ClientStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Tears the connection down and waits until every outstanding call
    /// has been completed and the writer is closed.
    pub async fn shutdown(&self) {
        self.inner.error.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.closed().await;
    }

    /// Resolves once the connection has fully stopped.
    pub async fn closed(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn serializer(&self) -> &S {
        &self.inner.serializer
    }

    pub(crate) fn serializer_arc(&self) -> Arc<S> {
        self.inner.serializer.clone()
    }

    pub(crate) fn stats_arc(&self) -> Arc<ClientStats> {
        self.inner.stats.clone()
    }

    pub(crate) fn timeout_negotiated(&self) -> bool {
        self.inner.timeout_negotiated
    }

    /// Allocates the next message id; strictly monotonic per connection.
    pub(crate) fn next_msg_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn register_pending(&self, msg_id: i64, completion: ReplyCompletion) {
        self.inner.pending.insert(msg_id, completion);
    }

    /// Removes a pending entry, dropping its completion. Returns whether
    /// this caller won the removal race.
    pub(crate) fn take_pending(&self, msg_id: i64) -> bool {
        self.inner.pending.remove(msg_id).is_some()
    }

    /// Hands a fully-encoded request frame to the send loop. Returns false
    /// once the connection is shutting down.
    pub(crate) fn enqueue(&self, frame: Bytes) -> bool {
        match self.inner.send_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

async fn read_loop<S: Serializer, R>(
    inner: &Arc<ClientInner<S>>,
    mut reader: FrameReader<R>,
    peer: Option<SocketAddr>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            frame = reader.read_response() => frame,
        };
        match frame {
            Ok(Some((header, payload))) => {
                let signed_id = header.msg_id;
                match inner.pending.remove(signed_id.unsigned_abs() as i64) {
                    Some(completion) => {
                        if let Err(e) = completion(signed_id, payload) {
                            tracing::warn!(peer = ?peer, "client connection dropped: {e}");
                            return;
                        }
                    }
                    None if signed_id < 0 => {
                        // An exception for a call nobody waits on. The only
                        // legitimate case is UNKNOWN_VERB elicited by a
                        // no-wait call; anything else means the stream can
                        // no longer be trusted.
                        match ExceptionPayload::decode(&payload) {
                            Ok(ExceptionPayload::UnknownVerb(msg_type)) => {
                                tracing::info!(
                                    peer = ?peer,
                                    "unknown verb exception {msg_type} ignored"
                                );
                            }
                            Ok(_) => {
                                tracing::warn!(
                                    peer = ?peer,
                                    "client connection dropped: unexpected exception for \
                                     unknown message id {signed_id}"
                                );
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(peer = ?peer, "client connection dropped: {e}");
                                return;
                            }
                        }
                    }
                    None => {
                        // A reply for an id that already timed out or was
                        // canceled; drop it.
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(peer = ?peer, "client connection dropped: {e}");
                return;
            }
        }
    }
}
