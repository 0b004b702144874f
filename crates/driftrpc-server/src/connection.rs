//! One accepted connection: negotiation, the read loop, the send loop and
//! orderly teardown.
//!
//! Teardown ordering: mark the connection errored, close the reply gate and
//! wait for in-flight handlers, drop the reply queue so the send loop
//! drains and closes the writer, then report stopped so the server can
//! drop the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use driftrpc_common::compress::CompressorFactory;
use driftrpc_common::error::{Result, RpcError};
use driftrpc_common::frame::{
    encode_exception_frame, read_negotiation_frame, run_send_loop, write_negotiation_frame,
    ExceptionPayload, FeatureMap, FrameReader, FrameWriter, ResponseHeader, FEATURE_COMPRESS,
    FEATURE_TIMEOUT, RESPONSE_HEADER_SIZE,
};
use driftrpc_common::limits::UNKNOWN_VERB_REPLY_WEIGHT;
use driftrpc_common::marshal::{marshal_value, Marshal, Serializer};

use crate::dispatch::{ClientInfo, HandlerRegistry};
use crate::gate::Gate;
use crate::resources::ConnectionResources;

struct ConnInner<S> {
    serializer: Arc<S>,
    info: ClientInfo,
    resources: Arc<ConnectionResources>,
    gate: Arc<Gate>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    error: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared handle to a live server connection, held by the read loop and by
/// every in-flight handler until it completes under the gate.
pub struct ServerConnection<S> {
    inner: Arc<ConnInner<S>>,
}

impl<S> Clone for ServerConnection<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: Serializer> ServerConnection<S> {
    pub fn serializer(&self) -> &S {
        &self.inner.serializer
    }

    pub fn info(&self) -> &ClientInfo {
        &self.inner.info
    }

    pub fn resources(&self) -> &ConnectionResources {
        &self.inner.resources
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.inner.gate
    }

    pub fn is_error(&self) -> bool {
        self.inner.error.load(Ordering::SeqCst)
    }

    fn poison(&self) {
        self.inner.error.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }

    fn enqueue(&self, frame: Bytes) {
        if let Some(tx) = self.inner.send_tx.lock().unwrap().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn take_send_tx(&self) {
        self.inner.send_tx.lock().unwrap().take();
    }

    /// Hands a wait-mode handler outcome to the writer. A value marshals
    /// into a response with the positive id; an error (from the handler, or
    /// from marshalling the value) becomes a USER exception with the
    /// negated id. Nothing is sent once the connection is errored.
    pub fn send_reply<Ret: Marshal<S>>(&self, msg_id: i64, result: Result<Ret>) {
        if self.is_error() {
            return;
        }
        let frame = match result {
            Ok(value) => match marshal_value(&*self.inner.serializer, RESPONSE_HEADER_SIZE, &value)
            {
                Ok(mut buf) => {
                    let payload_len = (buf.len() - RESPONSE_HEADER_SIZE) as u32;
                    let header = ResponseHeader { msg_id, payload_len };
                    header.encode_into(&mut buf[..RESPONSE_HEADER_SIZE]);
                    buf.freeze()
                }
                Err(e) => {
                    encode_exception_frame(-msg_id, &ExceptionPayload::User(exception_message(&e)))
                }
            },
            Err(e) => {
                encode_exception_frame(-msg_id, &ExceptionPayload::User(exception_message(&e)))
            }
        };
        self.enqueue(frame);
    }

    /// The reply path for a message type with no handler: admit the fixed
    /// 28-byte reply weight, send an UNKNOWN_VERB exception under the gate
    /// and release.
    async fn reply_unknown_verb(&self, msg_type: u64, msg_id: i64) -> Result<()> {
        self.resources().wait_for(UNKNOWN_VERB_REPLY_WEIGHT).await?;
        if let Some(_guard) = self.gate().enter() {
            if !self.is_error() {
                self.enqueue(encode_exception_frame(
                    -msg_id,
                    &ExceptionPayload::UnknownVerb(msg_type),
                ));
            }
        }
        self.resources().release(UNKNOWN_VERB_REPLY_WEIGHT);
        Ok(())
    }
}

/// The message carried to the peer in a USER exception. `Handler` errors
/// travel as the bare message the application produced.
fn exception_message(error: &RpcError) -> String {
    match error {
        RpcError::Handler(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Runs one connection to completion. Returns once the connection has
/// fully stopped: handlers finished, send loop drained, writer closed.
pub(crate) async fn run_connection<S, IO>(
    io: IO,
    peer: SocketAddr,
    handlers: Arc<HandlerRegistry<S>>,
    serializer: Arc<S>,
    resources: Arc<ConnectionResources>,
    compressor_factory: Option<Arc<dyn CompressorFactory>>,
    shutdown: CancellationToken,
) where
    S: Serializer,
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(io);

    let requested = match read_negotiation_frame(&mut read_half).await {
        Ok(features) => features,
        Err(RpcError::Closed) => return,
        Err(e) => {
            tracing::warn!(peer = %peer, "negotiation failed: {e}");
            return;
        }
    };

    let mut accepted = FeatureMap::new();
    let mut compressor = None;
    let mut timeout_negotiated = false;
    for (feature, payload) in &requested {
        match *feature {
            FEATURE_COMPRESS => {
                if let Some(factory) = &compressor_factory {
                    if let Some(negotiated) = factory.negotiate(payload, true) {
                        compressor = Some(negotiated);
                        accepted.insert(FEATURE_COMPRESS, factory.supported());
                    }
                }
            }
            FEATURE_TIMEOUT => {
                timeout_negotiated = true;
                accepted.insert(FEATURE_TIMEOUT, Bytes::new());
            }
            _ => {}
        }
    }
    if let Err(e) = write_negotiation_frame(&mut write_half, &accepted).await {
        tracing::warn!(peer = %peer, "negotiation failed: {e}");
        return;
    }

    let (send_tx, send_rx) = mpsc::unbounded_channel();
    let conn = ServerConnection {
        inner: Arc::new(ConnInner {
            serializer,
            info: ClientInfo { peer },
            resources,
            gate: Gate::new(),
            send_tx: Mutex::new(Some(send_tx)),
            error: AtomicBool::new(false),
            shutdown,
        }),
    };

    let send_task = {
        let conn = conn.clone();
        let writer = FrameWriter::new(write_half, compressor.clone());
        tokio::spawn(async move {
            if let Err(e) = run_send_loop(writer, send_rx).await {
                tracing::warn!(peer = %conn.info().peer, "send loop failed: {e}");
                conn.poison();
            }
        })
    };

    let mut reader = FrameReader::new(read_half, compressor);
    loop {
        let frame = tokio::select! {
            _ = conn.inner.shutdown.cancelled() => break,
            frame = reader.read_request(timeout_negotiated) => frame,
        };
        match frame {
            Ok(Some((header, payload))) => {
                let deadline = (header.expiration_ms > 0)
                    .then(|| Instant::now() + Duration::from_millis(header.expiration_ms));
                match handlers.get(header.msg_type) {
                    Some(thunk) => {
                        if let Err(e) =
                            thunk(conn.clone(), deadline, header.msg_id, payload).await
                        {
                            tracing::warn!(peer = %peer, "server connection dropped: {e}");
                            break;
                        }
                    }
                    None => {
                        if conn
                            .reply_unknown_verb(header.msg_type, header.msg_id)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, "server connection dropped: {e}");
                break;
            }
        }
    }

    conn.poison();
    conn.gate().close().await;
    conn.take_send_tx();
    let _ = send_task.await;
    tracing::debug!(peer = %peer, "server connection stopped");
}
