//! Typed call stubs.
//!
//! A stub binds a message type to an argument tuple and a return type.
//! Four call shapes exist: plain, with an absolute deadline, with a
//! relative timeout (deadline = now + duration) and with a cancellation
//! token. A deadline is enforced locally; when the TIMEOUT feature was
//! negotiated the remaining milliseconds also travel in the request header
//! so the server can shed expired work.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use driftrpc_common::error::{Result, RpcError};
use driftrpc_common::frame::{
    ExceptionPayload, RequestHeader, REQUEST_HEADER_WITH_TIMEOUT_SIZE,
};
use driftrpc_common::marshal::{
    marshal_args, unmarshal_value, Marshal, MarshalArgs, Serializer,
};

use crate::client::{ClientStats, RpcClient};
use crate::pending::ReplyCompletion;

/// Encodes one request frame with the full 28-byte header prefix filled
/// in. When the TIMEOUT feature was not negotiated the expiration field is
/// trimmed off, leaving the 20-byte baseline header.
fn encode_request<S: Serializer, Args: MarshalArgs<S>>(
    client: &RpcClient<S>,
    msg_type: u64,
    msg_id: i64,
    deadline: Option<Instant>,
    args: &Args,
) -> Result<Bytes> {
    let mut buf = marshal_args(client.serializer(), REQUEST_HEADER_WITH_TIMEOUT_SIZE, args)?;
    let payload_len = (buf.len() - REQUEST_HEADER_WITH_TIMEOUT_SIZE) as u32;
    let expiration_ms = deadline
        .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
        .unwrap_or(0);
    let header = RequestHeader { expiration_ms, msg_type, msg_id, payload_len };
    header.encode_into(&mut buf[..REQUEST_HEADER_WITH_TIMEOUT_SIZE]);

    let mut frame = buf.freeze();
    if !client.timeout_negotiated() {
        frame.advance(8);
    }
    Ok(frame)
}

/// What woke the caller first.
enum Wake<T> {
    Reply(std::result::Result<T, oneshot::error::RecvError>),
    Deadline,
    Canceled,
}

async fn wait_completion<T>(
    rx: &mut oneshot::Receiver<Result<T>>,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
) -> Wake<Result<T>> {
    let sleep = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let canceled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        reply = rx => Wake::Reply(reply),
        _ = canceled => Wake::Canceled,
        _ = sleep => Wake::Deadline,
    }
}

/// A wait-mode call stub: every call expects exactly one reply.
pub struct CallStub<S, Args, Ret> {
    msg_type: u64,
    _marker: PhantomData<fn(S, Args) -> Ret>,
}

impl<S, Args, Ret> Clone for CallStub<S, Args, Ret> {
    fn clone(&self) -> Self {
        Self { msg_type: self.msg_type, _marker: PhantomData }
    }
}

impl<S, Args, Ret> CallStub<S, Args, Ret>
where
    S: Serializer,
    Args: MarshalArgs<S>,
    Ret: Marshal<S>,
{
    pub fn new(msg_type: u64) -> Self {
        Self { msg_type, _marker: PhantomData }
    }

    pub fn msg_type(&self) -> u64 {
        self.msg_type
    }

    pub async fn call(&self, client: &RpcClient<S>, args: Args) -> Result<Ret> {
        self.send(client, None, None, args).await
    }

    /// Calls with an absolute deadline.
    pub async fn call_at(
        &self,
        client: &RpcClient<S>,
        deadline: Instant,
        args: Args,
    ) -> Result<Ret> {
        self.send(client, Some(deadline), None, args).await
    }

    /// Calls with a deadline of now plus `timeout`.
    pub async fn call_within(
        &self,
        client: &RpcClient<S>,
        timeout: Duration,
        args: Args,
    ) -> Result<Ret> {
        self.send(client, Some(Instant::now() + timeout), None, args).await
    }

    /// Calls with a cancellation token; cancelling resolves the call with
    /// a canceled error without interrupting the server-side handler.
    pub async fn call_cancellable(
        &self,
        client: &RpcClient<S>,
        cancel: &CancellationToken,
        args: Args,
    ) -> Result<Ret> {
        self.send(client, None, Some(cancel), args).await
    }

    async fn send(
        &self,
        client: &RpcClient<S>,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
        args: Args,
    ) -> Result<Ret> {
        if client.is_error() {
            return Err(RpcError::Closed);
        }
        let msg_id = client.next_msg_id();
        let frame = encode_request(client, self.msg_type, msg_id, deadline, &args)?;

        let (tx, mut rx) = oneshot::channel();
        client.register_pending(
            msg_id,
            reply_completion::<S, Ret>(client.serializer_arc(), client.stats_arc(), tx),
        );
        if !client.enqueue(frame) {
            client.take_pending(msg_id);
            return Err(RpcError::Closed);
        }
        client.stats_arc().sent_messages.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match wait_completion(&mut rx, deadline, cancel).await {
            Wake::Reply(Ok(result)) => result,
            Wake::Reply(Err(_)) => Err(RpcError::Closed),
            Wake::Deadline => {
                if client.take_pending(msg_id) {
                    client
                        .stats_arc()
                        .timed_out
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Err(RpcError::Timeout)
                } else {
                    // The read loop won the race and will complete us.
                    rx.await.unwrap_or(Err(RpcError::Closed))
                }
            }
            Wake::Canceled => {
                if client.take_pending(msg_id) {
                    Err(RpcError::Canceled)
                } else {
                    rx.await.unwrap_or(Err(RpcError::Closed))
                }
            }
        }
    }
}

/// Builds the completion installed in the pending map for a wait-mode
/// call. A positive id unmarshals the declared return type; a negative id
/// decodes the exception record. A payload that decodes as neither
/// completes the call and reports the protocol error to the read loop,
/// which poisons the connection.
fn reply_completion<S: Serializer, Ret: Marshal<S>>(
    serializer: Arc<S>,
    stats: Arc<ClientStats>,
    tx: oneshot::Sender<Result<Ret>>,
) -> ReplyCompletion {
    Box::new(move |signed_id: i64, payload: Bytes| {
        use std::sync::atomic::Ordering;

        if signed_id >= 0 {
            stats.replied.fetch_add(1, Ordering::Relaxed);
            match unmarshal_value::<S, Ret>(&serializer, &payload) {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                    Ok(())
                }
                Err(e) => {
                    let msg = e.to_string();
                    let _ = tx.send(Err(e));
                    Err(RpcError::Protocol(format!("reply unmarshal failed: {msg}")))
                }
            }
        } else {
            stats.exception_received.fetch_add(1, Ordering::Relaxed);
            match ExceptionPayload::decode(&payload) {
                Ok(exception) => {
                    let _ = tx.send(Err(exception.into_error()));
                    Ok(())
                }
                Err(e) => {
                    let msg = e.to_string();
                    let _ = tx.send(Err(e));
                    Err(RpcError::Protocol(format!("exception decode failed: {msg}")))
                }
            }
        }
    })
}

/// A fire-and-forget call stub: no reply frame is ever produced and the
/// call resolves once the request is queued for sending. Handler failures
/// are logged at the server and discarded.
pub struct NoWaitStub<S, Args> {
    msg_type: u64,
    _marker: PhantomData<fn(S, Args)>,
}

impl<S, Args> Clone for NoWaitStub<S, Args> {
    fn clone(&self) -> Self {
        Self { msg_type: self.msg_type, _marker: PhantomData }
    }
}

impl<S, Args> NoWaitStub<S, Args>
where
    S: Serializer,
    Args: MarshalArgs<S>,
{
    pub fn new(msg_type: u64) -> Self {
        Self { msg_type, _marker: PhantomData }
    }

    pub fn msg_type(&self) -> u64 {
        self.msg_type
    }

    pub async fn call(&self, client: &RpcClient<S>, args: Args) -> Result<()> {
        self.send(client, None, args)
    }

    /// Transmits the remaining time so the server can drop the request
    /// once it has expired; the client itself never waits.
    pub async fn call_at(
        &self,
        client: &RpcClient<S>,
        deadline: Instant,
        args: Args,
    ) -> Result<()> {
        self.send(client, Some(deadline), args)
    }

    pub async fn call_within(
        &self,
        client: &RpcClient<S>,
        timeout: Duration,
        args: Args,
    ) -> Result<()> {
        self.send(client, Some(Instant::now() + timeout), args)
    }

    pub async fn call_cancellable(
        &self,
        client: &RpcClient<S>,
        cancel: &CancellationToken,
        args: Args,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RpcError::Canceled);
        }
        self.send(client, None, args)
    }

    fn send(&self, client: &RpcClient<S>, deadline: Option<Instant>, args: Args) -> Result<()> {
        if client.is_error() {
            return Err(RpcError::Closed);
        }
        let msg_id = client.next_msg_id();
        let frame = encode_request(client, self.msg_type, msg_id, deadline, &args)?;
        if !client.enqueue(frame) {
            return Err(RpcError::Closed);
        }
        client.stats_arc().sent_messages.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}
