//! Handler registration and dispatch.
//!
//! A registered handler becomes a type-erased thunk keyed by message type.
//! The thunk runs the per-request sequence on the connection that received
//! the frame: admit the request's memory weight, decode the arguments,
//! enter the reply gate, run the handler concurrently with the read loop,
//! send the reply (for wait-mode handlers) and release the weight.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::time::Instant;

use driftrpc_common::error::Result;
use driftrpc_common::limits::estimate_request_size;
use driftrpc_common::marshal::{unmarshal_args, MarshalArgs, Marshal, Serializer};

use crate::connection::ServerConnection;

/// Identity of the peer that sent a request, handed to handlers registered
/// with one of the `_with_info` variants.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub peer: SocketAddr,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer)
    }
}

type ThunkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A type-erased handler. The returned future resolves once the request is
/// admitted and the handler has been spawned; an error poisons the
/// connection.
pub type HandlerThunk<S> =
    Arc<dyn Fn(ServerConnection<S>, Option<Instant>, i64, Bytes) -> ThunkFuture + Send + Sync>;

/// Message-type to handler map shared by a protocol's servers.
///
/// Registration is expected to happen before connections are served;
/// inserting an existing type replaces the previous handler.
pub struct HandlerRegistry<S> {
    handlers: RwLock<HashMap<u64, HandlerThunk<S>>>,
}

impl<S: Serializer> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, msg_type: u64, thunk: HandlerThunk<S>) {
        self.handlers.write().unwrap().insert(msg_type, thunk);
    }

    pub fn get(&self, msg_type: u64) -> Option<HandlerThunk<S>> {
        self.handlers.read().unwrap().get(&msg_type).cloned()
    }
}

impl<S: Serializer> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the thunk for a wait-mode handler: the handler's value is
/// marshalled into a response with the positive message id; a handler error
/// becomes a USER exception reply with the negated id.
pub fn wait_thunk<S, Args, Ret, F, Fut>(f: F) -> HandlerThunk<S>
where
    S: Serializer,
    Args: MarshalArgs<S>,
    Ret: Marshal<S>,
    F: Fn(ClientInfo, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Ret>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(
        move |conn: ServerConnection<S>, _deadline: Option<Instant>, msg_id: i64, payload: Bytes| {
            let f = f.clone();
            Box::pin(async move {
                let weight = estimate_request_size(payload.len());
                conn.resources().wait_for(weight).await?;
                let args = match unmarshal_args::<S, Args>(conn.serializer(), &payload) {
                    Ok(args) => args,
                    Err(e) => {
                        conn.resources().release(weight);
                        return Err(e);
                    }
                };
                let Some(guard) = conn.gate().enter() else {
                    conn.resources().release(weight);
                    return Ok(());
                };
                let info = conn.info().clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = f(info, args).await;
                    conn.send_reply(msg_id, result);
                    conn.resources().release(weight);
                });
                Ok(())
            })
        },
    )
}

/// Builds the thunk for a no-wait handler: nothing is ever sent back and
/// handler errors are logged at the server and discarded.
pub fn no_wait_thunk<S, Args, F, Fut>(f: F) -> HandlerThunk<S>
where
    S: Serializer,
    Args: MarshalArgs<S>,
    F: Fn(ClientInfo, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(
        move |conn: ServerConnection<S>, _deadline: Option<Instant>, msg_id: i64, payload: Bytes| {
            let f = f.clone();
            Box::pin(async move {
                let weight = estimate_request_size(payload.len());
                conn.resources().wait_for(weight).await?;
                let args = match unmarshal_args::<S, Args>(conn.serializer(), &payload) {
                    Ok(args) => args,
                    Err(e) => {
                        conn.resources().release(weight);
                        return Err(e);
                    }
                };
                let Some(guard) = conn.gate().enter() else {
                    conn.resources().release(weight);
                    return Ok(());
                };
                let info = conn.info().clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = f(info.clone(), args).await {
                        tracing::warn!(
                            peer = %info,
                            msg_id,
                            "exception \"{e}\" in no-wait handler ignored"
                        );
                    }
                    conn.resources().release(weight);
                });
                Ok(())
            })
        },
    )
}
