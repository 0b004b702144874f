//! driftrpc - a typed, asynchronous, point-to-point RPC engine.
//!
//! A process registers handler functions under opaque 64-bit message
//! types; a peer invokes them by type with a typed argument list and gets
//! a typed reply, or fire-and-forget acknowledgment for no-wait calls.
//! Any number of calls multiplex over one ordered connection, correlated
//! by message id.
//!
//! # Overview
//!
//! - [`Protocol`] holds the handler registry and the serializer, and
//!   constructs servers, clients and typed call stubs.
//! - [`RpcServer`] accepts connections and dispatches requests to
//!   handlers under per-connection memory admission and a shutdown gate.
//! - [`RpcClient`] multiplexes calls, correlates replies, and enforces
//!   deadlines and cancellation locally.
//!
//! # Example
//!
//! ```no_run
//! use driftrpc::{ClientOptions, PostcardSerializer, Protocol, ResourceLimits, ServerOptions};
//!
//! # async fn run() -> driftrpc::Result<()> {
//! let protocol = Protocol::new(PostcardSerializer);
//!
//! // Registering returns the matching typed client stub.
//! let echo = protocol.register(1, |args: (i32,)| async move { Ok(args.0 + 1) });
//!
//! let server = protocol
//!     .listen("127.0.0.1:0", ResourceLimits::default(), ServerOptions::default())
//!     .await?;
//! let addr = server.local_addr().unwrap();
//!
//! let client = protocol.connect(addr, ClientOptions::default()).await?;
//! assert_eq!(echo.call(&client, (41,)).await?, 42);
//! # Ok(())
//! # }
//! ```
//!
//! # Feature negotiation
//!
//! Connections open with a negotiation frame in each direction. Two
//! features exist: `COMPRESS` wraps every subsequent frame in a compressed
//! envelope when both sides' factories agree, and `TIMEOUT` makes the
//! client transmit the remaining call time in request headers so the
//! server can shed expired work.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::ToSocketAddrs;

pub use driftrpc_common::codec::{JsonSerializer, PostcardSerializer};
pub use driftrpc_common::compress::{
    Compressor, CompressorFactory, NoopCompressor, NoopCompressorFactory,
};
pub use driftrpc_common::error::{Result, RpcError};
pub use driftrpc_common::limits::ResourceLimits;
pub use driftrpc_common::marshal::{Marshal, MarshalArgs, Serializer};
pub use driftrpc_common::marshal_via_serde;
pub use driftrpc_client::{
    CallStub, ClientOptions, ClientStatsSnapshot, NoWaitStub, RpcClient,
};
pub use driftrpc_server::{ClientInfo, HandlerRegistry, RpcServer, ServerOptions};

pub use driftrpc_client as client;
pub use driftrpc_common as common;
pub use driftrpc_server as server;

use driftrpc_server::dispatch::{no_wait_thunk, wait_thunk};

/// The handler registry and serializer shared by servers and clients of
/// one application protocol.
///
/// Registration is typed: the argument tuple and return type of the
/// handler determine the stub's signature. Handlers asking for the peer's
/// identity take a leading [`ClientInfo`] parameter, which does not appear
/// in the client-visible signature. Registering a message type again
/// replaces the previous handler; registration is expected to happen
/// before connections are served.
pub struct Protocol<S> {
    serializer: Arc<S>,
    handlers: Arc<HandlerRegistry<S>>,
}

impl<S> Clone for Protocol<S> {
    fn clone(&self) -> Self {
        Self { serializer: self.serializer.clone(), handlers: self.handlers.clone() }
    }
}

impl<S: Serializer> Protocol<S> {
    pub fn new(serializer: S) -> Self {
        Self {
            serializer: Arc::new(serializer),
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Registers a wait-mode handler and returns its typed client stub.
    pub fn register<Args, Ret, F, Fut>(&self, msg_type: u64, f: F) -> CallStub<S, Args, Ret>
    where
        Args: MarshalArgs<S>,
        Ret: Marshal<S>,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Ret>> + Send + 'static,
    {
        self.handlers
            .insert(msg_type, wait_thunk(move |_info, args| f(args)));
        CallStub::new(msg_type)
    }

    /// Registers a wait-mode handler that receives the caller's
    /// [`ClientInfo`] ahead of its arguments.
    pub fn register_with_info<Args, Ret, F, Fut>(
        &self,
        msg_type: u64,
        f: F,
    ) -> CallStub<S, Args, Ret>
    where
        Args: MarshalArgs<S>,
        Ret: Marshal<S>,
        F: Fn(ClientInfo, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Ret>> + Send + 'static,
    {
        self.handlers.insert(msg_type, wait_thunk(f));
        CallStub::new(msg_type)
    }

    /// Registers a no-wait handler: the client never waits for a reply and
    /// handler failures are logged at the server and discarded.
    pub fn register_no_wait<Args, F, Fut>(&self, msg_type: u64, f: F) -> NoWaitStub<S, Args>
    where
        Args: MarshalArgs<S>,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(msg_type, no_wait_thunk(move |_info, args| f(args)));
        NoWaitStub::new(msg_type)
    }

    /// No-wait registration with the caller's [`ClientInfo`].
    pub fn register_no_wait_with_info<Args, F, Fut>(
        &self,
        msg_type: u64,
        f: F,
    ) -> NoWaitStub<S, Args>
    where
        Args: MarshalArgs<S>,
        F: Fn(ClientInfo, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(msg_type, no_wait_thunk(f));
        NoWaitStub::new(msg_type)
    }

    /// A typed stub for a message type registered on the peer, without
    /// registering anything locally.
    pub fn client_stub<Args, Ret>(&self, msg_type: u64) -> CallStub<S, Args, Ret>
    where
        Args: MarshalArgs<S>,
        Ret: Marshal<S>,
    {
        CallStub::new(msg_type)
    }

    /// A typed no-wait stub for a message type registered on the peer.
    pub fn no_wait_stub<Args>(&self, msg_type: u64) -> NoWaitStub<S, Args>
    where
        Args: MarshalArgs<S>,
    {
        NoWaitStub::new(msg_type)
    }

    /// Binds a server for this protocol's handlers.
    pub async fn listen<A: ToSocketAddrs>(
        &self,
        addr: A,
        limits: ResourceLimits,
        options: ServerOptions,
    ) -> Result<RpcServer<S>> {
        RpcServer::bind(addr, self.handlers.clone(), self.serializer.clone(), limits, options)
            .await
    }

    /// Creates a server without a listener, fed through
    /// [`RpcServer::serve_stream`].
    pub fn detached_server(&self, limits: ResourceLimits, options: ServerOptions) -> RpcServer<S> {
        RpcServer::detached(self.handlers.clone(), self.serializer.clone(), limits, options)
    }

    /// Connects a client for this protocol.
    pub async fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        options: ClientOptions,
    ) -> Result<RpcClient<S>> {
        RpcClient::connect(addr, self.serializer.clone(), options).await
    }

    /// Builds a client over an already-established stream.
    pub async fn connect_stream<IO>(
        &self,
        io: IO,
        peer: Option<SocketAddr>,
        options: ClientOptions,
    ) -> Result<RpcClient<S>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        RpcClient::from_stream(io, peer, self.serializer.clone(), options).await
    }
}
