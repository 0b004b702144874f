//! The accepting server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use driftrpc_common::compress::CompressorFactory;
use driftrpc_common::error::Result;
use driftrpc_common::limits::ResourceLimits;
use driftrpc_common::marshal::Serializer;

use crate::connection::run_connection;
use crate::dispatch::HandlerRegistry;
use crate::resources::ConnectionResources;

/// Server-side connection options.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// When set, connections accept the COMPRESS feature from peers the
    /// factory agrees with.
    pub compressor_factory: Option<Arc<dyn CompressorFactory>>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compressor_factory(mut self, factory: Arc<dyn CompressorFactory>) -> Self {
        self.compressor_factory = Some(factory);
        self
    }
}

struct ConnEntry {
    resources: Arc<ConnectionResources>,
}

struct ServerInner<S> {
    handlers: Arc<HandlerRegistry<S>>,
    serializer: Arc<S>,
    limits: ResourceLimits,
    options: ServerOptions,
    connections: Mutex<HashMap<u64, ConnEntry>>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
    drained: Notify,
}

impl<S: Serializer> ServerInner<S> {
    fn spawn_connection<IO>(self: &Arc<Self>, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let resources = Arc::new(ConnectionResources::new(self.limits));
        self.connections
            .lock()
            .unwrap()
            .insert(conn_id, ConnEntry { resources: resources.clone() });

        let inner = self.clone();
        tokio::spawn(async move {
            run_connection(
                io,
                peer,
                inner.handlers.clone(),
                inner.serializer.clone(),
                resources,
                inner.options.compressor_factory.clone(),
                token,
            )
            .await;
            inner.connections.lock().unwrap().remove(&conn_id);
            inner.drained.notify_waiters();
        });
    }
}

/// Accepts connections and serves the handlers of its registry.
///
/// Every accepted socket gets Nagle disabled, its own connection state and
/// its own tasks; the server only tracks connections so that [`stop`]
/// can tear them down and wait for quiescence.
///
/// [`stop`]: RpcServer::stop
pub struct RpcServer<S> {
    inner: Arc<ServerInner<S>>,
    local_addr: Option<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Serializer> RpcServer<S> {
    /// Binds a TCP listener and starts the accept loop. An accept failure
    /// logs, stops the loop and leaves existing connections running.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        handlers: Arc<HandlerRegistry<S>>,
        serializer: Arc<S>,
        limits: ResourceLimits,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Self::detached(handlers, serializer, limits, options);

        let inner = server.inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::warn!(peer = %peer, "set_nodelay failed: {e}");
                            }
                            inner.spawn_connection(stream, peer);
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                            break;
                        }
                    },
                }
            }
        });

        *server.accept_task.lock().unwrap() = Some(accept_task);
        Ok(Self { local_addr: Some(local_addr), ..server })
    }

    /// Creates a server without a listener; connections are fed in through
    /// [`serve_stream`](RpcServer::serve_stream).
    pub fn detached(
        handlers: Arc<HandlerRegistry<S>>,
        serializer: Arc<S>,
        limits: ResourceLimits,
        options: ServerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handlers,
                serializer,
                limits,
                options,
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                drained: Notify::new(),
            }),
            local_addr: None,
            accept_task: Mutex::new(None),
        }
    }

    /// The bound address, when the server was constructed with
    /// [`bind`](RpcServer::bind).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serves one already-established stream as a connection.
    pub fn serve_stream<IO>(&self, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.inner.spawn_connection(io, peer);
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// `(available, budget)` of every live connection's memory counter.
    /// A connection with no request in flight reports its full budget.
    pub fn connection_memory(&self) -> Vec<(usize, usize)> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .values()
            .map(|entry| (entry.resources.available(), entry.resources.max_memory()))
            .collect()
    }

    /// Stops accepting, tears down every connection and waits until all of
    /// them have fully stopped.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.connections.lock().unwrap().is_empty() {
                return;
            }
            drained.await;
        }
    }
}
