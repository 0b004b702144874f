//! driftrpc server: acceptor, per-connection dispatch, resource admission.
//!
//! The server side of a connection reads request frames, admits each one
//! against the connection's memory budget, decodes the arguments and runs
//! the registered handler under the reply gate. Wait-mode handlers produce
//! exactly one response frame (value or exception); no-wait handlers
//! produce none. Handlers run concurrently with the read loop, so slow
//! handlers delay their own reply but not other requests; backpressure
//! comes from the memory budget, which suspends the read loop when
//! exhausted.
//!
//! # Main components
//!
//! - [`RpcServer`] - accept loop and connection set
//! - [`HandlerRegistry`] - message-type to handler map
//! - [`ServerConnection`] - the per-connection handle handlers run against
//! - [`Gate`] - the teardown barrier counting in-flight handlers

pub mod connection;
pub mod dispatch;
pub mod gate;
pub mod resources;
pub mod server;

pub use connection::ServerConnection;
pub use dispatch::{ClientInfo, HandlerRegistry, HandlerThunk};
pub use gate::{Gate, GateGuard};
pub use resources::ConnectionResources;
pub use server::{RpcServer, ServerOptions};
