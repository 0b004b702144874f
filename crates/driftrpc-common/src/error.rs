use thiserror::Error;

/// Errors surfaced by the RPC engine.
///
/// `Closed`, `Timeout` and `Canceled` are local outcomes that complete a
/// single call. `Protocol` poisons the connection that produced it.
/// `Remote` and `UnknownVerb` carry failures reported by the peer and leave
/// the connection healthy.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,

    #[error("call timed out")]
    Timeout,

    #[error("call canceled")]
    Canceled,

    #[error("unknown verb {0}")]
    UnknownVerb(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
