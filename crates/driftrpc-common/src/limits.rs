//! Per-connection memory budget for in-flight requests.

/// Fixed bookkeeping cost charged per admitted request on top of its
/// payload length.
pub const REQUEST_OVERHEAD: usize = 256;

/// Admission weight of the unknown-verb exception reply, the size of the
/// frame it produces.
pub const UNKNOWN_VERB_REPLY_WEIGHT: usize = 28;

/// Admission weight of a request with the given payload length.
pub fn estimate_request_size(payload_len: usize) -> usize {
    payload_len + REQUEST_OVERHEAD
}

/// Memory budget shared by all in-flight requests of one connection.
///
/// The server's read path waits for this many bytes to be available before
/// dispatching a request and returns them once the reply has been handed to
/// the writer, so a flood of large requests suspends the read loop instead
/// of exhausting memory.
///
/// # Example
///
/// ```
/// use driftrpc_common::limits::ResourceLimits;
///
/// let limits = ResourceLimits::new().with_max_memory(4 * 1024 * 1024);
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Total budget in bytes.
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_memory: 10 * 1024 * 1024 }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_memory == 0 {
            return Err("max_memory must be greater than zero".to_string());
        }
        if self.max_memory < UNKNOWN_VERB_REPLY_WEIGHT {
            return Err(format!(
                "max_memory must be at least {UNKNOWN_VERB_REPLY_WEIGHT} bytes"
            ));
        }
        Ok(())
    }
}
