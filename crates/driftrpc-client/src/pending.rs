//! The pending-reply map.
//!
//! Each wait-mode call installs a one-shot completion keyed by its message
//! id. Removing the entry transfers completion ownership to the remover:
//! the read loop completes it with the decoded reply, while timeout,
//! cancellation and teardown simply drop it, which resolves the caller
//! with a closed error through the one-shot channel.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use driftrpc_common::error::Result;

/// Completes one call with the signed message id and reply payload.
/// Returns an error when the reply cannot be decoded, which poisons the
/// connection.
pub(crate) type ReplyCompletion = Box<dyn FnOnce(i64, Bytes) -> Result<()> + Send>;

#[derive(Default)]
pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<i64, ReplyCompletion>>,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, msg_id: i64, completion: ReplyCompletion) {
        let previous = self.entries.lock().unwrap().insert(msg_id, completion);
        debug_assert!(previous.is_none(), "message id {msg_id} reused");
    }

    pub(crate) fn remove(&self, msg_id: i64) -> Option<ReplyCompletion> {
        self.entries.lock().unwrap().remove(&msg_id)
    }

    /// Takes every entry, leaving the map empty. Dropping the returned
    /// completions resolves every still-pending call with a closed error.
    pub(crate) fn drain(&self) -> Vec<ReplyCompletion> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain().map(|(_, completion)| completion).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
