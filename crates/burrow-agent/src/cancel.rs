//! Per-request cancellation table
//!
//! Keyed by transaction id; entries live exactly as long as the request
//! they belong to. A `CancelRequest` from the controller fires the token,
//! which aborts the in-flight HTTP call or kills the child process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancelTable {
    inner: Arc<DashMap<String, CancellationToken>>,
}

/// A scoped entry in the table; dropping it unregisters the id.
pub struct Registration {
    table: CancelTable,
    id: String,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.inner.remove(&self.id);
    }
}

impl CancelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> Registration {
        let token = CancellationToken::new();
        self.inner.insert(id.to_string(), token.clone());
        Registration {
            table: self.clone(),
            id: id.to_string(),
            token,
        }
    }

    /// Fire the cancellation for a request, if it is still running.
    pub fn cancel(&self, id: &str) {
        if let Some((_, token)) = self.inner.remove(id) {
            tracing::debug!(request_id = %id, "Cancelling in-flight request");
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
