//! Coordination with the external connection pool.
//!
//! The pool owns engine handles and learns about engine lifecycle through
//! the [`PoolHook`] callbacks. The engine holds the hook weakly: dropping
//! the pool must not be kept from freeing it by live connections, and a
//! torn-down engine makes no further calls.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one engine to the pool across callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    pub(crate) fn next() -> Self {
        EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Callbacks the engine makes into the pool.
pub trait PoolHook: Send + Sync {
    /// A `ReadyForQuery` arrived: the engine is idle and can take the
    /// next query.
    fn engine_ready(&self, engine: EngineId);

    /// The connection dropped to zero: the pool should forget this
    /// engine (any active query has already been failed).
    fn engine_disconnected(&self, engine: EngineId);

    /// An asynchronous `NOTIFY` arrived outside any query.
    fn notification(&self, engine: EngineId, channel: &str, payload: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_ids_are_unique() {
        let a = EngineId::next();
        let b = EngineId::next();
        assert_ne!(a, b);
    }
}
