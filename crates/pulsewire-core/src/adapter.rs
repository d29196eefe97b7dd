//! Transport seams isolating the session from asynchronous I/O scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::session::StreamEvents;
use crate::types::{Chunk, CreateProperty};

/// Capability interface a connected transport exposes to the session.
///
/// The session never branches on the transport kind; every variant hides its
/// scheduling model (dedicated reader thread, shared connection I/O thread)
/// behind this seam.
pub trait TransportAdapter: Send + Sync {
    /// Hands one chunk to the transport. Must not block on network I/O;
    /// serializes at most briefly against a concurrently in-flight write.
    fn send(&self, chunk: Chunk) -> Result<()>;

    /// Best-effort out-of-band cancellation signal. The session only reaches
    /// `Closed` once teardown is confirmed through [`StreamEvents::closed`].
    fn cancel(&self) -> Result<()>;

    /// Tears the transport down. Joins any dedicated reader thread unless
    /// invoked from that thread. Idempotent.
    fn shutdown(&self);
}

/// Factory seam that performs the transport-level handshake for one session.
///
/// Incoming transport events must be routed exclusively through the provided
/// [`StreamEvents`] handle; no raw transport callback reaches the session.
pub trait TransportConnector: Send + Sync {
    /// Opens the transport for one measurement and returns the adapter that
    /// will carry it. May synchronously perform one handshake round-trip
    /// bounded by the configured per-operation timeout.
    fn open(
        &self,
        config: &ConnectionConfig,
        study_id: &str,
        properties: &HashMap<CreateProperty, String>,
        events: StreamEvents,
    ) -> Result<Arc<dyn TransportAdapter>>;
}
