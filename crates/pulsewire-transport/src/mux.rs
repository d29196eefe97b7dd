//! Connection-scoped multiplexer correlating unary responses to pending
//! requests and routing stream frames to registered handlers.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};

use pulsewire_core::{CloseStatus, Result, StreamError};

use crate::envelope::{InboundFrame, STREAM_PREFIX};

/// Receives frames routed by stream identifier plus the connection-down
/// signal. Implemented by the framed transport adapter.
pub trait StreamFrameHandler: Send + Sync {
    /// One frame addressed to this handler's stream identifier.
    fn on_stream_frame(&self, frame: InboundFrame);

    /// The connection failed; no further frames will arrive.
    fn on_connection_closed(&self, status: CloseStatus);
}

struct MuxInner {
    pending: HashMap<String, mpsc::Sender<InboundFrame>>,
    streams: HashMap<String, Arc<dyn StreamFrameHandler>>,
    next_seq: u32,
    closed: Option<StreamError>,
}

/// Routes every inbound frame of one connection to its consumer.
///
/// Unary responses resolve a pending waiter by correlation identifier; frames
/// whose identifier carries the stream prefix go to the registered stream
/// handler. Frames matching neither are logged and dropped, never surfaced as
/// failures.
pub struct Multiplexer {
    inner: Mutex<MuxInner>,
}

/// Sequence numbers occupy 6 digits and wrap before exceeding them.
const SEQ_LIMIT: u32 = 1_000_000;

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    /// Creates an empty multiplexer.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MuxInner {
                pending: HashMap::new(),
                streams: HashMap::new(),
                next_seq: 1,
                closed: None,
            }),
        }
    }

    /// Next correlation identifier: 4-digit action plus 6-digit sequence.
    /// An identifier still held by a pending request after a full sequence
    /// wrap is skipped.
    fn next_id_locked(inner: &mut MuxInner, action: u16) -> String {
        loop {
            let seq = inner.next_seq;
            inner.next_seq = if seq + 1 >= SEQ_LIMIT { 1 } else { seq + 1 };
            let id = format!("{action:04}{seq:06}");
            if !inner.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a waiter for one unary request and returns its correlation
    /// identifier together with the receiver its response will arrive on.
    pub fn register_waiter(&self, action: u16) -> Result<(String, mpsc::Receiver<InboundFrame>)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.closed {
            return Err(e.clone());
        }
        let id = Self::next_id_locked(&mut inner, action);
        let (tx, rx) = mpsc::channel();
        inner.pending.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Drops the waiter for `id`, typically after its request timed out.
    pub fn remove_waiter(&self, id: &str) {
        self.inner.lock().unwrap().pending.remove(id);
    }

    /// Generates a correlation identifier for a request whose response is
    /// intentionally not awaited.
    pub fn generate_id(&self, action: u16) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.closed {
            return Err(e.clone());
        }
        Ok(Self::next_id_locked(&mut inner, action))
    }

    /// Allocates a fresh stream identifier not currently registered.
    pub fn next_stream_id(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let seq = inner.next_seq;
            inner.next_seq = if seq + 1 >= SEQ_LIMIT { 1 } else { seq + 1 };
            let id = format!("{STREAM_PREFIX}{seq:06}");
            if !inner.streams.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a handler under a stream identifier.
    pub fn register_stream(&self, id: String, handler: Arc<dyn StreamFrameHandler>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.closed {
            return Err(e.clone());
        }
        inner.streams.insert(id, handler);
        Ok(())
    }

    /// Removes a stream registration. Safe to call repeatedly.
    pub fn deregister_stream(&self, id: &str) {
        self.inner.lock().unwrap().streams.remove(id);
    }

    /// Routes one decoded frame. The routing table lock is released before
    /// any handler runs, so handlers may re-enter the multiplexer.
    pub fn dispatch(&self, frame: InboundFrame) {
        if frame.is_stream() {
            let handler = {
                let inner = self.inner.lock().unwrap();
                inner.streams.get(&frame.request_id).cloned()
            };
            match handler {
                Some(handler) => handler.on_stream_frame(frame),
                None => tracing::debug!(
                    stream_id = %frame.request_id,
                    "stream frame with no registered handler, dropping"
                ),
            }
        } else {
            let waiter = {
                let mut inner = self.inner.lock().unwrap();
                inner.pending.remove(&frame.request_id)
            };
            match waiter {
                Some(tx) => {
                    // The waiter may have timed out and dropped its receiver.
                    let _ = tx.send(frame);
                }
                None => tracing::debug!(
                    request_id = %frame.request_id,
                    status = frame.status,
                    "response with no pending waiter, dropping"
                ),
            }
        }
    }

    /// Marks the connection failed: pending waiters wake with a disconnect,
    /// stream handlers are notified once, and later registrations fail with
    /// the recorded error.
    pub fn close(&self, error: StreamError) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(error.clone());
            // Dropping the senders wakes every pending waiter exactly once.
            inner.pending.clear();
            inner.streams.drain().map(|(_, h)| h).collect::<Vec<_>>()
        };
        for handler in handlers {
            handler.on_connection_closed(Err(error.clone()));
        }
    }

    /// Whether the connection has been marked failed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed.is_some()
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}
