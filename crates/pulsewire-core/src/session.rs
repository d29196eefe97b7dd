//! Per-measurement session state machine coordinating chunk upload and
//! asynchronous result delivery.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::adapter::{TransportAdapter, TransportConnector};
use crate::config::ConnectionConfig;
use crate::dispatch::Dispatcher;
use crate::error::{CloseStatus, Result, StreamError};
use crate::types::{Chunk, CreateProperty, MeasurementMetric, MeasurementResult, MeasurementWarning};
use crate::validator;

/// Lifecycle of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed or reset; no transport assigned.
    Created,
    /// Stream opened; chunks may be sent.
    Active,
    /// Close decided; transport teardown in progress.
    Closing,
    /// Terminal. `reset` returns the session to `Created`.
    Closed,
}

struct StateInner {
    state: SessionState,
    session_id: String,
    chunk_order: u64,
    last_chunk_sent: bool,
    outstanding_chunks: u64,
    close_status: Option<CloseStatus>,
    adapter: Option<Arc<dyn TransportAdapter>>,
}

impl StateInner {
    fn fresh() -> Self {
        Self {
            state: SessionState::Created,
            session_id: String::new(),
            chunk_order: 0,
            last_chunk_sent: false,
            outstanding_chunks: 0,
            close_status: None,
            adapter: None,
        }
    }
}

struct SessionCore {
    state: Mutex<StateInner>,
    state_changed: Condvar,
    // Serializes the order-assignment-to-adapter hand-off; held across the
    // adapter call so transmission order equals assignment order.
    send_lock: Mutex<()>,
    session_ids: Dispatcher<String>,
    results: Dispatcher<MeasurementResult>,
    metrics: Dispatcher<MeasurementMetric>,
    warnings: Dispatcher<MeasurementWarning>,
}

impl SessionCore {
    /// Records the terminal status (first writer wins), tears the adapter
    /// down outside the state lock, and wakes every waiter exactly once.
    ///
    /// A losing closer returns the recorded status immediately rather than
    /// blocking, so a closer running on the transport's own reader thread can
    /// never deadlock against a thread joining that reader.
    fn close_with(&self, status: CloseStatus) -> CloseStatus {
        let adapter = {
            let mut s = self.state.lock().unwrap();
            if let Some(recorded) = s.close_status.clone() {
                return recorded;
            }
            s.close_status = Some(status.clone());
            s.state = SessionState::Closing;
            s.adapter.take()
        };

        // Teardown may join a reader thread; never hold the state lock here.
        if let Some(adapter) = adapter {
            adapter.shutdown();
        }

        {
            let mut s = self.state.lock().unwrap();
            s.state = SessionState::Closed;
        }
        self.state_changed.notify_all();

        self.session_ids.close(status.clone());
        self.results.close(status.clone());
        self.metrics.close(status.clone());
        self.warnings.close(status.clone());

        tracing::debug!(status = ?status, "measurement closed");
        status
    }

    fn handle_session_id(&self, id: String) {
        {
            let mut s = self.state.lock().unwrap();
            if !s.session_id.is_empty() {
                // Only the first server assignment is surfaced.
                return;
            }
            s.session_id = id.clone();
        }
        self.session_ids.handle(id);
    }

    fn handle_chunk_ack(&self) {
        let should_close = {
            let mut s = self.state.lock().unwrap();
            s.outstanding_chunks = s.outstanding_chunks.saturating_sub(1);
            s.state == SessionState::Active && s.last_chunk_sent && s.outstanding_chunks == 0
        };
        if should_close {
            // All chunks acknowledged after the last one was sent.
            self.close_with(Ok(()));
        }
    }
}

/// Event boundary through which a transport adapter feeds its session.
///
/// Holds a weak reference; events arriving after the session is dropped are
/// discarded. Cloneable so an adapter can hand it to its I/O path.
#[derive(Clone)]
pub struct StreamEvents {
    core: Weak<SessionCore>,
}

impl StreamEvents {
    /// Delivers the server-assigned session identifier.
    pub fn session_id(&self, id: String) {
        if let Some(core) = self.core.upgrade() {
            core.handle_session_id(id);
        }
    }

    /// Delivers one processed result.
    pub fn result(&self, result: MeasurementResult) {
        if let Some(core) = self.core.upgrade() {
            core.results.handle(result);
        }
    }

    /// Delivers one throughput metric.
    pub fn metric(&self, metric: MeasurementMetric) {
        if let Some(core) = self.core.upgrade() {
            core.metrics.handle(metric);
        }
    }

    /// Delivers one non-fatal warning. Never affects session state.
    pub fn warning(&self, warning: MeasurementWarning) {
        if let Some(core) = self.core.upgrade() {
            core.warnings.handle(warning);
        }
    }

    /// Records that one sent chunk has been acknowledged. After the last
    /// chunk is sent and every chunk is acknowledged, the session closes
    /// with `Ok`.
    pub fn chunk_acknowledged(&self) {
        if let Some(core) = self.core.upgrade() {
            core.handle_chunk_ack();
        }
    }

    /// Closes the session with the given terminal status. Exactly one close
    /// takes effect; later calls are no-ops.
    pub fn closed(&self, status: CloseStatus) {
        if let Some(core) = self.core.upgrade() {
            core.close_with(status);
        }
    }

    /// Whether the session has already decided its terminal status.
    pub fn is_closed(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.state.lock().unwrap().close_status.is_some(),
            None => true,
        }
    }
}

/// The per-measurement state machine.
///
/// Chunks are sequenced here (`order` strictly increasing from 0), handed to
/// the transport adapter without blocking on network I/O, and results come
/// back asynchronously through four dispatchers that callers drain either by
/// registered callback or by bounded polling. Registered callbacks run on
/// the transport's I/O thread and must not re-enter the channel they are
/// registered on (see [`Dispatcher`]).
pub struct MeasurementStream {
    core: Arc<SessionCore>,
}

impl Default for MeasurementStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementStream {
    /// Creates a session in the `Created` state.
    pub fn new() -> Self {
        Self {
            core: Arc::new(SessionCore {
                state: Mutex::new(StateInner::fresh()),
                state_changed: Condvar::new(),
                send_lock: Mutex::new(()),
                session_ids: Dispatcher::new(),
                results: Dispatcher::new(),
                metrics: Dispatcher::new(),
                warnings: Dispatcher::new(),
            }),
        }
    }

    /// Opens the stream through the given connector.
    ///
    /// Fails with `AlreadyActive` unless the session is in `Created`, and
    /// with a validation error before any network action if required context
    /// fields are empty. On success the session is `Active` and owns the
    /// returned adapter for its lifetime.
    pub fn open(
        &self,
        config: &ConnectionConfig,
        study_id: &str,
        properties: &HashMap<CreateProperty, String>,
        connector: &dyn TransportConnector,
    ) -> Result<()> {
        validator::validate_stream_setup(config, study_id)?;

        {
            let mut s = self.core.state.lock().unwrap();
            if s.state != SessionState::Created {
                return Err(StreamError::AlreadyActive);
            }
            s.state = SessionState::Active;
        }

        let events = StreamEvents {
            core: Arc::downgrade(&self.core),
        };

        // The handshake may block up to the configured timeout; the state
        // lock is not held so transport events can land meanwhile.
        match connector.open(config, study_id, properties, events) {
            Ok(adapter) => {
                let mut s = self.core.state.lock().unwrap();
                if s.state != SessionState::Active {
                    // Closed while the handshake was still in flight.
                    let status = s.close_status.clone();
                    drop(s);
                    adapter.shutdown();
                    return Err(match status {
                        Some(Err(e)) => e,
                        _ => StreamError::AlreadyClosed,
                    });
                }
                s.adapter = Some(adapter);
                Ok(())
            }
            Err(e) => {
                let mut s = self.core.state.lock().unwrap();
                if s.close_status.is_none() {
                    s.state = SessionState::Created;
                }
                Err(e)
            }
        }
    }

    /// Sequences and sends one payload chunk.
    ///
    /// Assigns the next `order`, marks first/last flags, and hands the chunk
    /// to the adapter. Never blocks on network I/O; concurrent callers
    /// serialize so the adapter observes chunks in assignment order. A
    /// transport failure closes the session with the triggering status.
    pub fn send_chunk(&self, payload: Vec<u8>, is_last: bool) -> Result<()> {
        let _sending = self.core.send_lock.lock().unwrap();
        let (chunk, adapter) = {
            let mut s = self.core.state.lock().unwrap();
            match s.state {
                SessionState::Closing | SessionState::Closed => {
                    return Err(StreamError::AlreadyClosed)
                }
                SessionState::Created => {
                    return Err(StreamError::validation("stream has not been opened"))
                }
                SessionState::Active => {}
            }
            if s.last_chunk_sent {
                return Err(StreamError::validation("last chunk already sent"));
            }
            let adapter = match s.adapter.clone() {
                Some(adapter) => adapter,
                None => return Err(StreamError::validation("stream has not been opened")),
            };
            let order = s.chunk_order;
            s.chunk_order += 1;
            if is_last {
                s.last_chunk_sent = true;
            }
            s.outstanding_chunks += 1;
            (
                Chunk {
                    payload,
                    order,
                    is_first: order == 0,
                    is_last,
                },
                adapter,
            )
        };

        if let Err(e) = adapter.send(chunk) {
            tracing::warn!(error = %e, "chunk send failed, closing measurement");
            self.core.close_with(Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Signals cancellation intent to the server. Best effort and
    /// asynchronous; a no-op once the session has decided its close status.
    pub fn cancel(&self) -> Result<()> {
        let adapter = {
            let s = self.core.state.lock().unwrap();
            if s.close_status.is_some() {
                return Ok(());
            }
            s.adapter.clone()
        };
        match adapter {
            Some(adapter) => adapter.cancel(),
            None => Ok(()),
        }
    }

    /// Closes the session with the given status. Idempotent: the first
    /// caller records the status, later calls return the recorded value.
    pub fn close(&self, status: CloseStatus) -> CloseStatus {
        self.core.close_with(status)
    }

    /// Reinitializes a `Closed` session for reuse: counters zeroed, queued
    /// but undelivered messages discarded, state back to `Created`.
    pub fn reset(&self) -> Result<()> {
        {
            let mut s = self.core.state.lock().unwrap();
            if s.state != SessionState::Closed {
                return Err(StreamError::validation(
                    "reset requires a closed measurement",
                ));
            }
            *s = StateInner::fresh();
        }
        self.core.session_ids.reset();
        self.core.results.reset();
        self.core.metrics.reset();
        self.core.warnings.reset();
        Ok(())
    }

    /// Blocks until the session is `Closed` or the timeout elapses; `None`
    /// waits indefinitely. Returns the recorded close status.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> CloseStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut s = self.core.state.lock().unwrap();
        while s.state != SessionState::Closed {
            s = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StreamError::Timeout {
                            timeout_ms: timeout.unwrap_or_default().as_millis() as u64,
                        });
                    }
                    let (guard, _) = self
                        .core
                        .state_changed
                        .wait_timeout(s, deadline - now)
                        .unwrap();
                    guard
                }
                None => self.core.state_changed.wait(s).unwrap(),
            };
        }
        s.close_status.clone().unwrap_or(Ok(()))
    }

    /// An event handle bound to this session, as handed to connectors during
    /// `open`. Useful for transports that assemble adapters out of band.
    pub fn events(&self) -> StreamEvents {
        StreamEvents {
            core: Arc::downgrade(&self.core),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.state.lock().unwrap().state
    }

    /// The server-assigned session identifier, empty until assigned.
    pub fn session_id(&self) -> String {
        self.core.state.lock().unwrap().session_id.clone()
    }

    /// Polls for the server-assigned session identifier.
    pub fn poll_session_id(&self, timeout: Option<Duration>) -> Result<String> {
        self.core.session_ids.poll(timeout)
    }

    /// Polls for the next processed result.
    pub fn poll_result(&self, timeout: Option<Duration>) -> Result<MeasurementResult> {
        self.core.results.poll(timeout)
    }

    /// Polls for the next throughput metric.
    pub fn poll_metric(&self, timeout: Option<Duration>) -> Result<MeasurementMetric> {
        self.core.metrics.poll(timeout)
    }

    /// Polls for the next warning.
    pub fn poll_warning(&self, timeout: Option<Duration>) -> Result<MeasurementWarning> {
        self.core.warnings.poll(timeout)
    }

    /// Registers a session-identifier callback, flushing any backlog.
    pub fn set_session_id_callback(&self, callback: impl Fn(String) + Send + 'static) {
        self.core.session_ids.set_callback(callback);
    }

    /// Registers a result callback, flushing any backlog in order.
    pub fn set_result_callback(&self, callback: impl Fn(MeasurementResult) + Send + 'static) {
        self.core.results.set_callback(callback);
    }

    /// Registers a metric callback, flushing any backlog.
    pub fn set_metric_callback(&self, callback: impl Fn(MeasurementMetric) + Send + 'static) {
        self.core.metrics.set_callback(callback);
    }

    /// Registers a warning callback, flushing any backlog.
    pub fn set_warning_callback(&self, callback: impl Fn(MeasurementWarning) + Send + 'static) {
        self.core.warnings.set_callback(callback);
    }
}
