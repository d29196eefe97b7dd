//! Transport adapter for completion-queue RPC streaming backends.
//!
//! The backend exposes one bidirectional stream per measurement through an
//! asynchronous operation queue: every `start`, `write`, `read`, and `finish`
//! completes later as an event on the queue. A dedicated reader thread drains
//! the queue, keeps exactly one read and at most one write in flight, and
//! drives the half-close and finish sequence when the stream winds down.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pulsewire_core::{
    Chunk, CloseStatus, ConnectionConfig, CreateProperty, MeasurementMetric, MeasurementResult,
    MeasurementWarning, Result, StreamError, StreamEvents, TransportAdapter, TransportConnector,
};

use crate::codec::ChunkAction;

/// One outbound message on the bidirectional stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    /// Stream setup message, sent once before any chunk.
    Settings {
        /// Study the measurement belongs to.
        study_id: String,
    },
    /// One payload chunk.
    Chunk {
        /// Server-assigned measurement identifier.
        session_id: String,
        /// Position of the chunk within the measurement.
        action: ChunkAction,
        /// Sequence number assigned by the session.
        chunk_order: u64,
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
}

/// One inbound message read off the bidirectional stream.
#[derive(Debug, Clone)]
pub enum RpcResponse {
    /// Server-assigned measurement identifier; arrives first.
    SessionId(String),
    /// One processed chunk result.
    Result(MeasurementResult),
    /// One throughput metric.
    Metric(MeasurementMetric),
    /// One non-fatal warning.
    Warning(MeasurementWarning),
}

/// Completion of one previously issued stream operation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// `start` completed; `false` means the stream never came up.
    StartDone(bool),
    /// `write` completed; `false` means the write side is broken.
    WriteDone(bool),
    /// `read` completed; `None` means the server finished sending.
    ReadDone(Option<RpcResponse>),
    /// `writes_done` completed.
    WritesDone(bool),
    /// `finish` completed with the server's terminal status. Always the
    /// last event of a stream.
    FinishDone(CloseStatus),
}

/// Outcome of waiting on the completion queue.
#[derive(Debug, Clone)]
pub enum QueueOutcome {
    /// One operation completed.
    Event(StreamEvent),
    /// Nothing completed within the deadline.
    Timeout,
    /// The queue was shut down; no further events will arrive.
    Shutdown,
}

/// One bidirectional measurement stream driven through a completion queue.
///
/// Every method issues an operation whose completion arrives later through
/// `next`; only `try_cancel` takes effect out of band.
pub trait RpcStream: Send + Sync {
    /// Initiates the stream.
    fn start(&self);

    /// Issues one write. At most one write may be outstanding.
    fn write(&self, request: RpcRequest);

    /// Half-closes the write side.
    fn writes_done(&self);

    /// Issues one read. At most one read may be outstanding.
    fn read(&self);

    /// Requests the terminal status. Issued once, after both sides ended.
    fn finish(&self);

    /// Best-effort out-of-band cancellation.
    fn try_cancel(&self);

    /// Blocks for the next completion, up to `deadline`.
    fn next(&self, deadline: Duration) -> QueueOutcome;
}

/// Dials one RPC stream per measurement.
pub trait RpcDialer: Send + Sync {
    /// Establishes a stream to the configured host.
    fn dial(&self, config: &ConnectionConfig) -> Result<Arc<dyn RpcStream>>;
}

/// Opens measurements over a completion-queue RPC backend.
pub struct RpcConnector<D> {
    dialer: D,
}

impl<D: RpcDialer> RpcConnector<D> {
    /// Creates a connector that dials through `dialer`.
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }

    fn await_setup(
        stream: &dyn RpcStream,
        timeout: Duration,
        phase: &str,
    ) -> Result<StreamEvent> {
        match stream.next(timeout) {
            QueueOutcome::Event(event) => Ok(event),
            QueueOutcome::Timeout => Err(StreamError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            QueueOutcome::Shutdown => Err(StreamError::transport_closed(format!(
                "completion queue shut down during {phase}"
            ))),
        }
    }
}

impl<D: RpcDialer> TransportConnector for RpcConnector<D> {
    fn open(
        &self,
        config: &ConnectionConfig,
        study_id: &str,
        _properties: &HashMap<CreateProperty, String>,
        events: StreamEvents,
    ) -> Result<Arc<dyn TransportAdapter>> {
        let stream = self.dialer.dial(config)?;
        let timeout = config.timeout();

        stream.start();
        match Self::await_setup(stream.as_ref(), timeout, "start")? {
            StreamEvent::StartDone(true) => {}
            StreamEvent::StartDone(false) => {
                return Err(StreamError::transport("stream failed to start"))
            }
            other => {
                return Err(StreamError::protocol(format!(
                    "unexpected completion during start: {other:?}"
                )))
            }
        }

        stream.write(RpcRequest::Settings {
            study_id: study_id.to_string(),
        });
        match Self::await_setup(stream.as_ref(), timeout, "settings write")? {
            StreamEvent::WriteDone(true) => {}
            StreamEvent::WriteDone(false) => {
                return Err(StreamError::transport("settings write failed"))
            }
            other => {
                return Err(StreamError::protocol(format!(
                    "unexpected completion during settings write: {other:?}"
                )))
            }
        }
        tracing::debug!(study_id, "rpc stream established");

        let adapter = Arc::new(ReaderThreadAdapter {
            stream,
            events,
            send: Mutex::new(RpcSendState::default()),
            reader: Mutex::new(None),
        });
        let worker = adapter.clone();
        let handle = thread::Builder::new()
            .name("pulsewire-rpc-reader".into())
            .spawn(move || worker.reader_loop(timeout))
            .map_err(|e| StreamError::internal(format!("spawn reader thread: {e}")))?;
        *adapter.reader.lock().unwrap() = Some(handle);
        Ok(adapter)
    }
}

struct QueuedChunk {
    action: ChunkAction,
    order: u64,
    payload: Vec<u8>,
}

#[derive(Default)]
struct RpcSendState {
    session_id: Option<String>,
    sending: bool,
    writes_done_sent: bool,
    last_chunk_sent: bool,
    queue: VecDeque<QueuedChunk>,
}

/// Adapter owning one RPC stream and the reader thread that drains its
/// completion queue.
///
/// Writes are strictly serialized: one in flight, the rest queued until its
/// completion arrives. Chunks submitted before the server has assigned the
/// measurement identifier are queued and flushed once it arrives.
pub struct ReaderThreadAdapter {
    stream: Arc<dyn RpcStream>,
    events: StreamEvents,
    send: Mutex<RpcSendState>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReaderThreadAdapter {
    fn chunk_request(session_id: String, chunk: QueuedChunk) -> RpcRequest {
        RpcRequest::Chunk {
            session_id,
            action: chunk.action,
            chunk_order: chunk.order,
            payload: chunk.payload,
        }
    }

    /// Half-closes the write side once. Returns whether this call issued it.
    fn half_close(&self) -> bool {
        let mut send = self.send.lock().unwrap();
        if send.writes_done_sent {
            return false;
        }
        send.writes_done_sent = true;
        drop(send);
        self.stream.writes_done();
        true
    }

    fn on_session_id(&self, id: &str) {
        let mut send = self.send.lock().unwrap();
        send.session_id = Some(id.to_string());
        if !send.sending && !send.writes_done_sent {
            if let Some(chunk) = send.queue.pop_front() {
                send.sending = true;
                let request = Self::chunk_request(id.to_string(), chunk);
                drop(send);
                self.stream.write(request);
            }
        }
    }

    fn on_write_done(&self) {
        let mut send = self.send.lock().unwrap();
        if send.writes_done_sent {
            return;
        }
        if let Some(chunk) = send.queue.pop_front() {
            let session_id = send.session_id.clone().unwrap_or_default();
            let request = Self::chunk_request(session_id, chunk);
            drop(send);
            self.stream.write(request);
        } else {
            send.sending = false;
            if send.last_chunk_sent {
                send.writes_done_sent = true;
                drop(send);
                self.stream.writes_done();
            }
        }
    }

    fn on_response(&self, response: RpcResponse) {
        match response {
            RpcResponse::SessionId(id) => {
                self.on_session_id(&id);
                self.events.session_id(id);
            }
            RpcResponse::Result(result) => {
                self.events.result(result);
                // Results acknowledge the corresponding chunk upload.
                self.events.chunk_acknowledged();
            }
            RpcResponse::Metric(metric) => self.events.metric(metric),
            RpcResponse::Warning(warning) => self.events.warning(warning),
        }
    }

    fn reader_loop(&self, op_timeout: Duration) {
        self.stream.read();
        let mut status: CloseStatus = Ok(());
        let mut reads_ended = false;
        let mut finish_sent = false;
        loop {
            match self.stream.next(op_timeout) {
                QueueOutcome::Timeout => {
                    if status.is_ok() {
                        status = Err(StreamError::Timeout {
                            timeout_ms: op_timeout.as_millis() as u64,
                        });
                    }
                    // Half-close proactively so the server finishes the
                    // stream instead of both sides waiting each other out.
                    self.half_close();
                }
                QueueOutcome::Shutdown => {
                    if status.is_ok() {
                        status = Err(StreamError::transport_closed("completion queue shut down"));
                    }
                    break;
                }
                QueueOutcome::Event(event) => match event {
                    StreamEvent::ReadDone(Some(response)) => {
                        self.on_response(response);
                        self.stream.read();
                    }
                    StreamEvent::ReadDone(None) => {
                        reads_ended = true;
                        if !self.half_close() && !finish_sent {
                            finish_sent = true;
                            self.stream.finish();
                        }
                    }
                    StreamEvent::WriteDone(true) => self.on_write_done(),
                    StreamEvent::WriteDone(false) => {
                        if !self.half_close() && !finish_sent {
                            finish_sent = true;
                            self.stream.finish();
                        }
                    }
                    StreamEvent::WritesDone(_) => {
                        if reads_ended && !finish_sent {
                            finish_sent = true;
                            self.stream.finish();
                        }
                    }
                    StreamEvent::StartDone(_) => {
                        // Consumed during setup; a stray completion is
                        // harmless.
                    }
                    StreamEvent::FinishDone(final_status) => {
                        if status.is_ok() {
                            status = final_status;
                        }
                        break;
                    }
                },
            }
        }
        tracing::debug!(status = ?status, "rpc reader thread exiting");
        self.events.closed(status);
    }
}

impl TransportAdapter for ReaderThreadAdapter {
    fn send(&self, chunk: Chunk) -> Result<()> {
        let action = ChunkAction::for_chunk(&chunk);
        let mut send = self.send.lock().unwrap();
        if send.writes_done_sent {
            return Err(StreamError::transport("write side already half-closed"));
        }
        if chunk.is_last {
            send.last_chunk_sent = true;
        }
        let queued = QueuedChunk {
            action,
            order: chunk.order,
            payload: chunk.payload,
        };
        match send.session_id.clone() {
            Some(session_id) if !send.sending => {
                send.sending = true;
                drop(send);
                self.stream
                    .write(Self::chunk_request(session_id, queued));
            }
            // Either a write is in flight or the identifier has not arrived
            // yet; the reader thread flushes the queue as both resolve.
            _ => send.queue.push_back(queued),
        }
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        self.stream.try_cancel();
        Ok(())
    }

    fn shutdown(&self) {
        self.stream.try_cancel();
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            // The reader thread closes the session itself; joining it from
            // itself would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
