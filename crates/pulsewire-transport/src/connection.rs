//! One multiplexed connection: request/response plumbing over a raw channel.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;
use pulsewire_core::{Result, StreamError};

use crate::channel::RawChannel;
use crate::envelope::{self, ActionCode};
use crate::mux::{Multiplexer, StreamFrameHandler};

/// Inbound half of a connection, handed to the raw channel at construction.
/// The channel's read path pushes every received frame and the terminal
/// failure through this sink.
#[derive(Clone)]
pub struct ChannelSink {
    mux: Arc<Multiplexer>,
}

impl ChannelSink {
    /// Delivers one length-delimited frame read off the wire.
    ///
    /// An undecodable frame means the framing itself is corrupt, so the
    /// whole connection is failed rather than the frame skipped.
    pub fn frame(&self, bytes: Bytes) {
        match envelope::decode_frame(bytes) {
            Ok(frame) => self.mux.dispatch(frame),
            Err(e) => {
                tracing::warn!(error = %e, "failing connection on undecodable frame");
                self.mux.close(e);
            }
        }
    }

    /// Reports that the channel is down. Idempotent.
    pub fn closed(&self, error: StreamError) {
        self.mux.close(error);
    }
}

/// A multiplexed client connection shared by any number of measurements.
///
/// Unary requests block their calling thread until the correlated response
/// arrives or the per-operation timeout elapses; stream traffic flows to
/// handlers registered by identifier.
pub struct Connection {
    mux: Arc<Multiplexer>,
    channel: Arc<dyn RawChannel>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a connection over the channel produced by `build`, wiring the
    /// channel's read path into this connection's multiplexer.
    pub fn open<F>(build: F) -> Result<Arc<Self>>
    where
        F: FnOnce(ChannelSink) -> Result<Arc<dyn RawChannel>>,
    {
        let mux = Arc::new(Multiplexer::new());
        let channel = build(ChannelSink { mux: mux.clone() })?;
        Ok(Arc::new(Self { mux, channel }))
    }

    /// Sends one unary request and blocks for its response payload.
    ///
    /// On timeout the waiter is deregistered so a late response is dropped
    /// instead of resolving a stale receiver.
    pub fn send_and_await(
        &self,
        action: ActionCode,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        let (id, rx) = self.mux.register_waiter(action.code())?;
        let frame = envelope::encode_request(action.code(), &id, payload);
        tracing::trace!(
            action = action.code(),
            request_id = %id,
            len = frame.len(),
            "sending unary request"
        );
        if let Err(e) = self.channel.send(frame) {
            self.mux.remove_waiter(&id);
            return Err(e);
        }
        match rx.recv_timeout(timeout) {
            Ok(frame) => frame.into_payload(),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.mux.remove_waiter(&id);
                Err(StreamError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StreamError::transport_closed(
                "connection failed while awaiting response",
            )),
        }
    }

    /// Sends one request without waiting for a response. The server's
    /// acknowledgement, if any, is dropped by the multiplexer.
    pub fn send_oneway(&self, action: ActionCode, payload: &[u8]) -> Result<()> {
        let id = self.mux.generate_id(action.code())?;
        self.channel
            .send(envelope::encode_request(action.code(), &id, payload))
    }

    /// Allocates a stream identifier for a new subscription.
    pub fn next_stream_id(&self) -> String {
        self.mux.next_stream_id()
    }

    /// Registers a handler to receive frames for `id`.
    pub fn register_stream(&self, id: String, handler: Arc<dyn StreamFrameHandler>) -> Result<()> {
        self.mux.register_stream(id, handler)
    }

    /// Removes a stream registration.
    pub fn deregister_stream(&self, id: &str) {
        self.mux.deregister_stream(id)
    }

    /// Whether the connection has failed.
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Closes the channel and fails every consumer of this connection.
    pub fn close(&self) {
        self.channel.close();
        self.mux
            .close(StreamError::transport_closed("connection closed by client"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::REQUEST_ID_LEN;
    use bytes::{BufMut, BytesMut};
    use std::sync::Mutex;

    /// Channel double that records outbound frames and lets the test feed
    /// responses back through the sink.
    struct RecordingChannel {
        sent: Mutex<Vec<Bytes>>,
    }

    impl RawChannel for RecordingChannel {
        fn send(&self, frame: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {}
    }

    fn respond(sink: &ChannelSink, request_id: &str, status: u16, payload: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_slice(request_id.as_bytes());
        buf.put_slice(format!("{status:03}").as_bytes());
        buf.put_slice(payload);
        sink.frame(buf.freeze());
    }

    fn open_recording() -> (Arc<Connection>, Arc<RecordingChannel>, ChannelSink) {
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let sink_slot: Mutex<Option<ChannelSink>> = Mutex::new(None);
        let raw = channel.clone();
        let connection = Connection::open(|sink| {
            *sink_slot.lock().unwrap() = Some(sink);
            Ok(raw as Arc<dyn RawChannel>)
        })
        .unwrap();
        let sink = sink_slot.into_inner().unwrap().unwrap();
        (connection, channel, sink)
    }

    #[test]
    fn test_unary_round_trip() {
        let (connection, channel, sink) = open_recording();

        let caller = std::thread::spawn({
            let connection = connection.clone();
            move || {
                connection.send_and_await(
                    ActionCode::CreateMeasurement,
                    b"{}",
                    Duration::from_secs(2),
                )
            }
        });

        // Wait for the request to hit the wire, then echo a response.
        let request_id = loop {
            if let Some(frame) = channel.sent.lock().unwrap().first() {
                break String::from_utf8(frame[4..4 + REQUEST_ID_LEN].to_vec()).unwrap();
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        respond(&sink, &request_id, 200, b"{\"id\":\"m-1\"}");

        let payload = caller.join().unwrap().unwrap();
        assert_eq!(&payload[..], b"{\"id\":\"m-1\"}");
    }

    #[test]
    fn test_unary_failure_status_maps_to_error() {
        let (connection, channel, sink) = open_recording();
        let caller = std::thread::spawn({
            let connection = connection.clone();
            move || {
                connection.send_and_await(
                    ActionCode::CreateMeasurement,
                    b"{}",
                    Duration::from_secs(2),
                )
            }
        });
        let request_id = loop {
            if let Some(frame) = channel.sent.lock().unwrap().first() {
                break String::from_utf8(frame[4..4 + REQUEST_ID_LEN].to_vec()).unwrap();
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        respond(&sink, &request_id, 401, b"bad token");

        let err = caller.join().unwrap().unwrap_err();
        assert_eq!(
            err,
            StreamError::Unauthenticated {
                reason: "bad token".to_string()
            }
        );
    }

    #[test]
    fn test_unary_timeout_removes_waiter() {
        let (connection, _channel, sink) = open_recording();
        let err = connection
            .send_and_await(
                ActionCode::CreateMeasurement,
                b"{}",
                Duration::from_millis(10),
            )
            .unwrap_err();
        assert!(matches!(err, StreamError::Timeout { .. }));

        // A late response must be dropped, not resolve anything.
        respond(&sink, "0510000001", 200, b"late");
    }

    #[test]
    fn test_channel_failure_wakes_pending_request() {
        let (connection, _channel, sink) = open_recording();
        let caller = std::thread::spawn({
            let connection = connection.clone();
            move || {
                connection.send_and_await(
                    ActionCode::CreateMeasurement,
                    b"{}",
                    Duration::from_secs(5),
                )
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        sink.closed(StreamError::transport("socket reset"));
        let err = caller.join().unwrap().unwrap_err();
        assert!(matches!(err, StreamError::TransportClosed { .. }));
    }

    #[test]
    fn test_undecodable_frame_fails_connection() {
        let (connection, _channel, sink) = open_recording();
        sink.frame(Bytes::from_static(b"garbage"));
        assert!(connection.is_closed());
    }
}
