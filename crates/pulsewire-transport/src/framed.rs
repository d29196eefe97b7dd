//! Transport adapter for measurements carried over one multiplexed framed
//! connection. Handshake is two unary round-trips (create, then subscribe);
//! afterwards chunk uploads are one-way and results arrive as stream frames.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use pulsewire_core::{
    Chunk, CloseStatus, ConnectionConfig, CreateProperty, Result, StreamEvents, TransportAdapter,
    TransportConnector,
};

use crate::codec::{
    CancelMeasurementRequest, ChunkAction, ChunkRequest, CreateMeasurementRequest,
    CreateMeasurementResponse, StreamResultPayload, SubscribeResultsRequest, WireCodec,
};
use crate::connection::Connection;
use crate::envelope::{self, ActionCode, InboundFrame};
use crate::mux::StreamFrameHandler;

/// Opens measurements over a shared [`Connection`], one subscription per
/// measurement. Generic over the payload codec.
pub struct FramedConnector<C> {
    connection: Arc<Connection>,
    codec: C,
}

impl<C: WireCodec + Clone> FramedConnector<C> {
    /// Creates a connector that multiplexes measurements onto `connection`.
    pub fn new(connection: Arc<Connection>, codec: C) -> Self {
        Self { connection, codec }
    }
}

impl<C: WireCodec + Clone> TransportConnector for FramedConnector<C> {
    fn open(
        &self,
        config: &ConnectionConfig,
        study_id: &str,
        properties: &HashMap<CreateProperty, String>,
        events: StreamEvents,
    ) -> Result<Arc<dyn TransportAdapter>> {
        let create = CreateMeasurementRequest::from_properties(study_id, properties);
        let payload = self.codec.encode(&create)?;
        let response = self.connection.send_and_await(
            ActionCode::CreateMeasurement,
            &payload,
            config.timeout(),
        )?;
        let created: CreateMeasurementResponse = self.codec.decode(&response)?;
        tracing::debug!(
            measurement_id = %created.id,
            codec = self.codec.name(),
            "measurement created"
        );

        let stream_id = self.connection.next_stream_id();
        let adapter = Arc::new(FramedAdapter {
            connection: self.connection.clone(),
            codec: self.codec.clone(),
            stream_id: stream_id.clone(),
            measurement_id: created.id.clone(),
            events: events.clone(),
            send: Mutex::new(SendState::default()),
        });
        self.connection
            .register_stream(stream_id.clone(), adapter.clone())?;

        let subscribe = SubscribeResultsRequest {
            measurement_id: created.id.clone(),
            request_id: stream_id.clone(),
        };
        let payload = self.codec.encode(&subscribe)?;
        if let Err(e) =
            self.connection
                .send_and_await(ActionCode::SubscribeResults, &payload, config.timeout())
        {
            self.connection.deregister_stream(&stream_id);
            return Err(e);
        }

        events.session_id(created.id);
        Ok(adapter)
    }
}

#[derive(Default)]
struct SendState {
    sending: bool,
    queue: VecDeque<Vec<u8>>,
}

/// Carries one measurement over the shared connection. Outbound chunks are
/// serialized through a single in-flight write; inbound stream frames fan out
/// into session events.
pub struct FramedAdapter<C> {
    connection: Arc<Connection>,
    codec: C,
    stream_id: String,
    measurement_id: String,
    events: StreamEvents,
    send: Mutex<SendState>,
}

impl<C: WireCodec> TransportAdapter for FramedAdapter<C> {
    fn send(&self, chunk: Chunk) -> Result<()> {
        let request = ChunkRequest {
            measurement_id: self.measurement_id.clone(),
            action: ChunkAction::for_chunk(&chunk),
            chunk_order: chunk.order,
            payload: chunk.payload,
        };
        let encoded = self.codec.encode(&request)?;
        {
            let mut send = self.send.lock().unwrap();
            if send.sending {
                send.queue.push_back(encoded);
                return Ok(());
            }
            send.sending = true;
        }
        let mut next = encoded;
        loop {
            if let Err(e) = self.connection.send_oneway(ActionCode::SendChunk, &next) {
                self.send.lock().unwrap().sending = false;
                return Err(e);
            }
            let mut send = self.send.lock().unwrap();
            match send.queue.pop_front() {
                Some(queued) => next = queued,
                None => {
                    send.sending = false;
                    return Ok(());
                }
            }
        }
    }

    fn cancel(&self) -> Result<()> {
        let request = CancelMeasurementRequest {
            measurement_id: self.measurement_id.clone(),
        };
        let payload = self.codec.encode(&request)?;
        self.connection
            .send_oneway(ActionCode::CancelMeasurement, &payload)
    }

    fn shutdown(&self) {
        // The connection outlives the measurement; only the subscription is
        // torn down.
        self.connection.deregister_stream(&self.stream_id);
    }
}

impl<C: WireCodec> StreamFrameHandler for FramedAdapter<C> {
    fn on_stream_frame(&self, frame: InboundFrame) {
        if let Some(error) = envelope::status_error(frame.status, &frame.payload) {
            tracing::warn!(error = %error, "stream frame carried failure status");
            self.events.closed(Err(error));
            return;
        }
        let payload: StreamResultPayload = match self.codec.decode(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "stream frame decode failed");
                self.events.closed(Err(e));
                return;
            }
        };
        if let Some(warning) = payload.warning() {
            self.events.warning(warning);
        }
        if let Some(metric) = payload.metric() {
            self.events.metric(metric);
        }
        if let Some(result) = payload.chunk_result() {
            self.events.result(result);
            // Chunk results double as upload acknowledgements.
            self.events.chunk_acknowledged();
        }
    }

    fn on_connection_closed(&self, status: CloseStatus) {
        self.events.closed(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RawChannel;
    use crate::codec::JsonCodec;
    use bytes::Bytes;
    use pulsewire_core::MeasurementStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    /// Channel double that parks the first send on a barrier so a second
    /// send can be queued behind it.
    struct GatedChannel {
        first_send: AtomicBool,
        gate: Barrier,
        sent: Mutex<Vec<Bytes>>,
    }

    impl RawChannel for GatedChannel {
        fn send(&self, frame: Bytes) -> Result<()> {
            if self.first_send.swap(false, Ordering::SeqCst) {
                self.gate.wait();
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {}
    }

    fn chunk(order: u64) -> Chunk {
        Chunk {
            payload: vec![order as u8],
            order,
            is_first: order == 0,
            is_last: false,
        }
    }

    #[test]
    fn test_in_flight_send_queues_and_flushes_in_order() {
        let channel = Arc::new(GatedChannel {
            first_send: AtomicBool::new(true),
            gate: Barrier::new(2),
            sent: Mutex::new(Vec::new()),
        });
        let raw = channel.clone();
        let connection = Connection::open(move |_sink| Ok(raw as Arc<dyn RawChannel>)).unwrap();
        let session = MeasurementStream::new();
        let adapter = Arc::new(FramedAdapter {
            connection,
            codec: JsonCodec,
            stream_id: "STRM000001".to_string(),
            measurement_id: "m-1".to_string(),
            events: session.events(),
            send: Mutex::new(SendState::default()),
        });

        let first = {
            let adapter = adapter.clone();
            std::thread::spawn(move || adapter.send(chunk(0)).unwrap())
        };
        // Wait until the first send is marked in flight, then queue a second
        // chunk behind it; the call must not block.
        while !adapter.send.lock().unwrap().sending {
            std::thread::yield_now();
        }
        adapter.send(chunk(1)).unwrap();
        assert_eq!(adapter.send.lock().unwrap().queue.len(), 1);

        channel.gate.wait();
        first.join().unwrap();

        let sent = channel.sent.lock().unwrap();
        let orders: Vec<u64> = sent
            .iter()
            .map(|frame| {
                let request: ChunkRequest = JsonCodec.decode(&frame[14..]).unwrap();
                request.chunk_order
            })
            .collect();
        assert_eq!(orders, vec![0, 1]);
        assert!(!adapter.send.lock().unwrap().sending);
    }
}
