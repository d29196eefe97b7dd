//! End-to-end exercises of the framed transport against a scripted server
//! living behind the raw channel seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use pulsewire_core::{ConnectionConfig, CreateProperty, MeasurementStream, Result, StreamError};
use pulsewire_transport::codec::{
    ChannelSamples, ChunkRequest, CreateMeasurementResponse, StreamResultPayload,
    SubscribeResultsRequest, SubscribeResultsResponse, WireCodec,
};
use pulsewire_transport::{BinaryCodec, ChannelSink, Connection, FramedConnector, JsonCodec, RawChannel};

/// Plays the server role: decodes each outbound frame and synchronously
/// feeds the scripted response back through the sink.
struct ScriptedServer<C> {
    sink: ChannelSink,
    codec: C,
    stream_id: Mutex<Option<String>>,
    chunks: Mutex<Vec<ChunkRequest>>,
    multiplier: u32,
}

impl<C: WireCodec> ScriptedServer<C> {
    fn respond(&self, request_id: &str, status: u16, payload: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_slice(request_id.as_bytes());
        buf.put_slice(format!("{status:03}").as_bytes());
        buf.put_slice(payload);
        self.sink.frame(buf.freeze());
    }
}

impl<C: WireCodec> RawChannel for ScriptedServer<C> {
    fn send(&self, frame: Bytes) -> Result<()> {
        let action: u16 = std::str::from_utf8(&frame[..4]).unwrap().parse().unwrap();
        let request_id = std::str::from_utf8(&frame[4..14]).unwrap().to_string();
        let payload = &frame[14..];
        match action {
            // Create measurement.
            510 => {
                let body = self
                    .codec
                    .encode(&CreateMeasurementResponse {
                        id: "m-77".to_string(),
                    })
                    .unwrap();
                self.respond(&request_id, 200, &body);
            }
            // Subscribe results.
            511 => {
                let request: SubscribeResultsRequest = self.codec.decode(payload).unwrap();
                *self.stream_id.lock().unwrap() = Some(request.request_id.clone());
                let body = self
                    .codec
                    .encode(&SubscribeResultsResponse {
                        request_id: Some(request.request_id),
                    })
                    .unwrap();
                self.respond(&request_id, 200, &body);
            }
            // Chunk upload: answer on the stream with one result frame.
            512 => {
                let request: ChunkRequest = self.codec.decode(payload).unwrap();
                let stream_id = self.stream_id.lock().unwrap().clone().unwrap();
                let mut result = StreamResultPayload {
                    measurement_id: request.measurement_id.clone(),
                    chunk_order: request.chunk_order,
                    multiplier: self.multiplier,
                    ..StreamResultPayload::default()
                };
                result.channels.insert(
                    "HR".to_string(),
                    ChannelSamples {
                        channel: "HR".to_string(),
                        data: vec![72_000 + request.chunk_order as i32],
                    },
                );
                self.chunks.lock().unwrap().push(request);
                let body = self.codec.encode(&result).unwrap();
                self.respond(&stream_id, 200, &body);
            }
            // Cancel: no response scripted.
            513 => {}
            other => panic!("unexpected action {other}"),
        }
        Ok(())
    }

    fn close(&self) {}
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ConnectionConfig {
    ConnectionConfig {
        host: "measure.example.com:9443".to_string(),
        auth_token: "auth".to_string(),
        device_token: "device".to_string(),
        ..ConnectionConfig::default()
    }
}

fn scripted_connection<C: WireCodec + Clone>(
    codec: C,
    multiplier: u32,
) -> (Arc<Connection>, Arc<ScriptedServer<C>>) {
    let server_slot: Mutex<Option<Arc<ScriptedServer<C>>>> = Mutex::new(None);
    let connection = Connection::open(|sink| {
        let server = Arc::new(ScriptedServer {
            sink,
            codec: codec.clone(),
            stream_id: Mutex::new(None),
            chunks: Mutex::new(Vec::new()),
            multiplier,
        });
        *server_slot.lock().unwrap() = Some(server.clone());
        Ok(server as Arc<dyn RawChannel>)
    })
    .unwrap();
    let server = server_slot.into_inner().unwrap().unwrap();
    (connection, server)
}

fn run_measurement<C: WireCodec + Clone>(codec: C) {
    init_tracing();
    let (connection, server) = scripted_connection(codec.clone(), 1_000);
    let connector = FramedConnector::new(connection, codec);
    let session = MeasurementStream::new();

    let mut properties = HashMap::new();
    properties.insert(CreateProperty::UserProfileId, "profile-1".to_string());
    session
        .open(&config(), "study-1", &properties, &connector)
        .unwrap();
    assert_eq!(
        session.poll_session_id(Some(Duration::from_secs(1))).unwrap(),
        "m-77"
    );

    session.send_chunk(vec![1, 2, 3], false).unwrap();
    session.send_chunk(vec![4, 5], false).unwrap();
    session.send_chunk(vec![6], true).unwrap();

    // Every chunk was acknowledged by a result frame, so the session
    // completes naturally.
    assert_eq!(session.wait_for_completion(Some(Duration::from_secs(5))), Ok(()));

    for expected_order in 0..3u64 {
        let result = session.poll_result(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(result.chunk_order, expected_order);
        assert_eq!(
            result.signal_data["HR"],
            vec![(72_000 + expected_order as i32) as f32 / 1_000.0]
        );
    }

    let chunks = server.chunks.lock().unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.measurement_id == "m-77"));
    let orders: Vec<u64> = chunks.iter().map(|c| c.chunk_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
}

#[test]
fn test_json_measurement_round_trip() {
    run_measurement(JsonCodec);
}

#[test]
fn test_binary_measurement_round_trip() {
    run_measurement(BinaryCodec);
}

#[test]
fn test_connection_failure_closes_active_measurement() {
    init_tracing();
    let (connection, _server) = scripted_connection(JsonCodec, 1);
    let connector = FramedConnector::new(connection.clone(), JsonCodec);
    let session = MeasurementStream::new();
    session
        .open(&config(), "study-1", &HashMap::new(), &connector)
        .unwrap();
    session.send_chunk(vec![1], false).unwrap();

    connection.close();

    let status = session.wait_for_completion(Some(Duration::from_secs(5)));
    assert!(matches!(status, Err(StreamError::TransportClosed { .. })));
    // Pollers observe the same terminal status.
    let err = session
        .poll_result(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, StreamError::TransportClosed { .. }));
}

#[test]
fn test_concurrent_senders_reach_the_wire_in_assignment_order() {
    init_tracing();
    let (connection, server) = scripted_connection(JsonCodec, 1);
    let connector = FramedConnector::new(connection, JsonCodec);
    let session = Arc::new(MeasurementStream::new());
    session
        .open(&config(), "study-1", &HashMap::new(), &connector)
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let s = session.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                s.send_chunk(vec![7], false).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    session.send_chunk(vec![9], true).unwrap();
    assert_eq!(session.wait_for_completion(Some(Duration::from_secs(5))), Ok(()));

    let chunks = server.chunks.lock().unwrap();
    let orders: Vec<u64> = chunks.iter().map(|c| c.chunk_order).collect();
    let expected: Vec<u64> = (0..=100).collect();
    assert_eq!(orders, expected);
}

#[test]
fn test_two_measurements_share_one_connection() {
    init_tracing();
    let (connection, server) = scripted_connection(JsonCodec, 1);

    let connector = FramedConnector::new(connection, JsonCodec);
    let first = MeasurementStream::new();
    first
        .open(&config(), "study-1", &HashMap::new(), &connector)
        .unwrap();
    first.send_chunk(vec![1], true).unwrap();
    assert_eq!(first.wait_for_completion(Some(Duration::from_secs(5))), Ok(()));

    // The scripted server keys stream frames by the latest subscription, so
    // a second measurement over the same connection exercises re-registration.
    let second = MeasurementStream::new();
    second
        .open(&config(), "study-1", &HashMap::new(), &connector)
        .unwrap();
    second.send_chunk(vec![2], true).unwrap();
    assert_eq!(second.wait_for_completion(Some(Duration::from_secs(5))), Ok(()));

    assert_eq!(server.chunks.lock().unwrap().len(), 2);
}
