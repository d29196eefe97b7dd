//! Message and payload types exchanged with the measurement service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Optional properties that may accompany measurement creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateProperty {
    /// Profile the measurement should be associated with.
    UserProfileId,
    /// Partner identifier for attribution.
    PartnerId,
    /// Requested result resolution.
    Resolution,
}

/// One processed result delivered by the server for a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// Order of the chunk this result corresponds to.
    pub chunk_order: u64,
    /// Face the signals were extracted from.
    pub face_id: String,
    /// Signal name to sample values.
    pub signal_data: HashMap<String, Vec<f32>>,
    /// Capture time of the last frame in the chunk, milliseconds since epoch.
    pub frame_end_timestamp_ms: i64,
    /// Server submission time, milliseconds since epoch.
    pub timestamp_ms: i64,
}

/// Diagnostic information on connection throughput.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMetric {
    /// Measured upload rate.
    pub upload_rate: f32,
}

/// Non-fatal feedback from the server. Never closes the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementWarning {
    /// Server warning code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
    /// When the warning was raised, milliseconds since epoch.
    pub timestamp_ms: i64,
}

/// One ordered unit of payload data within a session.
///
/// Constructed per `send_chunk` call and consumed by the transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Position within the session; strictly increasing from 0.
    pub order: u64,
    /// Whether this is the first chunk of the session.
    pub is_first: bool,
    /// Whether this is the last chunk of the session.
    pub is_last: bool,
}
