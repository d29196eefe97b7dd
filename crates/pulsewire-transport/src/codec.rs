//! Payload codecs and the message bodies they carry.
//!
//! The framed transport is generic over the payload encoding: deployments
//! speak either JSON or a compact binary encoding over the same envelope.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pulsewire_core::{
    Chunk, CreateProperty, MeasurementMetric, MeasurementResult, MeasurementWarning, Result,
    StreamError,
};

/// Encoding for request and stream payloads inside the wire envelope.
pub trait WireCodec: Send + Sync + 'static {
    /// Serializes one message body.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes one message body.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name, for diagnostics.
    fn name(&self) -> &'static str;
}

/// JSON payload encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StreamError::internal(format!("json encode: {e}")))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| StreamError::protocol(format!("json decode: {e}")))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Compact binary payload encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl WireCodec for BinaryCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| StreamError::internal(format!("binary encode: {e}")))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes)
            .map_err(|e| StreamError::protocol(format!("binary decode: {e}")))
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

/// Body of a measurement-creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMeasurementRequest {
    /// Study the measurement belongs to.
    pub study_id: String,
    /// Profile to associate the measurement with.
    pub user_profile_id: Option<String>,
    /// Partner identifier for attribution.
    pub partner_id: Option<String>,
    /// Requested result resolution.
    pub resolution: Option<u32>,
}

impl CreateMeasurementRequest {
    /// Builds the request from the caller-supplied property map. Properties
    /// that fail to parse are omitted rather than rejected.
    pub fn from_properties(study_id: &str, properties: &HashMap<CreateProperty, String>) -> Self {
        Self {
            study_id: study_id.to_string(),
            user_profile_id: properties.get(&CreateProperty::UserProfileId).cloned(),
            partner_id: properties.get(&CreateProperty::PartnerId).cloned(),
            resolution: properties
                .get(&CreateProperty::Resolution)
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Body of a measurement-creation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMeasurementResponse {
    /// Server-assigned measurement identifier.
    pub id: String,
}

/// Body of a result-subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResultsRequest {
    /// Measurement to subscribe to.
    pub measurement_id: String,
    /// Stream identifier the results should be addressed to.
    pub request_id: String,
}

/// Body of a result-subscription acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResultsResponse {
    /// Echo of the subscribed stream identifier, if the server provides one.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Position of a chunk within its measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkAction {
    /// First chunk of the measurement.
    First,
    /// Interior chunk.
    Process,
    /// Last chunk; the server finalizes after processing it.
    Last,
}

impl ChunkAction {
    /// Derives the action from the chunk's position flags.
    pub fn for_chunk(chunk: &Chunk) -> Self {
        if chunk.is_last {
            ChunkAction::Last
        } else if chunk.is_first {
            ChunkAction::First
        } else {
            ChunkAction::Process
        }
    }
}

/// Body of a chunk-upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    /// Measurement the chunk belongs to.
    pub measurement_id: String,
    /// Position of the chunk within the measurement.
    pub action: ChunkAction,
    /// Sequence number assigned by the session.
    pub chunk_order: u64,
    /// Opaque payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Body of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMeasurementRequest {
    /// Measurement to cancel.
    pub measurement_id: String,
}

/// Integer samples of one signal channel as delivered on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSamples {
    /// Channel name.
    pub channel: String,
    /// Fixed-point sample values; divide by the payload multiplier.
    pub data: Vec<i32>,
}

/// Body of one stream frame carrying results, metrics, or warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResultPayload {
    /// Measurement the frame belongs to.
    #[serde(default)]
    pub measurement_id: String,
    /// Chunk the results correspond to.
    #[serde(default)]
    pub chunk_order: u64,
    /// Face the signals were extracted from.
    #[serde(default = "default_face_id")]
    pub face_id: String,
    /// Fixed-point divisor applied to every sample.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Signal channels keyed by name; empty on frames that only carry a
    /// metric or warning.
    #[serde(default)]
    pub channels: HashMap<String, ChannelSamples>,
    /// Capture time of the chunk's last frame, milliseconds since epoch.
    #[serde(default)]
    pub frame_end_timestamp_ms: i64,
    /// Server submission time, milliseconds since epoch.
    #[serde(default)]
    pub timestamp_ms: i64,
    /// Throughput metric, if the server piggybacked one.
    #[serde(default)]
    pub metric: Option<MetricPayload>,
    /// Warning, if the server piggybacked one.
    #[serde(default)]
    pub warning: Option<WarningPayload>,
}

fn default_face_id() -> String {
    "1".to_string()
}

fn default_multiplier() -> u32 {
    1
}

impl Default for StreamResultPayload {
    fn default() -> Self {
        Self {
            measurement_id: String::new(),
            chunk_order: 0,
            face_id: default_face_id(),
            multiplier: default_multiplier(),
            channels: HashMap::new(),
            frame_end_timestamp_ms: 0,
            timestamp_ms: 0,
            metric: None,
            warning: None,
        }
    }
}

/// Wire form of a throughput metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    /// Measured upload rate.
    pub upload_rate: f32,
}

/// Wire form of a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPayload {
    /// Server warning code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
    /// When the warning was raised, milliseconds since epoch.
    #[serde(default)]
    pub timestamp_ms: i64,
}

impl StreamResultPayload {
    /// The warning carried by this frame, if any.
    pub fn warning(&self) -> Option<MeasurementWarning> {
        self.warning.as_ref().map(|w| MeasurementWarning {
            code: w.code,
            message: w.message.clone(),
            timestamp_ms: w.timestamp_ms,
        })
    }

    /// The metric carried by this frame, if any.
    pub fn metric(&self) -> Option<MeasurementMetric> {
        self.metric.map(|m| MeasurementMetric {
            upload_rate: m.upload_rate,
        })
    }

    /// Converts fixed-point channel samples into a result. `None` when the
    /// frame carries no channel data.
    pub fn chunk_result(&self) -> Option<MeasurementResult> {
        if self.channels.is_empty() {
            return None;
        }
        let multiplier = if self.multiplier == 0 {
            1.0
        } else {
            self.multiplier as f32
        };
        let signal_data = self
            .channels
            .iter()
            .map(|(name, samples)| {
                let values = samples.data.iter().map(|v| *v as f32 / multiplier).collect();
                (name.clone(), values)
            })
            .collect();
        Some(MeasurementResult {
            chunk_order: self.chunk_order,
            face_id: self.face_id.clone(),
            signal_data,
            frame_end_timestamp_ms: self.frame_end_timestamp_ms,
            timestamp_ms: self.timestamp_ms,
        })
    }
}
