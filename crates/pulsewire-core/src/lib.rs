#![warn(missing_docs)]

//! Pulsewire measurement streaming engine: session state machine, chunk
//! ordering, and asynchronous result delivery over pluggable transports.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod types;
pub mod validator;

pub use adapter::{TransportAdapter, TransportConnector};
pub use config::ConnectionConfig;
pub use dispatch::Dispatcher;
pub use error::{CloseStatus, Result, StreamError};
pub use session::{MeasurementStream, SessionState, StreamEvents};
pub use types::{
    Chunk, CreateProperty, MeasurementMetric, MeasurementResult, MeasurementWarning,
};
