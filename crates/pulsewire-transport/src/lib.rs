#![warn(missing_docs)]

//! Pulsewire transport layer.
//!
//! Two adapter families plug into the engine's transport seam: a
//! completion-queue RPC streaming variant with a dedicated reader thread per
//! measurement, and a framed-socket variant where any number of measurements
//! share one multiplexed connection.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod framed;
pub mod mux;
pub mod rpc;

pub use channel::{RawChannel, TcpChannel, TcpChannelConfig};
pub use codec::{BinaryCodec, ChunkAction, JsonCodec, WireCodec};
pub use connection::{ChannelSink, Connection};
pub use envelope::{ActionCode, InboundFrame};
pub use framed::{FramedAdapter, FramedConnector};
pub use mux::{Multiplexer, StreamFrameHandler};
pub use rpc::{
    QueueOutcome, ReaderThreadAdapter, RpcConnector, RpcDialer, RpcRequest, RpcResponse,
    RpcStream, StreamEvent,
};
