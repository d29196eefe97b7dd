//! Raw framed channels. The TCP implementation runs its I/O on one
//! dedicated thread so the engine itself stays free of executor state.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use pulsewire_core::{Result, StreamError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::connection::ChannelSink;

/// Outbound half of a framed byte channel. `send` must not block on network
/// I/O; `close` flushes, shuts the channel down, and is idempotent.
pub trait RawChannel: Send + Sync {
    /// Queues one frame for transmission.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Shuts the channel down and waits for its I/O to wind up, unless
    /// called from the channel's own I/O thread.
    fn close(&self);
}

/// Tuning knobs for [`TcpChannel::connect`].
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to disable Nagle's algorithm on the socket.
    pub nodelay: bool,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            nodelay: true,
        }
    }
}

/// Frames above this size indicate a corrupt length prefix.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

enum WriteOp {
    Frame(Bytes),
    Shutdown,
}

/// Length-prefixed framing over one TCP connection.
///
/// Frames are a 4-byte big-endian length followed by that many bytes. Both
/// halves run inside a single-threaded runtime on a dedicated I/O thread;
/// inbound frames and the terminal failure flow out through the
/// [`ChannelSink`] captured at connect time.
pub struct TcpChannel {
    writer: UnboundedSender<WriteOp>,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpChannel {
    /// Connects to `addr`, bounded by the configured connect timeout, and
    /// spawns the I/O thread.
    pub fn connect(addr: &str, config: TcpChannelConfig, sink: ChannelSink) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StreamError::internal(format!("build runtime: {e}")))?;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = match runtime
            .block_on(async { tokio::time::timeout(timeout, TcpStream::connect(addr)).await })
        {
            Err(_) => {
                return Err(StreamError::Timeout {
                    timeout_ms: config.connect_timeout_ms,
                })
            }
            Ok(Err(e)) => return Err(StreamError::transport(format!("connect {addr}: {e}"))),
            Ok(Ok(stream)) => stream,
        };
        if config.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| StreamError::transport(format!("set_nodelay: {e}")))?;
        }
        tracing::debug!(addr, "socket channel connected");

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name("pulsewire-io".into())
            .spawn(move || runtime.block_on(io_loop(stream, rx, sink)))
            .map_err(|e| StreamError::internal(format!("spawn io thread: {e}")))?;

        Ok(Self {
            writer: tx,
            io_thread: Mutex::new(Some(handle)),
        })
    }
}

impl RawChannel for TcpChannel {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.writer
            .send(WriteOp::Frame(frame))
            .map_err(|_| StreamError::transport_closed("socket channel is down"))
    }

    fn close(&self) {
        let _ = self.writer.send(WriteOp::Shutdown);
        let handle = self.io_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn io_loop(stream: TcpStream, mut write_rx: UnboundedReceiver<WriteOp>, sink: ChannelSink) {
    let (mut read_half, mut write_half) = stream.into_split();

    let read_sink = sink.clone();
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(frame)) => read_sink.frame(frame),
                Ok(None) => {
                    read_sink.closed(StreamError::transport_closed("connection closed by server"));
                    break;
                }
                Err(e) => {
                    read_sink.closed(StreamError::transport(format!("socket read: {e}")));
                    break;
                }
            }
        }
    });

    while let Some(op) = write_rx.recv().await {
        match op {
            WriteOp::Frame(frame) => {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    sink.closed(StreamError::transport(format!("socket write: {e}")));
                    break;
                }
            }
            WriteOp::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }

    reader.abort();
    let _ = reader.await;
    tracing::debug!("socket channel i/o thread exiting");
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    write_half
        .write_all(&(frame.len() as u32).to_be_bytes())
        .await?;
    write_half.write_all(frame).await?;
    write_half.flush().await
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    read_half.read_exact(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::envelope::{ActionCode, REQUEST_ID_LEN};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    fn read_wire_frame(socket: &mut std::net::TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        socket.read_exact(&mut len_buf).unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        socket.read_exact(&mut frame).unwrap();
        frame
    }

    fn write_wire_frame(socket: &mut std::net::TcpStream, frame: &[u8]) {
        socket.write_all(&(frame.len() as u32).to_be_bytes()).unwrap();
        socket.write_all(frame).unwrap();
    }

    #[test]
    fn test_loopback_unary_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let request = read_wire_frame(&mut socket);
            // Echo the correlation id with a success status.
            let request_id = &request[4..4 + REQUEST_ID_LEN];
            let mut response = Vec::new();
            response.extend_from_slice(request_id);
            response.extend_from_slice(b"200");
            response.extend_from_slice(b"pong");
            write_wire_frame(&mut socket, &response);
        });

        let connection = Connection::open(|sink| {
            let channel = TcpChannel::connect(&addr.to_string(), TcpChannelConfig::default(), sink)?;
            Ok(Arc::new(channel) as Arc<dyn RawChannel>)
        })
        .unwrap();

        let payload = connection
            .send_and_await(ActionCode::SendChunk, b"ping", Duration::from_secs(5))
            .unwrap();
        assert_eq!(&payload[..], b"pong");
        connection.close();
        server.join().unwrap();
    }

    #[test]
    fn test_server_disconnect_fails_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let connection = Connection::open(|sink| {
            let channel = TcpChannel::connect(&addr.to_string(), TcpChannelConfig::default(), sink)?;
            Ok(Arc::new(channel) as Arc<dyn RawChannel>)
        })
        .unwrap();
        server.join().unwrap();

        let err = connection
            .send_and_await(ActionCode::SendChunk, b"ping", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::TransportClosed { .. } | StreamError::Transport { .. }
        ));
        connection.close();
    }

    #[test]
    fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port with no listener.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let result = Connection::open(|sink| {
            let channel = TcpChannel::connect(&addr.to_string(), TcpChannelConfig::default(), sink)?;
            Ok(Arc::new(channel) as Arc<dyn RawChannel>)
        });
        assert!(matches!(
            result.unwrap_err(),
            StreamError::Transport { .. } | StreamError::Timeout { .. }
        ));
    }
}
