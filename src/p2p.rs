//! Off-chain party-to-party messaging.
//!
//! JSON objects travel over UNIX stream sockets framed by a 4-byte
//! big-endian length prefix; payload semantics are plain JSON documents.
//! The forwarder sits between the two parties, relaying complete objects
//! one-way per thread while counting objects and bytes for the simulation
//! accounting.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{error::Error, fmt, io};

use log::{debug, error};
use serde_json::Value;

/// Upper bound on a single frame; a tripped limit indicates a corrupted
/// length header rather than a legitimate message.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Errors raised by the JSON object streams.
#[derive(Debug)]
pub enum P2pError {
    /// The configured receive timeout elapsed.
    Timeout,
    /// The peer closed the socket in the middle of a frame.
    ClosedUnexpectedly,
    /// A frame length header exceeded the sanity bound.
    FrameTooLarge(usize),
    /// JSON serialization or parsing failure.
    Codec(String),
    /// Underlying socket I/O failure.
    Io(String),
}

impl fmt::Display for P2pError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "receive timed out"),
            Self::ClosedUnexpectedly => write!(f, "peer closed the stream mid-frame"),
            Self::FrameTooLarge(size) => write!(f, "frame of {size} bytes exceeds limit"),
            Self::Codec(err) => write!(f, "JSON codec error: {err}"),
            Self::Io(err) => write!(f, "socket I/O error: {err}"),
        }
    }
}

impl Error for P2pError {}

impl From<io::Error> for P2pError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// One end of a framed JSON object stream.
pub struct JsonObjectStream {
    stream: UnixStream,
}

impl JsonObjectStream {
    /// Connects to a listening socket at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, P2pError> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Wraps an already connected socket.
    pub fn from_unix_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn try_clone(&self) -> Result<Self, P2pError> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    /// Sends one JSON object; returns the number of bytes written
    /// including the length prefix.
    pub fn send_object(&mut self, object: &Value) -> Result<usize, P2pError> {
        let body = serde_json::to_vec(object).map_err(|err| P2pError::Codec(err.to_string()))?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(P2pError::FrameTooLarge(body.len()));
        }
        self.stream.write_all(&(body.len() as u32).to_be_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(4 + body.len())
    }

    /// Receives one JSON object, blocking up to `timeout` when given.
    ///
    /// Returns `None` when the peer closed the stream cleanly between
    /// frames; the consumed byte count accompanies each object.
    pub fn receive_object(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<(Value, usize)>, P2pError> {
        self.stream.set_read_timeout(timeout)?;

        let mut header = [0u8; 4];
        let mut read = 0usize;
        while read < header.len() {
            match self.stream.read(&mut header[read..]) {
                Ok(0) if read == 0 => return Ok(None),
                Ok(0) => return Err(P2pError::ClosedUnexpectedly),
                Ok(count) => read += count,
                Err(err) => return Err(err.into()),
            }
        }

        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(P2pError::FrameTooLarge(length));
        }
        let mut body = vec![0u8; length];
        self.stream
            .read_exact(&mut body)
            .map_err(|err| match err.kind() {
                ErrorKind::UnexpectedEof => P2pError::ClosedUnexpectedly,
                _ => P2pError::from(err),
            })?;

        let object = serde_json::from_slice(&body).map_err(|err| P2pError::Codec(err.to_string()))?;
        Ok(Some((object, 4 + length)))
    }

    /// Shuts the stream down in both directions.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Listening side of a stream: binds, then accepts a single connection in
/// a background thread.
pub struct JsonObjectServerStream {
    path: PathBuf,
    accept_handle: JoinHandle<io::Result<UnixStream>>,
}

impl JsonObjectServerStream {
    /// Binds `path` and starts accepting one connection.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, P2pError> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        let accept_handle = thread::spawn(move || listener.accept().map(|(stream, _)| stream));
        Ok(Self {
            path,
            accept_handle,
        })
    }

    /// Socket path this server listens on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the peer to connect and returns the connected stream.
    pub fn wait_connection(self) -> Result<JsonObjectStream, P2pError> {
        let stream = self
            .accept_handle
            .join()
            .map_err(|_| P2pError::Io("accept thread panicked".to_string()))??;
        Ok(JsonObjectStream::from_unix_stream(stream))
    }
}

#[derive(Default)]
struct DirectionCounter {
    objects: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Default)]
struct ForwarderCounters {
    a_to_b: DirectionCounter,
    b_to_a: DirectionCounter,
}

/// Message counts observed by the forwarder, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForwarderStats {
    /// Objects relayed from endpoint 1 to endpoint 2.
    pub objects_1to2: u64,
    /// Objects relayed from endpoint 2 to endpoint 1.
    pub objects_2to1: u64,
    /// Bytes relayed from endpoint 1 to endpoint 2.
    pub bytes_1to2: u64,
    /// Bytes relayed from endpoint 2 to endpoint 1.
    pub bytes_2to1: u64,
}

/// Relay between two server streams with per-direction instrumentation.
pub struct Forwarder {
    counters: Arc<ForwarderCounters>,
    handle: Option<JoinHandle<()>>,
}

impl Forwarder {
    /// Starts relaying between the two endpoints. Returns immediately;
    /// relaying begins once both peers have connected.
    pub fn start(endpoint1: JsonObjectServerStream, endpoint2: JsonObjectServerStream) -> Self {
        let counters = Arc::new(ForwarderCounters::default());
        let shared = Arc::clone(&counters);

        let handle = thread::spawn(move || {
            let conn1 = match endpoint1.wait_connection() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("forwarder endpoint 1 accept failed: {err}");
                    return;
                }
            };
            let conn2 = match endpoint2.wait_connection() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("forwarder endpoint 2 accept failed: {err}");
                    return;
                }
            };
            let (write1, write2) = match (conn1.try_clone(), conn2.try_clone()) {
                (Ok(write1), Ok(write2)) => (write1, write2),
                _ => {
                    error!("forwarder could not clone connections");
                    return;
                }
            };

            let forward_counters = Arc::clone(&shared);
            let thread_1to2 = thread::spawn(move || {
                forward(conn1, write2, &forward_counters.a_to_b);
            });
            let forward_counters = Arc::clone(&shared);
            let thread_2to1 = thread::spawn(move || {
                forward(conn2, write1, &forward_counters.b_to_a);
            });
            let _ = thread_1to2.join();
            let _ = thread_2to1.join();
        });

        Self {
            counters,
            handle: Some(handle),
        }
    }

    /// Current per-direction counters.
    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            objects_1to2: self.counters.a_to_b.objects.load(Ordering::Relaxed),
            objects_2to1: self.counters.b_to_a.objects.load(Ordering::Relaxed),
            bytes_1to2: self.counters.a_to_b.bytes.load(Ordering::Relaxed),
            bytes_2to1: self.counters.b_to_a.bytes.load(Ordering::Relaxed),
        }
    }

    /// Waits for both relay directions to finish (both peers gone).
    pub fn join(mut self) -> ForwarderStats {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.stats()
    }
}

fn forward(mut source: JsonObjectStream, mut target: JsonObjectStream, counter: &DirectionCounter) {
    loop {
        match source.receive_object(None) {
            Ok(Some((object, bytes))) => {
                counter.objects.fetch_add(1, Ordering::Relaxed);
                counter.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                if let Err(err) = target.send_object(&object) {
                    error!("forwarder could not relay object: {err}");
                    break;
                }
            }
            Ok(None) => {
                debug!("forwarder source closed cleanly");
                break;
            }
            Err(err) => {
                error!("forwarder receive error: {err}");
                break;
            }
        }
    }
    target.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn stream_pair() -> (JsonObjectStream, JsonObjectStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            JsonObjectStream::from_unix_stream(a),
            JsonObjectStream::from_unix_stream(b),
        )
    }

    fn temp_socket(tag: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fairbench_p2p_{tag}_{unique}.sock"))
    }

    #[test]
    fn object_roundtrip() {
        let (mut sender, mut receiver) = stream_pair();
        let object = json!({"action": "open", "signature": "00ff"});
        let sent = sender.send_object(&object).unwrap();
        let (received, bytes) = receiver.receive_object(None).unwrap().unwrap();
        assert_eq!(received, object);
        assert_eq!(bytes, sent);
    }

    #[test]
    fn braces_in_payload_are_harmless() {
        let (mut sender, mut receiver) = stream_pair();
        let object = json!({"tree": "}}}{{{", "nested": {"inner": "}"}});
        sender.send_object(&object).unwrap();
        let (received, _) = receiver.receive_object(None).unwrap().unwrap();
        assert_eq!(received, object);
    }

    #[test]
    fn clean_close_yields_none() {
        let (mut sender, mut receiver) = stream_pair();
        sender.close();
        drop(sender);
        assert!(receiver.receive_object(None).unwrap().is_none());
    }

    #[test]
    fn receive_times_out() {
        let (_sender, mut receiver) = stream_pair();
        let result = receiver.receive_object(Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(P2pError::Timeout)));
    }

    #[test]
    fn several_objects_in_sequence() {
        let (mut sender, mut receiver) = stream_pair();
        for index in 0..5 {
            sender.send_object(&json!({ "index": index })).unwrap();
        }
        for index in 0..5 {
            let (object, _) = receiver.receive_object(None).unwrap().unwrap();
            assert_eq!(object["index"], index);
        }
    }

    #[test]
    fn forwarder_relays_and_counts() {
        let path1 = temp_socket("fwd1");
        let path2 = temp_socket("fwd2");
        let server1 = JsonObjectServerStream::bind(&path1).unwrap();
        let server2 = JsonObjectServerStream::bind(&path2).unwrap();
        let forwarder = Forwarder::start(server1, server2);

        let mut client1 = JsonObjectStream::connect(&path1).unwrap();
        let mut client2 = JsonObjectStream::connect(&path2).unwrap();

        client1.send_object(&json!({"from": 1})).unwrap();
        let (object, _) = client2
            .receive_object(Some(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        assert_eq!(object["from"], 1);

        client2.send_object(&json!({"from": 2})).unwrap();
        client2.send_object(&json!({"from": 2})).unwrap();
        for _ in 0..2 {
            client1
                .receive_object(Some(Duration::from_secs(5)))
                .unwrap()
                .unwrap();
        }

        client1.close();
        client2.close();
        let stats = forwarder.join();
        assert_eq!(stats.objects_1to2, 1);
        assert_eq!(stats.objects_2to1, 2);
        assert!(stats.bytes_1to2 > 0);
        assert!(stats.bytes_2to1 > stats.bytes_1to2);

        let _ = std::fs::remove_file(path1);
        let _ = std::fs::remove_file(path2);
    }
}
