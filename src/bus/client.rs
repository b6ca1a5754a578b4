// src/bus/client.rs
//
// Bus socket client. One TCP connection to the bus server, split into a
// shared writer (pubs, replies, events can be sent from any task) and a
// reader owned by the listener task.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Duration};

use super::codec::{encode_frame, decode_payload, MetaHeader, MAX_FRAME_LEN, META_LEN};
use super::{BusError, BusMessage, Method};

/// Socket read timeout. The listener wakes at this cadence to observe the
/// stop flag.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Writer half
// ============================================================================

/// Shared sending half of the bus connection.
#[derive(Clone)]
pub struct BusWriter {
    process_name: String,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

impl BusWriter {
    /// Send one message. The process name is stamped on if the caller left
    /// it empty.
    pub async fn send(&self, mut msg: BusMessage) -> Result<(), BusError> {
        if msg.process_name.is_empty() {
            msg.process_name = self.process_name.clone();
        }
        let frame = encode_frame(&msg);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }

    /// Publish a JSON body on a uri.
    pub async fn send_pub(&self, uri: &str, body: String) -> Result<(), BusError> {
        self.send(BusMessage::new(Method::Pub, uri, body)).await
    }

    /// Send a set (used for reply-to responses).
    pub async fn send_set(&self, uri: &str, body: String) -> Result<(), BusError> {
        self.send(BusMessage::new(Method::Set, uri, body)).await
    }

    /// Post an event or other one-way notification.
    pub async fn send_post(&self, uri: &str, body: String) -> Result<(), BusError> {
        self.send(BusMessage::new(Method::Post, uri, body)).await
    }
}

// ============================================================================
// Reader half
// ============================================================================

/// Receiving half, owned by the listener task.
pub struct BusReader {
    reader: OwnedReadHalf,
}

impl BusReader {
    /// Wrap an already-split read half (used by tests and the reload path).
    pub fn from_read_half(reader: OwnedReadHalf) -> Self {
        Self { reader }
    }

    /// Read one frame. Returns `Ok(None)` on timeout (caller re-checks the
    /// stop flag), `Err(Closed)` when the peer goes away.
    pub async fn read_frame(&mut self) -> Result<Option<BusMessage>, BusError> {
        let mut meta = [0u8; META_LEN];
        match timeout(READ_TIMEOUT, self.reader.read_exact(&mut meta)).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(BusError::Closed)
            }
            Ok(Err(e)) => return Err(BusError::Io(e)),
            Ok(Ok(_)) => {}
        }

        let header = MetaHeader::decode(&meta);
        let payload_len = header.payload_len();
        if payload_len > MAX_FRAME_LEN {
            return Err(BusError::FrameTooLarge(payload_len));
        }

        // The variable part follows immediately; no timeout here — a header
        // without its payload is a protocol violation worth waiting out.
        let mut payload = vec![0u8; payload_len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => BusError::Closed,
                _ => BusError::Io(e),
            })?;

        decode_payload(&header, &payload).map(Some)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connect to the bus server and subscribe to the given uris.
/// Returns the shared writer and the reader for the listener task.
pub async fn connect(
    addr: &str,
    process_name: &str,
    subs: &[String],
) -> Result<(BusWriter, BusReader), BusError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();

    let writer = BusWriter {
        process_name: process_name.to_string(),
        writer: Arc::new(AsyncMutex::new(write_half)),
    };
    let reader = BusReader { reader: read_half };

    // Subscription is a post to the server's control uri listing our uris.
    let body = serde_json::to_string(subs).unwrap_or_else(|_| "[]".to_string());
    writer
        .send(BusMessage::new(Method::Post, "/_subscribe", body))
        .await?;

    Ok((writer, reader))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_subscribes_and_sends() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut reader = BusReader { reader: read_half };
            let sub = reader.read_frame().await.unwrap().unwrap();
            let published = reader.read_frame().await.unwrap().unwrap();
            (sub, published)
        });

        let subs = vec!["/components/bms".to_string()];
        let (writer, _reader) = connect(&addr, "modgate", &subs).await.unwrap();
        writer
            .send_pub("/components/bms", r#"{"temp":1}"#.to_string())
            .await
            .unwrap();

        let (sub, published) = accept.await.unwrap();
        assert_eq!(sub.method, Method::Post);
        assert_eq!(sub.uri, "/_subscribe");
        assert_eq!(sub.body_json().unwrap(), serde_json::json!(["/components/bms"]));
        assert_eq!(published.method, Method::Pub);
        assert_eq!(published.process_name, "modgate");
        assert_eq!(published.uri, "/components/bms");
    }

    #[tokio::test]
    async fn test_reader_times_out_quietly() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let hold = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        tokio::time::pause();
        let (_writer, mut reader) = connect(&addr, "modgate", &[]).await.unwrap();
        let got = reader.read_frame().await.unwrap();
        assert!(got.is_none());
        hold.abort();
    }
}
