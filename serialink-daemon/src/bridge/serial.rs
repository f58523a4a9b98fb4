/*!
 * Serial Bridge
 * Owns the open profile socket: a reader task reporting data/error/close,
 * and a writer task draining outbound writes
 */

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::BridgeEvent;
use crate::config::WriteEncoding;
use crate::error::{BridgeError, Result};

const READ_BUFFER: usize = 1024;

/// What the reader task observed on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Data(Vec<u8>),
    Error(String),
    Closed { had_error: bool },
}

/// The open byte stream of the connected device.
///
/// Dropping the handle aborts both tasks, which releases the socket.
#[derive(Debug)]
pub struct SocketHandle {
    id: Uuid,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl SocketHandle {
    /// Take ownership of `stream` and attach the data/error/close observers.
    pub fn open<S>(stream: S, events: mpsc::UnboundedSender<BridgeEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, outbound) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(id, read_half, events));
        let writer_task = tokio::spawn(write_loop(id, write_half, outbound));

        Self {
            id,
            writer,
            reader_task,
            writer_task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue bytes for the socket. Failures are only logged.
    pub fn write(&self, bytes: Vec<u8>) {
        if self.writer.send(bytes).is_err() {
            warn!("Unable to write data. Socket {} is closed", self.id);
        }
    }

    /// Stop forwarding inbound data; the socket stays open until dropped.
    pub fn detach(&self) {
        self.reader_task.abort();
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn read_loop<R>(socket: Uuid, mut reader: R, events: mpsc::UnboundedSender<BridgeEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => SocketEvent::Closed { had_error: false },
            Ok(n) => SocketEvent::Data(buf[..n].to_vec()),
            Err(e) => {
                let _ = events.send(BridgeEvent::Socket {
                    socket,
                    event: SocketEvent::Error(e.to_string()),
                });
                SocketEvent::Closed { had_error: true }
            }
        };

        let last = matches!(event, SocketEvent::Closed { .. });
        if events.send(BridgeEvent::Socket { socket, event }).is_err() || last {
            break;
        }
    }
}

async fn write_loop<W>(socket: Uuid, mut writer: W, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        let len = bytes.len();
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => debug!("Wrote {} bytes to socket {}", len, socket),
            Err(e) => warn!("Unable to write data. {}", BridgeError::WriteFailed(e.to_string())),
        }
    }
}

/// Encode text the way the host runtime's single-byte `ascii` scheme does.
pub fn encode_text(text: &str, encoding: WriteEncoding) -> Vec<u8> {
    match encoding {
        WriteEncoding::Ascii => text.encode_utf16().map(|unit| unit as u8).collect(),
        WriteEncoding::Utf8 => text.as_bytes().to_vec(),
    }
}

/// Turn a `write` payload into socket bytes.
///
/// Accepts a string, an array of byte values, or a serialized buffer
/// object (`{"type": "Buffer", "data": [...]}`).
pub fn encode_payload(payload: &Value, encoding: WriteEncoding) -> Result<Vec<u8>> {
    match payload {
        Value::String(text) => Ok(encode_text(text, encoding)),
        Value::Array(items) => byte_array(items),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("Buffer") => {
            match map.get("data") {
                Some(Value::Array(items)) => byte_array(items),
                _ => Err(malformed("buffer object without a data array")),
            }
        }
        other => Err(malformed(&format!("cannot write a {} payload", kind(other)))),
    }
}

fn byte_array(items: &[Value]) -> Result<Vec<u8>> {
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| malformed(&format!("{} is not a byte", item)))
        })
        .collect()
}

fn malformed(reason: &str) -> BridgeError {
    BridgeError::MalformedPayload {
        topic: "write".to_string(),
        reason: reason.to_string(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_socket_event(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> SocketEvent {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(BridgeEvent::Socket { event, .. })) => event,
            other => panic!("expected a socket event, got {:?}", other),
        }
    }

    #[test]
    fn ascii_keeps_low_byte_of_each_unit() {
        assert_eq!(encode_text("AT\r\n", WriteEncoding::Ascii), b"AT\r\n".to_vec());
        // U+00E9 fits in one byte, U+20AC is truncated to 0xAC
        assert_eq!(encode_text("é€", WriteEncoding::Ascii), vec![0xE9, 0xAC]);
        assert_eq!(encode_text("é", WriteEncoding::Utf8), vec![0xC3, 0xA9]);
    }

    #[test]
    fn byte_payloads_are_written_unchanged() {
        assert_eq!(
            encode_payload(&json!([0, 1, 255]), WriteEncoding::Ascii).unwrap(),
            vec![0, 1, 255]
        );
        assert_eq!(
            encode_payload(&json!({"type": "Buffer", "data": [104, 105]}), WriteEncoding::Ascii)
                .unwrap(),
            b"hi".to_vec()
        );
    }

    #[test]
    fn unwritable_payloads_are_malformed() {
        for payload in [json!(42), json!(null), json!([256]), json!({"data": [1]})] {
            let err = encode_payload(&payload, WriteEncoding::Ascii).unwrap_err();
            assert!(matches!(err, BridgeError::MalformedPayload { .. }), "{:?}", payload);
        }
    }

    #[tokio::test]
    async fn inbound_bytes_are_reported_then_close() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::open(local, tx);

        remote.write_all(b"OK\r\n").await.unwrap();
        assert_eq!(next_socket_event(&mut rx).await, SocketEvent::Data(b"OK\r\n".to_vec()));

        drop(remote);
        assert_eq!(
            next_socket_event(&mut rx).await,
            SocketEvent::Closed { had_error: false }
        );
        drop(handle);
    }

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )))
        }
    }

    #[tokio::test]
    async fn read_error_reports_error_then_error_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(Uuid::new_v4(), ResetReader, tx).await;

        match next_socket_event(&mut rx).await {
            SocketEvent::Error(message) => assert!(message.contains("connection reset")),
            other => panic!("expected an error first, got {:?}", other),
        }
        assert_eq!(
            next_socket_event(&mut rx).await,
            SocketEvent::Closed { had_error: true }
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writes_reach_the_remote_end() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::open(local, tx);

        handle.write(b"ping".to_vec());
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(1), remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn detached_socket_stops_reporting() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::open(local, tx);

        handle.detach();
        tokio::task::yield_now().await;
        let _ = remote.write_all(b"late").await;

        if let Ok(Some(event)) = timeout(Duration::from_millis(100), rx.recv()).await {
            panic!("detached socket still reported {:?}", event);
        }
        drop(handle);
    }
}
