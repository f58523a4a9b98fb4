/*!
 * SERIALINK Daemon Client
 * JSON IPC communication with serialinkd
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Input { topic: String, payload: Value },
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Output { port: usize, msg: Value },
    Indicator(Indicator),
    Status { snapshot: Value },
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub fill: String,
    pub shape: String,
    pub text: String,
}

impl Indicator {
    pub fn is_connected(&self) -> bool {
        self.fill == "green"
    }
}

impl Default for Indicator {
    fn default() -> Self {
        Self {
            fill: "red".to_string(),
            shape: "ring".to_string(),
            text: "disconnected".to_string(),
        }
    }
}

pub struct SerialinkClient {
    writer: OwnedWriteHalf,
}

impl SerialinkClient {
    /// Connect to the daemon; everything it sends arrives on the returned channel.
    pub async fn connect(socket_path: &str) -> Result<(Self, mpsc::UnboundedReceiver<Response>)> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Cannot reach serialinkd at {}", socket_path))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (read_half, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // Skip anything this client does not understand
                if let Ok(response) = serde_json::from_str::<Response>(&line) {
                    if tx.send(response).is_err() {
                        break;
                    }
                }
            }
        });

        (Self { writer }, rx)
    }

    pub async fn send_request(&mut self, request: Request) -> Result<()> {
        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');
        self.writer.write_all(request_json.as_bytes()).await?;
        Ok(())
    }

    pub async fn input(&mut self, topic: &str, payload: Value) -> Result<()> {
        self.send_request(Request::Input {
            topic: topic.to_string(),
            payload,
        })
        .await
    }
}
