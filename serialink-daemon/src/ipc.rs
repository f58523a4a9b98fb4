/*!
 * IPC Server for the SERIALINK Daemon
 * Newline-delimited JSON over a Unix socket; every client is a host
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

use crate::bridge::{BridgeHandle, StatusSnapshot};
use crate::host::{HostMessage, HostOutput, Indicator, Port};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Input {
        topic: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        adapter: Option<String>,
    },
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Output { port: usize, msg: Value },
    Indicator(Indicator),
    Status { snapshot: StatusSnapshot },
    Success { message: String },
    Error { message: String },
}

impl Response {
    fn output(port: Port, msg: impl Serialize) -> Self {
        Response::Output {
            port: port.index(),
            msg: serde_json::to_value(msg).unwrap_or(Value::Null),
        }
    }
}

impl From<HostOutput> for Response {
    fn from(output: HostOutput) -> Self {
        match output {
            HostOutput::Control(msg) => Response::output(Port::Control, msg),
            HostOutput::Data(msg) => Response::output(Port::Data, msg),
            HostOutput::Indicator(indicator) => Response::Indicator(indicator),
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    bridge: BridgeHandle,
    shutdown: mpsc::Sender<()>,
}

impl IpcServer {
    pub fn new(listener: UnixListener, bridge: BridgeHandle, shutdown: mpsc::Sender<()>) -> Self {
        Self {
            listener,
            bridge,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let bridge = self.bridge.clone();
                    let shutdown = self.shutdown.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, bridge, shutdown).await {
                            tracing::error!("Client error: {}", e);
                        }
                        tracing::debug!("Client disconnected");
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    bridge: BridgeHandle,
    shutdown: mpsc::Sender<()>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(write_half, rx));

    // Current indicator first, then everything the bridge emits
    let _ = tx.send(Response::Indicator(bridge.indicator()));
    let forwarder = tokio::spawn(forward_outputs(bridge.subscribe(), tx.clone()));

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", request);

        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => handle_request(request, &bridge, &shutdown).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };
        if tx.send(response).is_err() {
            break;
        }
    }

    forwarder.abort();
    drop(tx);
    writer.await??;
    Ok(())
}

async fn handle_request(
    request: Request,
    bridge: &BridgeHandle,
    shutdown: &mpsc::Sender<()>,
) -> Response {
    match request {
        Request::Input {
            topic,
            payload,
            adapter,
        } => {
            let msg = HostMessage {
                adapter,
                ..HostMessage::new(topic, payload)
            };
            match bridge.input(msg).await {
                Ok(()) => Response::Success {
                    message: "Accepted".to_string(),
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Status => match bridge.snapshot().await {
            Ok(snapshot) => Response::Status { snapshot },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },
        Request::Shutdown => {
            tracing::info!("Shutdown requested by client");
            let _ = shutdown.try_send(());
            Response::Success {
                message: "Shutting down".to_string(),
            }
        }
    }
}

async fn forward_outputs(
    mut outputs: broadcast::Receiver<HostOutput>,
    tx: mpsc::UnboundedSender<Response>,
) {
    loop {
        match outputs.recv().await {
            Ok(output) => {
                if tx.send(Response::from(output)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Client too slow, dropped {} outputs", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_responses(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Response>,
) -> Result<()> {
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
    }
    Ok(())
}
