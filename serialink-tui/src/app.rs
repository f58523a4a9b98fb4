use anyhow::Result;
use chrono::{DateTime, Local};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tui_input::{Input, InputRequest};

use crate::client::{Indicator, Request, Response, SerialinkClient};

const LOG_CAPACITY: usize = 500;
const UNKNOWN_NAME: &str = "???";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub name: String,
    pub last_seen: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub device: String,
    pub since: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
    Info,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub time: DateTime<Local>,
    pub direction: Direction,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusedPanel {
    Devices,
    Console,
}

pub struct App {
    pub devices: Vec<Device>,
    pub selected_device: usize,
    pub focused_panel: FocusedPanel,
    pub scanning: bool,
    pub connection: Option<Connection>,
    pub indicator: Indicator,
    pub serial_log: Vec<LogLine>,
    pub input: Input,
    pub last_error: Option<String>,
    line_ending: &'static str,
    client: SerialinkClient,
    responses: mpsc::UnboundedReceiver<Response>,
}

impl App {
    pub async fn new(socket_path: &str, crlf: bool) -> Result<Self> {
        let (client, responses) = SerialinkClient::connect(socket_path).await?;
        let mut app = Self::with_client(client, responses, crlf);

        // Load initial data
        app.client.send_request(Request::Status).await?;
        Ok(app)
    }

    pub fn with_client(
        client: SerialinkClient,
        responses: mpsc::UnboundedReceiver<Response>,
        crlf: bool,
    ) -> Self {
        Self {
            devices: Vec::new(),
            selected_device: 0,
            focused_panel: FocusedPanel::Devices,
            scanning: false,
            connection: None,
            indicator: Indicator::default(),
            serial_log: Vec::with_capacity(LOG_CAPACITY),
            input: Input::default(),
            last_error: None,
            line_ending: if crlf { "\r\n" } else { "" },
            client,
            responses,
        }
    }

    pub fn previous_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = if self.selected_device == 0 {
                self.devices.len() - 1
            } else {
                self.selected_device - 1
            };
        }
    }

    pub fn next_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = (self.selected_device + 1) % self.devices.len();
        }
    }

    pub fn selected(&self) -> Option<&Device> {
        self.devices.get(self.selected_device)
    }

    pub fn is_editing(&self) -> bool {
        self.focused_panel == FocusedPanel::Console
    }

    pub fn start_editing(&mut self) {
        self.focused_panel = FocusedPanel::Console;
    }

    pub fn stop_editing(&mut self) {
        self.focused_panel = FocusedPanel::Devices;
    }

    pub fn edit(&mut self, request: InputRequest) {
        self.input.handle(request);
    }

    pub async fn toggle_scan(&mut self) -> Result<()> {
        self.scanning = !self.scanning;
        if self.scanning {
            self.devices.clear();
            self.selected_device = 0;
        }
        self.client.input("scan", json!(self.scanning)).await
    }

    pub async fn connect_selected(&mut self) -> Result<()> {
        let Some(device) = self.selected() else {
            return Ok(());
        };
        let payload = format!("{} {}", device.address, device.name);
        self.log(Direction::Info, format!("Connecting to {}", payload));
        self.client.input("address", json!(payload)).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.client.input("disconnect", Value::Null).await
    }

    /// Send the input line to the serial socket.
    pub async fn send_line(&mut self) -> Result<()> {
        let text = self.input.value().to_string();
        self.input.reset();
        if text.is_empty() {
            return Ok(());
        }

        self.log(Direction::Tx, text.clone());
        let payload = format!("{}{}", text, self.line_ending);
        self.client.input("write", json!(payload)).await
    }

    /// Apply everything the daemon sent since the last tick.
    pub fn poll_daemon(&mut self) {
        while let Ok(response) = self.responses.try_recv() {
            self.apply(response);
        }
    }

    pub fn apply(&mut self, response: Response) {
        match response {
            Response::Output { port: 0, msg } => self.apply_control(&msg),
            Response::Output { port: 1, msg } => {
                let bytes: Vec<u8> = msg
                    .get("payload")
                    .and_then(|p| serde_json::from_value(p.clone()).ok())
                    .unwrap_or_default();
                self.log(Direction::Rx, printable(&bytes));
            }
            Response::Output { .. } => {}
            Response::Indicator(indicator) => self.indicator = indicator,
            Response::Status { snapshot } => {
                self.scanning = snapshot.get("scanning").and_then(Value::as_bool).unwrap_or(false);
                if let Some(device) = snapshot.get("device").and_then(Value::as_str) {
                    self.connection = Some(Connection {
                        device: device.to_string(),
                        since: Local::now(),
                    });
                }
            }
            Response::Success { .. } => {}
            Response::Error { message } => self.last_error = Some(message),
        }
    }

    fn apply_control(&mut self, msg: &Value) {
        match msg.get("topic").and_then(Value::as_str) {
            Some("address") => {
                let payload = msg.get("payload").and_then(Value::as_str).unwrap_or_default();
                let mut parts = payload.splitn(2, ' ');
                let address = msg
                    .get("address")
                    .and_then(Value::as_str)
                    .or_else(|| parts.next())
                    .unwrap_or_default();
                let name = msg
                    .get("displayName")
                    .and_then(Value::as_str)
                    .or_else(|| parts.next())
                    .unwrap_or(UNKNOWN_NAME);
                if !address.is_empty() {
                    self.add_device(address, name);
                }
            }
            Some("connexion") => {
                let connected = msg.get("connected").and_then(Value::as_bool).unwrap_or(false);
                if connected {
                    let device = msg
                        .get("device")
                        .and_then(Value::as_str)
                        .unwrap_or(UNKNOWN_NAME)
                        .to_string();
                    self.log(Direction::Info, format!("Connected to {}", device));
                    self.connection = Some(Connection {
                        device,
                        since: Local::now(),
                    });
                } else if let Some(previous) = self.connection.take() {
                    self.log(Direction::Info, format!("Disconnected from {}", previous.device));
                }
            }
            _ => {}
        }
    }

    /// Repeated sightings update the existing row.
    fn add_device(&mut self, address: &str, name: &str) {
        let now = Local::now();
        if let Some(known) = self
            .devices
            .iter_mut()
            .find(|d| d.address.eq_ignore_ascii_case(address))
        {
            if name != UNKNOWN_NAME {
                known.name = name.to_string();
            }
            known.last_seen = now;
            return;
        }

        self.devices.push(Device {
            address: address.to_string(),
            name: name.to_string(),
            last_seen: now,
        });
    }

    fn log(&mut self, direction: Direction, text: String) {
        self.serial_log.push(LogLine {
            time: Local::now(),
            direction,
            text,
        });
        if self.serial_log.len() > LOG_CAPACITY {
            self.serial_log.remove(0);
        }
    }
}

/// Serial bytes as one display line, control characters escaped.
fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .flat_map(|c| match c {
            '\r' => "\\r".chars().collect::<Vec<_>>(),
            '\n' => "\\n".chars().collect(),
            c if c.is_control() => c.escape_default().collect(),
            c => vec![c],
        })
        .collect()
}
