/*!
 * Connection Manager
 * State machine for pairing, profile connection and teardown of the single device
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::discovery::UNKNOWN_DEVICE_NAME;
use super::serial::{SocketEvent, SocketHandle};
use super::status::StatusReporter;
use super::BridgeEvent;
use crate::bluetooth::{BluetoothBackend, DeviceHandle, IncomingConnection};
use crate::config::BluetoothConfig;
use crate::error::{BridgeError, Result};
use crate::host::{Indicator, OutputBus};

/// Deadlines and profile used by connect attempts.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub profile_uuid: String,
    pub pair_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_wait: Duration,
    pub disconnect_timeout: Duration,
}

impl From<&BluetoothConfig> for ConnectSettings {
    fn from(config: &BluetoothConfig) -> Self {
        Self {
            profile_uuid: config.profile_uuid.clone(),
            pair_timeout: config.pair_timeout(),
            connect_timeout: config.connect_timeout(),
            socket_wait: config.socket_wait(),
            disconnect_timeout: config.shutdown_timeout(),
        }
    }
}

/// The device we hold a socket for. Lives and dies with its socket.
#[derive(Debug)]
pub struct ConnectedDevice {
    pub address: String,
    pub display_name: String,
    pub device: DeviceHandle,
    pub socket: SocketHandle,
}

#[derive(Debug)]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u64, address: String },
    Connected(ConnectedDevice),
    Disconnecting(ConnectedDevice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn kind(&self) -> StateKind {
        match self {
            ConnectionState::Idle => StateKind::Idle,
            ConnectionState::Connecting { .. } => StateKind::Connecting,
            ConnectionState::Connected(_) => StateKind::Connected,
            ConnectionState::Disconnecting(_) => StateKind::Disconnecting,
        }
    }

    pub fn device(&self) -> Option<&ConnectedDevice> {
        match self {
            ConnectionState::Connected(device) | ConnectionState::Disconnecting(device) => Some(device),
            _ => None,
        }
    }

    /// Address being connected to or held.
    pub fn address(&self) -> Option<&str> {
        match self {
            ConnectionState::Connecting { address, .. } => Some(address),
            other => other.device().map(|d| d.address.as_str()),
        }
    }
}

pub struct ConnectionManager<B: BluetoothBackend> {
    backend: Arc<B>,
    settings: ConnectSettings,
    status: StatusReporter,
    outputs: OutputBus,
    events: mpsc::UnboundedSender<BridgeEvent>,
    state: ConnectionState,
    next_attempt: u64,
    since: DateTime<Utc>,
}

impl<B: BluetoothBackend> ConnectionManager<B> {
    pub fn new(
        backend: Arc<B>,
        settings: ConnectSettings,
        status: StatusReporter,
        outputs: OutputBus,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        Self {
            backend,
            settings,
            status,
            outputs,
            events,
            state: ConnectionState::Idle,
            next_attempt: 0,
            since: Utc::now(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn indicator(&self) -> Indicator {
        self.status.indicator()
    }

    /// Start a connect attempt. Returns false when one is not allowed now.
    pub fn connect(&mut self, address: &str) -> bool {
        if !matches!(self.state, ConnectionState::Idle) {
            debug!(
                "Ignoring connect to {} while {:?}",
                address,
                self.state.kind()
            );
            return false;
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        info!("Connecting to {}", address);
        self.set_state(ConnectionState::Connecting {
            attempt,
            address: address.to_string(),
        });

        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let event = match establish(&*backend, &address, &settings).await {
                Ok(()) => BridgeEvent::ProfileCallReturned { attempt },
                Err(error) => BridgeEvent::AttemptFailed { attempt, error },
            };
            let _ = events.send(event);
        });
        true
    }

    pub fn on_attempt_failed(&mut self, attempt: u64, error: BridgeError) {
        match self.pending_address(attempt) {
            Some(address) => {
                warn!("Error on connecting device {}. {}", address, error);
                self.enter_idle();
            }
            None => debug!("Dropping failure of stale attempt {}: {}", attempt, error),
        }
    }

    /// ConnectProfile returned; the socket should follow shortly.
    pub fn on_profile_call_returned(&mut self, attempt: u64) {
        if self.pending_address(attempt).is_none() {
            return;
        }

        debug!("Serial profile connected, waiting for socket");
        let wait = self.settings.socket_wait;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(BridgeEvent::SocketWaitExpired { attempt });
        });
    }

    pub fn on_socket_wait_expired(&mut self, attempt: u64) {
        if let Some(address) = self.pending_address(attempt) {
            warn!(
                "Error on connecting device {}. {}",
                address,
                BridgeError::Timeout("Waiting for the serial socket")
            );
            self.enter_idle();
        }
    }

    /// A serial socket was opened, by our attempt or by the remote device.
    pub fn on_profile_connected(&mut self, incoming: IncomingConnection<B::Stream>) {
        let IncomingConnection { device, name, stream } = incoming;

        match &self.state {
            ConnectionState::Connected(held) | ConnectionState::Disconnecting(held) => {
                warn!(
                    "Rejecting serial connection from {}: already connected to {}",
                    device.address, held.address
                );
                return;
            }
            ConnectionState::Connecting { address, .. } if !address.eq_ignore_ascii_case(&device.address) => {
                warn!(
                    "Rejecting serial connection from {}: connecting to {}",
                    device.address, address
                );
                return;
            }
            _ => {}
        }

        let display_name = name.unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());
        info!("Serial Connection from {}", display_name);

        let socket = SocketHandle::open(stream, self.events.clone());
        let socket_id = socket.id();
        self.set_state(ConnectionState::Connected(ConnectedDevice {
            address: device.address.clone(),
            display_name: display_name.clone(),
            device,
            socket,
        }));
        self.status.connected(&display_name, socket_id);
    }

    pub fn on_socket_event(&mut self, socket: Uuid, event: SocketEvent) {
        let name = match &self.state {
            ConnectionState::Connected(held) if held.socket.id() == socket => held.display_name.clone(),
            _ => {
                debug!("Ignoring event from stale socket {}", socket);
                return;
            }
        };

        match event {
            SocketEvent::Data(bytes) => self.outputs.send_data(bytes),
            SocketEvent::Error(message) => {
                warn!("{}", BridgeError::Transport(message));
                self.enter_idle();
            }
            SocketEvent::Closed { had_error: true } => {
                warn!("Closing socket with error for device {}", name);
                self.enter_idle();
            }
            SocketEvent::Closed { had_error: false } => {
                debug!("Closing socket from device {}", name);
                self.enter_idle();
            }
        }
    }

    /// Detach from the socket and ask the adapter to disconnect.
    pub fn disconnect(&mut self) {
        let ConnectionState::Connected(held) = &self.state else {
            debug!("Nothing to disconnect while {:?}", self.state.kind());
            return;
        };

        debug!("Disconnecting from device {}", held.address);
        held.socket.detach();

        let backend = self.backend.clone();
        let events = self.events.clone();
        let device = held.device.clone();
        let socket = held.socket.id();
        let limit = self.settings.disconnect_timeout;
        tokio::spawn(async move {
            let result = match timeout(limit, backend.disconnect(&device)).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Timeout("Disconnect")),
            };
            let _ = events.send(BridgeEvent::DisconnectFinished { socket, result });
        });

        self.transition(|state| match state {
            ConnectionState::Connected(held) => ConnectionState::Disconnecting(held),
            other => other,
        });
    }

    pub fn on_disconnect_finished(&mut self, socket: Uuid, result: Result<()>) {
        let current = matches!(
            &self.state,
            ConnectionState::Disconnecting(held) if held.socket.id() == socket
        );
        if !current {
            return;
        }

        match result {
            Ok(()) => debug!("Disconnected"),
            Err(e) => warn!("Error on disconnecting device. {}", e),
        }
        self.enter_idle();
    }

    /// The adapter wants the socket of `device` released.
    pub fn on_disconnect_requested(&mut self, device: &DeviceHandle) {
        let matches = matches!(
            &self.state,
            ConnectionState::Connected(held)
                if held.device.id == device.id || held.address.eq_ignore_ascii_case(&device.address)
        );
        if matches {
            info!("Releasing serial socket of {} on request", device.address);
            self.enter_idle();
        }
    }

    pub fn write(&self, bytes: Vec<u8>) {
        match &self.state {
            ConnectionState::Connected(held) => {
                debug!("Will write {} bytes to {}", bytes.len(), held.address);
                held.socket.write(bytes);
            }
            other => debug!("No open socket while {:?}; dropping write", other.kind()),
        }
    }

    /// Force-disconnect for daemon shutdown, bounded by the disconnect timeout.
    pub async fn shutdown(&mut self) {
        match &self.state {
            ConnectionState::Connected(held) => {
                held.socket.detach();
                match timeout(self.settings.disconnect_timeout, self.backend.disconnect(&held.device)).await {
                    Ok(Ok(())) => debug!("Disconnected from {}", held.address),
                    Ok(Err(e)) => warn!("Error on disconnecting device. {}", e),
                    Err(_) => warn!("{}", BridgeError::Timeout("Disconnect")),
                }
                self.enter_idle();
            }
            ConnectionState::Connecting { .. } | ConnectionState::Disconnecting(_) => self.enter_idle(),
            ConnectionState::Idle => {}
        }
    }

    fn pending_address(&self, attempt: u64) -> Option<String> {
        match &self.state {
            ConnectionState::Connecting {
                attempt: current,
                address,
            } if *current == attempt => Some(address.clone()),
            _ => None,
        }
    }

    /// Every path back to Idle goes through here, so `{connected:false}` is emitted once per teardown.
    fn enter_idle(&mut self) {
        self.set_state(ConnectionState::Idle);
        self.status.disconnected();
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.transition(|_| state);
    }

    fn transition(&mut self, next: impl FnOnce(ConnectionState) -> ConnectionState) {
        let from = self.state.kind();
        let current = std::mem::replace(&mut self.state, ConnectionState::Idle);
        self.state = next(current);
        self.since = Utc::now();
        debug!("Connection state {:?} -> {:?}", from, self.state.kind());
    }
}

async fn establish<B: BluetoothBackend>(
    backend: &B,
    address: &str,
    settings: &ConnectSettings,
) -> Result<()> {
    let device = backend.device(address).await?;
    match backend.device_name(&device).await {
        Ok(name) => debug!("Device {} {}", address, name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)),
        Err(e) => debug!("Could not read name of {}: {}", address, e),
    }

    if !backend.is_paired(&device).await? {
        info!("Pairing with {}", address);
        let paired = match timeout(settings.pair_timeout, backend.pair(&device)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout("Pairing")),
        };
        if let Err(e) = paired {
            warn!("Error while pairing to device {}: {}", address, e);
            return Err(e);
        }
    }

    match timeout(
        settings.connect_timeout,
        backend.connect_profile(&device, &settings.profile_uuid),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout("Serial profile connection")),
    }
}
