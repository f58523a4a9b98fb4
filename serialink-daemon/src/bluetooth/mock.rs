//! In-memory backend for exercising the bridge without a radio.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};

use super::{
    AdapterHandle, BackendEvent, BackendEvents, BluetoothBackend, DeviceFound, DeviceHandle,
    DeviceProperties, IncomingConnection,
};
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Adapter(String),
    StartDiscovery,
    StopDiscovery,
    WatchDevices,
    Pair(String),
    ConnectProfile(String),
    Disconnect(String),
}

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub name: Option<String>,
    pub paired: bool,
}

#[derive(Default)]
struct State {
    adapters: Vec<String>,
    discovering: bool,
    devices: HashMap<String, MockDevice>,
    calls: Vec<Call>,
    events: Option<BackendEvents<DuplexStream>>,
    fail_pair: bool,
    fail_connect: bool,
    fail_stop: bool,
    open_socket_on_connect: bool,
    remote_ends: Vec<DuplexStream>,
    hold_pairing: bool,
}

/// Records every call; sockets are `tokio::io::duplex` pairs whose far end the test keeps.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<State>>,
    pairing_gate: Arc<Notify>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        {
            let mut state = backend.state.lock().unwrap();
            state.adapters.push("hci0".to_string());
            state.open_socket_on_connect = true;
        }
        backend
    }

    pub fn with_device(self, address: &str, name: Option<&str>, paired: bool) -> Self {
        self.state.lock().unwrap().devices.insert(
            address.to_string(),
            MockDevice {
                name: name.map(str::to_string),
                paired,
            },
        );
        self
    }

    pub fn fail_pairing(&self) {
        self.state.lock().unwrap().fail_pair = true;
    }

    pub fn fail_profile_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub fn fail_stop_discovery(&self) {
        self.state.lock().unwrap().fail_stop = true;
    }

    /// ConnectProfile succeeds but no socket is ever delivered.
    pub fn withhold_sockets(&self) {
        self.state.lock().unwrap().open_socket_on_connect = false;
    }

    /// Park `pair` until `release_pairing` is called.
    pub fn hold_pairing(&self) {
        self.state.lock().unwrap().hold_pairing = true;
    }

    pub fn release_pairing(&self) {
        self.pairing_gate.notify_one();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn is_discovering_now(&self) -> bool {
        self.state.lock().unwrap().discovering
    }

    /// Far end of the most recently opened socket.
    pub fn take_remote(&self) -> Option<DuplexStream> {
        self.state.lock().unwrap().remote_ends.pop()
    }

    /// Emit a device-found event as the adapter would.
    pub fn announce(&self, id: &str, properties: DeviceProperties) {
        let events = self.state.lock().unwrap().events.clone();
        if let Some(events) = events {
            let _ = events.send(BackendEvent::DeviceFound(DeviceFound {
                id: id.to_string(),
                properties,
            }));
        }
    }

    /// Deliver a socket for `address` without a prior ConnectProfile.
    pub fn push_connection(&self, address: &str, name: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let (local, remote) = tokio::io::duplex(1024);
        state.remote_ends.push(remote);
        if let Some(events) = &state.events {
            let _ = events.send(BackendEvent::ProfileConnected(IncomingConnection {
                device: handle(address),
                name: name.map(str::to_string),
                stream: local,
            }));
        }
    }

    pub fn request_disconnection(&self, address: &str) {
        let state = self.state.lock().unwrap();
        if let Some(events) = &state.events {
            let _ = events.send(BackendEvent::ProfileDisconnectRequested(handle(address)));
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn handle(address: &str) -> DeviceHandle {
    DeviceHandle {
        address: address.to_string(),
        id: format!("/mock/dev_{}", address.replace(':', "_")),
    }
}

impl BluetoothBackend for MockBackend {
    type Stream = DuplexStream;

    async fn adapter(&self, name: &str) -> Result<AdapterHandle> {
        self.record(Call::Adapter(name.to_string()));
        let state = self.state.lock().unwrap();
        if state.adapters.iter().any(|a| a == name) {
            Ok(AdapterHandle {
                name: name.to_string(),
                id: format!("/mock/{}", name),
            })
        } else {
            Err(BridgeError::AdapterNotFound(name.to_string()))
        }
    }

    async fn is_discovering(&self, _adapter: &AdapterHandle) -> Result<bool> {
        Ok(self.state.lock().unwrap().discovering)
    }

    async fn start_discovery(&self, _adapter: &AdapterHandle) -> Result<()> {
        self.record(Call::StartDiscovery);
        self.state.lock().unwrap().discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self, _adapter: &AdapterHandle) -> Result<()> {
        self.record(Call::StopDiscovery);
        let mut state = self.state.lock().unwrap();
        if state.fail_stop || !state.discovering {
            return Err(BridgeError::Discovery("No discovery started".to_string()));
        }
        state.discovering = false;
        Ok(())
    }

    async fn watch_devices(&self, events: BackendEvents<DuplexStream>) -> Result<()> {
        self.record(Call::WatchDevices);
        self.state.lock().unwrap().events.get_or_insert(events);
        Ok(())
    }

    async fn device(&self, address: &str) -> Result<DeviceHandle> {
        let state = self.state.lock().unwrap();
        if state.devices.contains_key(address) {
            Ok(handle(address))
        } else {
            Err(BridgeError::DeviceNotFound(address.to_string()))
        }
    }

    async fn device_name(&self, device: &DeviceHandle) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .get(&device.address)
            .and_then(|d| d.name.clone()))
    }

    async fn is_paired(&self, device: &DeviceHandle) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.devices.get(&device.address).is_some_and(|d| d.paired))
    }

    async fn pair(&self, device: &DeviceHandle) -> Result<()> {
        self.record(Call::Pair(device.address.clone()));
        let hold = self.state.lock().unwrap().hold_pairing;
        if hold {
            self.pairing_gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_pair {
            return Err(BridgeError::PairingFailed("Authentication Rejected".to_string()));
        }
        if let Some(d) = state.devices.get_mut(&device.address) {
            d.paired = true;
        }
        Ok(())
    }

    async fn connect_profile(&self, device: &DeviceHandle, _uuid: &str) -> Result<()> {
        self.record(Call::ConnectProfile(device.address.clone()));
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(BridgeError::ProfileFailed("Connection refused".to_string()));
        }
        if state.open_socket_on_connect {
            let name = state.devices.get(&device.address).and_then(|d| d.name.clone());
            let (local, remote) = tokio::io::duplex(1024);
            state.remote_ends.push(remote);
            if let Some(events) = &state.events {
                let _ = events.send(BackendEvent::ProfileConnected(IncomingConnection {
                    device: device.clone(),
                    name,
                    stream: local,
                }));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        self.record(Call::Disconnect(device.address.clone()));
        Ok(())
    }

    async fn register_pairing_agent(&self) -> Result<()> {
        Ok(())
    }

    async fn register_serial_profile(
        &self,
        _uuid: &str,
        events: BackendEvents<DuplexStream>,
    ) -> Result<()> {
        self.state.lock().unwrap().events.get_or_insert(events);
        Ok(())
    }
}

/// Event channel wired the way the bridge wires it.
pub fn event_channel() -> (
    BackendEvents<DuplexStream>,
    mpsc::UnboundedReceiver<BackendEvent<DuplexStream>>,
) {
    mpsc::unbounded_channel()
}
