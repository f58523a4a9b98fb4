/*!
 * Serial Bridge Core
 * One actor task owns the adapter session, discovery listener and connection
 * state; commands and hardware events are processed one at a time
 */

pub mod adapter;
pub mod command;
pub mod connection;
pub mod discovery;
pub mod serial;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bluetooth::{BackendEvent, BluetoothBackend};
use crate::config::DaemonConfig;
use crate::error::{BridgeError, Result};
use crate::host::{HostMessage, HostOutput, Indicator, OutputBus};

use adapter::{AdapterSession, ScanOutcome};
use command::{Command, TOPIC_ADDRESS};
use connection::{ConnectSettings, ConnectionManager, StateKind};
use discovery::DiscoveryListener;
use serial::SocketEvent;
use status::StatusReporter;

const REQUEST_BUFFER: usize = 64;

/// Reports from tasks spawned by the bridge.
#[derive(Debug)]
pub enum BridgeEvent {
    AttemptFailed { attempt: u64, error: BridgeError },
    ProfileCallReturned { attempt: u64 },
    SocketWaitExpired { attempt: u64 },
    Socket { socket: Uuid, event: SocketEvent },
    DisconnectFinished { socket: Uuid, result: Result<()> },
}

pub enum BridgeRequest {
    Input(HostMessage),
    Snapshot(oneshot::Sender<StatusSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: StateKind,
    pub address: Option<String>,
    pub device: Option<String>,
    pub socket: Option<Uuid>,
    pub adapter: Option<String>,
    pub scanning: bool,
    pub indicator: Indicator,
    pub since: DateTime<Utc>,
}

/// Cloneable access to a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    requests: mpsc::Sender<BridgeRequest>,
    outputs: OutputBus,
    indicator: watch::Receiver<Indicator>,
}

impl BridgeHandle {
    pub async fn input(&self, msg: HostMessage) -> Result<()> {
        self.requests
            .send(BridgeRequest::Input(msg))
            .await
            .map_err(|_| bridge_gone())
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(BridgeRequest::Snapshot(tx))
            .await
            .map_err(|_| bridge_gone())?;
        rx.await.map_err(|_| bridge_gone())
    }

    /// Ask the bridge to tear down and wait until it has.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(BridgeRequest::Shutdown(tx))
            .await
            .map_err(|_| bridge_gone())?;
        rx.await.map_err(|_| bridge_gone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostOutput> {
        self.outputs.subscribe()
    }

    pub fn indicator(&self) -> Indicator {
        self.indicator.borrow().clone()
    }
}

fn bridge_gone() -> BridgeError {
    BridgeError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "bridge is not running",
    ))
}

pub struct Bridge<B: BluetoothBackend> {
    backend: Arc<B>,
    config: DaemonConfig,
    adapter: AdapterSession<B>,
    discovery: DiscoveryListener,
    connection: ConnectionManager<B>,
    requests: mpsc::Receiver<BridgeRequest>,
    backend_tx: mpsc::UnboundedSender<BackendEvent<B::Stream>>,
    backend_rx: mpsc::UnboundedReceiver<BackendEvent<B::Stream>>,
    internal_rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl<B: BluetoothBackend> Bridge<B> {
    pub fn new(backend: Arc<B>, config: DaemonConfig) -> (Self, BridgeHandle) {
        let outputs = OutputBus::new();
        let (status, indicator) = StatusReporter::new(outputs.clone());
        let (requests_tx, requests) = mpsc::channel(REQUEST_BUFFER);
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(
            backend.clone(),
            ConnectSettings::from(&config.bluetooth),
            status,
            outputs.clone(),
            internal_tx,
        );

        let bridge = Self {
            adapter: AdapterSession::new(backend.clone()),
            discovery: DiscoveryListener::new(outputs.clone()),
            backend,
            config,
            connection,
            requests,
            backend_tx,
            backend_rx,
            internal_rx,
        };
        let handle = BridgeHandle {
            requests: requests_tx,
            outputs,
            indicator,
        };
        (bridge, handle)
    }

    /// Register the pairing agent and the serial profile. Failures are logged, not fatal.
    pub async fn initialize(&self) {
        match self.backend.register_pairing_agent().await {
            Ok(()) => debug!("Agent registered"),
            Err(e) => warn!("Could not register pairing agent: {}", e),
        }

        let uuid = &self.config.bluetooth.profile_uuid;
        match self
            .backend
            .register_serial_profile(uuid, self.backend_tx.clone())
            .await
        {
            Ok(()) => debug!("Serial profile registered"),
            Err(e) => warn!("Could not register serial profile: {}", e),
        }
    }

    pub async fn run(mut self) {
        info!("Bridge ready");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(BridgeRequest::Input(msg)) => self.handle_input(msg).await,
                    Some(BridgeRequest::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(BridgeRequest::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.backend_rx.recv() => self.handle_backend_event(event),
                Some(event) = self.internal_rx.recv() => self.handle_internal_event(event),
            }
        }

        info!("Bridge stopped");
    }

    async fn handle_input(&mut self, msg: HostMessage) {
        match Command::parse(&msg, self.config.serial.write_encoding) {
            Ok(command) => self.execute(command).await,
            Err(e) if msg.topic == TOPIC_ADDRESS => {
                warn!("{}; treating as a disconnect request", e);
                self.connection.disconnect();
            }
            Err(e) => warn!("Ignoring '{}' command: {}", msg.topic, e),
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Scan { enable: true, adapter } => {
                let name = adapter.unwrap_or_else(|| self.config.bluetooth.adapter.clone());
                self.start_scan(&name).await;
            }
            Command::Scan { enable: false, .. } => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Error while stopping discovery. {}", e);
                }
            }
            Command::Connect(address) => {
                self.connection.connect(&address);
            }
            Command::Disconnect => self.connection.disconnect(),
            Command::Write(bytes) => self.connection.write(bytes),
            Command::Ignored(reason) => debug!("Ignoring host message: {}", reason),
        }
    }

    async fn start_scan(&mut self, name: &str) {
        if let Err(e) = self
            .discovery
            .ensure_registered(&*self.backend, self.backend_tx.clone())
            .await
        {
            warn!("Could not watch for devices: {}", e);
        }

        match self.adapter.start_scan(name).await {
            Ok(ScanOutcome::Started) => debug!("Discovering ..."),
            Ok(ScanOutcome::AlreadyDiscovering) => debug!("Adapter {} already discovering", name),
            Err(e @ BridgeError::AdapterNotFound(_)) => warn!("No bluetooth adapter: {}", e),
            Err(e) => warn!("Error while starting discovery. {}", e),
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent<B::Stream>) {
        match event {
            BackendEvent::DeviceFound(found) => self.discovery.on_device_found(&found),
            BackendEvent::ProfileConnected(incoming) => self.connection.on_profile_connected(incoming),
            BackendEvent::ProfileDisconnectRequested(device) => {
                self.connection.on_disconnect_requested(&device)
            }
        }
    }

    fn handle_internal_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::AttemptFailed { attempt, error } => {
                self.connection.on_attempt_failed(attempt, error)
            }
            BridgeEvent::ProfileCallReturned { attempt } => {
                self.connection.on_profile_call_returned(attempt)
            }
            BridgeEvent::SocketWaitExpired { attempt } => {
                self.connection.on_socket_wait_expired(attempt)
            }
            BridgeEvent::Socket { socket, event } => self.connection.on_socket_event(socket, event),
            BridgeEvent::DisconnectFinished { socket, result } => {
                self.connection.on_disconnect_finished(socket, result)
            }
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let state = self.connection.state();
        let held = state.device();
        StatusSnapshot {
            state: state.kind(),
            address: state.address().map(str::to_string),
            device: held.map(|d| d.display_name.clone()),
            socket: held.map(|d| d.socket.id()),
            adapter: self.adapter.adapter().map(|a| a.name.clone()),
            scanning: self.adapter.is_scanning(),
            indicator: self.connection.indicator(),
            since: self.connection.since(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bridge");
        self.connection.shutdown().await;

        if self.adapter.is_scanning() {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Error while stopping discovery. {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{Call, MockBackend};
    use crate::bluetooth::DeviceProperties;
    use crate::host::ControlMessage;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WIDGET: &str = "AA:BB:CC:DD:EE:FF";

    struct Harness {
        backend: Arc<MockBackend>,
        handle: BridgeHandle,
        outputs: broadcast::Receiver<HostOutput>,
    }

    async fn start(backend: MockBackend) -> Harness {
        let mut config = DaemonConfig::default();
        config.bluetooth.pair_timeout_secs = 2;
        config.bluetooth.connect_timeout_secs = 2;
        config.bluetooth.socket_wait_secs = 1;
        config.bluetooth.shutdown_timeout_secs = 1;

        let backend = Arc::new(backend);
        let (bridge, handle) = Bridge::new(backend.clone(), config);
        bridge.initialize().await;
        let outputs = handle.subscribe();
        tokio::spawn(bridge.run());

        Harness {
            backend,
            handle,
            outputs,
        }
    }

    impl Harness {
        async fn send(&self, topic: &str, payload: Value) {
            self.handle.input(HostMessage::new(topic, payload)).await.unwrap();
        }

        async fn state(&self) -> StateKind {
            self.handle.snapshot().await.unwrap().state
        }

        async fn next_output(&mut self) -> HostOutput {
            timeout(Duration::from_secs(3), self.outputs.recv())
                .await
                .expect("no output in time")
                .expect("output bus closed")
        }

        /// Next control message, skipping data and indicator updates.
        async fn next_control(&mut self) -> ControlMessage {
            loop {
                if let HostOutput::Control(msg) = self.next_output().await {
                    return msg;
                }
            }
        }

        async fn assert_quiet(&mut self) {
            let late = timeout(Duration::from_millis(200), self.outputs.recv()).await;
            assert!(late.is_err(), "unexpected output {:?}", late);
        }

        async fn wait_for(&self, kind: StateKind) {
            for _ in 0..100 {
                if self.state().await == kind {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("bridge never reached {:?}", kind);
        }

        async fn connect_widget(&mut self) -> tokio::io::DuplexStream {
            self.send("address", json!(format!("{} Widget", WIDGET))).await;
            match self.next_control().await {
                ControlMessage::Connexion { connected: true, device, socket } => {
                    assert_eq!(device.as_deref(), Some("Widget"));
                    assert!(socket.is_some());
                }
                other => panic!("expected connected status, got {:?}", other),
            }
            assert_eq!(self.next_output().await, HostOutput::Indicator(Indicator::connected()));
            self.backend.take_remote().expect("socket was opened")
        }

        async fn expect_disconnected(&mut self) {
            assert_eq!(self.next_control().await, ControlMessage::disconnected());
            assert_eq!(
                self.next_output().await,
                HostOutput::Indicator(Indicator::disconnected())
            );
        }
    }

    #[tokio::test]
    async fn scan_reports_candidates() {
        let mut h = start(MockBackend::new()).await;

        h.send("scan", json!(true)).await;
        h.wait_for(StateKind::Idle).await;
        assert!(h.backend.is_discovering_now());

        h.backend.announce(
            "/mock/dev_1",
            DeviceProperties {
                address: Some(WIDGET.to_string()),
                name: Some("Widget".to_string()),
            },
        );
        h.backend.announce(
            "/mock/dev_2",
            DeviceProperties {
                address: Some("11:22:33:44:55:66".to_string()),
                name: None,
            },
        );

        assert_eq!(h.next_control().await, ControlMessage::candidate(WIDGET, "Widget"));
        assert_eq!(
            h.next_control().await,
            ControlMessage::candidate("11:22:33:44:55:66", "???")
        );
    }

    #[tokio::test]
    async fn repeated_scans_register_once() {
        let h = start(MockBackend::new()).await;

        h.send("scan", json!(true)).await;
        h.send("scan", json!(true)).await;
        h.send("scan", json!(false)).await;
        h.send("scan", json!(true)).await;
        h.wait_for(StateKind::Idle).await;

        assert_eq!(h.backend.count(&Call::WatchDevices), 1);
        assert_eq!(h.backend.count(&Call::Adapter("hci0".to_string())), 1);
        assert_eq!(h.backend.count(&Call::StartDiscovery), 2);
        assert!(h.handle.snapshot().await.unwrap().scanning);
    }

    #[tokio::test]
    async fn missing_adapter_is_not_fatal() {
        let h = start(MockBackend::new()).await;

        let mut msg = HostMessage::new("scan", json!(true));
        msg.adapter = Some("hci7".to_string());
        h.handle.input(msg).await.unwrap();

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, StateKind::Idle);
        assert_eq!(snapshot.adapter, None);
        assert!(!snapshot.scanning);
    }

    #[tokio::test]
    async fn connect_pairs_and_streams_data() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), false)).await;
        let mut remote = h.connect_widget().await;

        assert_eq!(h.backend.count(&Call::Pair(WIDGET.to_string())), 1);
        assert_eq!(h.state().await, StateKind::Connected);
        assert!(h.handle.indicator().is_connected());

        remote.write_all(b"hello").await.unwrap();
        loop {
            if let HostOutput::Data(data) = h.next_output().await {
                assert_eq!(data.payload, b"hello".to_vec());
                break;
            }
        }

        h.send("write", json!("AT\r\n")).await;
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(1), remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"AT\r\n");
    }

    #[tokio::test]
    async fn paired_device_skips_pairing() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let _remote = h.connect_widget().await;

        assert_eq!(h.backend.count(&Call::Pair(WIDGET.to_string())), 0);
        assert_eq!(h.backend.count(&Call::ConnectProfile(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn duplicate_connect_while_pairing_is_ignored() {
        let backend = MockBackend::new().with_device(WIDGET, Some("Widget"), false);
        backend.hold_pairing();
        let mut h = start(backend).await;

        h.send("address", json!(WIDGET)).await;
        h.wait_for(StateKind::Connecting).await;
        h.send("address", json!(WIDGET)).await;
        h.send("address", json!("11:22:33:44:55:66")).await;
        assert_eq!(h.state().await, StateKind::Connecting);

        h.backend.release_pairing();
        match h.next_control().await {
            ControlMessage::Connexion { connected, .. } => assert!(connected),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(h.backend.count(&Call::Pair(WIDGET.to_string())), 1);
        assert_eq!(h.backend.count(&Call::ConnectProfile(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn pairing_failure_returns_to_idle() {
        let backend = MockBackend::new().with_device(WIDGET, Some("Widget"), false);
        backend.fail_pairing();
        let mut h = start(backend).await;

        h.send("address", json!(WIDGET)).await;
        h.expect_disconnected().await;
        assert_eq!(h.state().await, StateKind::Idle);
        assert_eq!(h.backend.count(&Call::ConnectProfile(WIDGET.to_string())), 0);

        // No retry
        h.assert_quiet().await;
        assert_eq!(h.backend.count(&Call::Pair(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn profile_failure_returns_to_idle() {
        let backend = MockBackend::new().with_device(WIDGET, Some("Widget"), true);
        backend.fail_profile_connect();
        let mut h = start(backend).await;

        h.send("address", json!(WIDGET)).await;
        h.expect_disconnected().await;
        assert_eq!(h.state().await, StateKind::Idle);
    }

    #[tokio::test]
    async fn remote_close_emits_one_disconnect() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let remote = h.connect_widget().await;

        drop(remote);
        h.expect_disconnected().await;
        assert_eq!(h.state().await, StateKind::Idle);
        assert!(!h.handle.indicator().is_connected());
        h.assert_quiet().await;
        // Close needs no adapter-level disconnect
        assert_eq!(h.backend.count(&Call::Disconnect(WIDGET.to_string())), 0);
    }

    #[tokio::test]
    async fn explicit_disconnect_tears_down() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let _remote = h.connect_widget().await;

        h.send("disconnect", Value::Null).await;
        h.expect_disconnected().await;
        assert_eq!(h.state().await, StateKind::Idle);
        assert_eq!(h.backend.count(&Call::Disconnect(WIDGET.to_string())), 1);

        h.send("disconnect", Value::Null).await;
        h.assert_quiet().await;
        assert_eq!(h.backend.count(&Call::Disconnect(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn malformed_address_disconnects() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let _remote = h.connect_widget().await;

        h.send("address", json!({"not": "a string"})).await;
        h.expect_disconnected().await;
        assert_eq!(h.backend.count(&Call::Disconnect(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn write_while_idle_does_nothing() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;

        h.send("write", json!("ignored")).await;
        assert_eq!(h.state().await, StateKind::Idle);
        h.assert_quiet().await;
        assert!(h.backend.take_remote().is_none());
    }

    #[tokio::test]
    async fn second_connection_is_a_noop_while_connected() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let _remote = h.connect_widget().await;

        h.send("address", json!(WIDGET)).await;
        h.backend.push_connection("11:22:33:44:55:66", Some("Intruder"));
        h.assert_quiet().await;

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, StateKind::Connected);
        assert_eq!(snapshot.device.as_deref(), Some("Widget"));
        assert_eq!(h.backend.count(&Call::ConnectProfile(WIDGET.to_string())), 1);
    }

    #[tokio::test]
    async fn adapter_release_request_tears_down() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        let _remote = h.connect_widget().await;

        h.backend.request_disconnection(WIDGET);
        h.expect_disconnected().await;
        assert_eq!(h.state().await, StateKind::Idle);
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored() {
        let mut h = start(MockBackend::new()).await;

        h.send("reboot", json!(true)).await;
        h.send("scan", json!("maybe")).await;
        assert_eq!(h.state().await, StateKind::Idle);
        h.assert_quiet().await;
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn shutdown_disconnects_and_stops_scanning() {
        let mut h = start(MockBackend::new().with_device(WIDGET, Some("Widget"), true)).await;
        h.send("scan", json!(true)).await;
        let _remote = h.connect_widget().await;

        h.handle.shutdown().await.unwrap();

        h.expect_disconnected().await;
        assert_eq!(h.backend.count(&Call::Disconnect(WIDGET.to_string())), 1);
        assert_eq!(h.backend.count(&Call::StopDiscovery), 1);
        assert!(!h.backend.is_discovering_now());
        assert!(h.handle.snapshot().await.is_err());
    }
}
