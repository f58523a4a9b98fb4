/*!
 * Bluetooth Adapter Collaborator
 * The radio-facing interface consumed by the bridge core, and its BlueZ binding
 */

pub mod agent;
pub mod bluez;
pub mod profile;

#[cfg(test)]
pub mod mock;

use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;

pub use bluez::BluezBackend;

/// Serial Port Profile service class
pub const SERIAL_PORT_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";

/// Opaque reference to one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub name: String,
    pub id: String,
}

/// Opaque reference to one remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub id: String,
}

/// Raw properties delivered with a device-found event. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound {
    pub id: String,
    pub properties: DeviceProperties,
}

/// An open serial-profile socket handed over by the adapter.
#[derive(Debug)]
pub struct IncomingConnection<S> {
    pub device: DeviceHandle,
    pub name: Option<String>,
    pub stream: S,
}

#[derive(Debug)]
pub enum BackendEvent<S> {
    DeviceFound(DeviceFound),
    ProfileConnected(IncomingConnection<S>),
    /// The adapter asks us to release the socket of this device
    ProfileDisconnectRequested(DeviceHandle),
}

pub type BackendEvents<S> = mpsc::UnboundedSender<BackendEvent<S>>;

/// Operations the bridge needs from a Bluetooth stack.
pub trait BluetoothBackend: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn adapter(&self, name: &str) -> impl Future<Output = Result<AdapterHandle>> + Send;

    fn is_discovering(&self, adapter: &AdapterHandle) -> impl Future<Output = Result<bool>> + Send;

    fn start_discovery(&self, adapter: &AdapterHandle) -> impl Future<Output = Result<()>> + Send;

    fn stop_discovery(&self, adapter: &AdapterHandle) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to device-found events. Calling it again must not add a second subscription.
    fn watch_devices(
        &self,
        events: BackendEvents<Self::Stream>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn device(&self, address: &str) -> impl Future<Output = Result<DeviceHandle>> + Send;

    fn device_name(
        &self,
        device: &DeviceHandle,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    fn is_paired(&self, device: &DeviceHandle) -> impl Future<Output = Result<bool>> + Send;

    fn pair(&self, device: &DeviceHandle) -> impl Future<Output = Result<()>> + Send;

    fn connect_profile(
        &self,
        device: &DeviceHandle,
        uuid: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self, device: &DeviceHandle) -> impl Future<Output = Result<()>> + Send;

    fn register_pairing_agent(&self) -> impl Future<Output = Result<()>> + Send;

    /// Register the serial profile; opened sockets arrive as `ProfileConnected` events.
    fn register_serial_profile(
        &self,
        uuid: &str,
        events: BackendEvents<Self::Stream>,
    ) -> impl Future<Output = Result<()>> + Send;
}
