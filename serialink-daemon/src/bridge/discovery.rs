/*!
 * Device Discovery Listener
 * Turns device-found events into candidate-device notifications
 */

use tracing::{debug, warn};

use crate::bluetooth::{BackendEvents, BluetoothBackend, DeviceFound};
use crate::error::{BridgeError, Result};
use crate::host::{ControlMessage, OutputBus};

/// Shown when a device does not advertise a name.
pub const UNKNOWN_DEVICE_NAME: &str = "???";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub display_name: String,
}

impl TryFrom<&DeviceFound> for DiscoveredDevice {
    type Error = BridgeError;

    fn try_from(found: &DeviceFound) -> Result<Self> {
        let address = found
            .properties
            .address
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| BridgeError::DeviceProperties(found.id.clone()))?;
        let display_name = found
            .properties
            .name
            .clone()
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());

        Ok(Self {
            address,
            display_name,
        })
    }
}

pub struct DiscoveryListener {
    outputs: OutputBus,
    registered: bool,
}

impl DiscoveryListener {
    pub fn new(outputs: OutputBus) -> Self {
        Self {
            outputs,
            registered: false,
        }
    }

    /// Subscribe to device-found events the first time only.
    pub async fn ensure_registered<B: BluetoothBackend>(
        &mut self,
        backend: &B,
        events: BackendEvents<B::Stream>,
    ) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        backend.watch_devices(events).await?;
        self.registered = true;
        Ok(())
    }

    pub fn on_device_found(&self, found: &DeviceFound) {
        match DiscoveredDevice::try_from(found) {
            Ok(device) => {
                debug!("Found new Device '{}' {}", device.display_name, device.address);
                self.outputs
                    .send_control(ControlMessage::candidate(&device.address, &device.display_name));
            }
            Err(e) => warn!("Skipping discovered device: {}", e),
        }
    }
}
