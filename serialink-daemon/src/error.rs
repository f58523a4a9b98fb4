/*!
 * Error types for the serial bridge core
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bluetooth adapter '{0}' not found")]
    AdapterNotFound(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Unreadable properties for device {0}")]
    DeviceProperties(String),

    #[error("Bluetooth device not found: {0}")]
    DeviceNotFound(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Serial profile connection failed: {0}")]
    ProfileFailed(String),

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Malformed payload for '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },

    #[error("BlueZ error: {0}")]
    BlueZ(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<dbus::Error> for BridgeError {
    fn from(err: dbus::Error) -> Self {
        let name = err.name().unwrap_or("org.freedesktop.DBus.Error.Failed");
        let message = err.message().unwrap_or("no message");
        BridgeError::BlueZ(format!("{}: {}", name, message))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
