/*!
 * Serial Port Profile Object
 * org.bluez.Profile1 implementation handing RFCOMM sockets to the bridge
 */

use dbus::arg::OwnedFd;
use dbus::channel::{MatchingReceiver, Sender, Token};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::{Message, Path};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::{Arc, Weak};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::bluez::{read_optional_name, BLUEZ_SERVICE, DEVICE_INTERFACE, PROPERTY_TIMEOUT};
use super::{BackendEvent, BackendEvents, DeviceHandle, IncomingConnection};
use crate::error::Result;

pub const PROFILE_PATH: &str = "/serialink/profile";
const PROFILE_INTERFACE: &str = "org.bluez.Profile1";
const INVALID_ARGUMENTS: &str = "org.bluez.Error.InvalidArguments";
const REJECTED: &str = "org.bluez.Error.Rejected";

/// Serve the profile object on `conn`.
pub fn export(conn: &Arc<SyncConnection>, events: BackendEvents<UnixStream>) -> Token {
    let rule = MatchRule::new_method_call()
        .with_path(PROFILE_PATH)
        .with_interface(PROFILE_INTERFACE);
    let bus = Arc::downgrade(conn);

    conn.start_receive(
        rule,
        Box::new(move |msg: Message, conn: &SyncConnection| {
            let reply = handle(&msg, &bus, &events);
            if conn.send(reply).is_err() {
                warn!("Failed to answer serial profile request");
            }
            true
        }),
    )
}

fn handle(msg: &Message, bus: &Weak<SyncConnection>, events: &BackendEvents<UnixStream>) -> Message {
    let member = msg.member();
    match member.as_deref() {
        Some("NewConnection") => {
            let (device, fd) = match msg.read2::<Path, OwnedFd>() {
                Ok((device, fd)) => (device.into_static(), fd),
                Err(e) => {
                    warn!("Malformed NewConnection call: {}", e);
                    return msg.error(&INVALID_ARGUMENTS.into(), c"Expected device path and socket");
                }
            };

            let raw = fd.into_raw_fd();
            // SAFETY: BlueZ transferred ownership of this RFCOMM socket to us and
            // nothing else holds the descriptor.
            let socket = unsafe { std::os::unix::net::UnixStream::from_raw_fd(raw) };

            let Some(bus) = bus.upgrade() else {
                return msg.error(&REJECTED.into(), c"Bus connection is gone");
            };

            info!("Serial connection from {}", device);
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = deliver(bus, device, socket, events).await {
                    warn!("Could not hand over serial socket: {}", e);
                }
            });
            msg.method_return()
        }
        Some("RequestDisconnection") => {
            if let Ok(device) = msg.read1::<Path>() {
                debug!("BlueZ requested disconnection of {}", device);
                let handle = DeviceHandle {
                    address: address_from_path(&device).unwrap_or_default(),
                    id: device.to_string(),
                };
                let _ = events.send(BackendEvent::ProfileDisconnectRequested(handle));
            }
            msg.method_return()
        }
        Some("Release") => {
            info!("Serial profile released by BlueZ");
            msg.method_return()
        }
        Some("Cancel") => {
            debug!("Serial profile request cancelled");
            msg.method_return()
        }
        _ => msg.error(&REJECTED.into(), c"Unsupported profile request"),
    }
}

async fn deliver(
    bus: Arc<SyncConnection>,
    device: Path<'static>,
    socket: std::os::unix::net::UnixStream,
    events: BackendEvents<UnixStream>,
) -> Result<()> {
    // RFCOMM is a stream socket; plain read/write on the descriptor is all the bridge uses.
    socket.set_nonblocking(true)?;
    let stream = UnixStream::from_std(socket)?;

    let proxy = Proxy::new(BLUEZ_SERVICE, device.clone(), PROPERTY_TIMEOUT, bus);
    let name = match read_optional_name(&proxy).await {
        Ok(name) => name,
        Err(e) => {
            debug!("Could not read name of {}: {}", device, e);
            None
        }
    };
    let address = match proxy.get::<String>(DEVICE_INTERFACE, "Address").await {
        Ok(address) => address,
        Err(_) => address_from_path(&device).unwrap_or_default(),
    };

    let connection = IncomingConnection {
        device: DeviceHandle {
            address,
            id: device.to_string(),
        },
        name,
        stream,
    };
    let _ = events.send(BackendEvent::ProfileConnected(connection));
    Ok(())
}

/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF` -> `AA:BB:CC:DD:EE:FF`
fn address_from_path(path: &str) -> Option<String> {
    let leaf = path.rsplit('/').next()?;
    let encoded = leaf.strip_prefix("dev_")?;
    let address = encoded.replace('_', ":");
    (address.len() == 17).then_some(address)
}
