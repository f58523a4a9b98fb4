/*!
 * BlueZ D-Bus Binding
 * org.bluez over the system bus via dbus + dbus-tokio
 */

use dbus::arg::{prop_cast, PropMap, RefArg, Variant};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Path;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    agent, profile, AdapterHandle, BackendEvent, BackendEvents, BluetoothBackend, DeviceFound,
    DeviceHandle, DeviceProperties,
};
use crate::config::BluetoothConfig;
use crate::error::{BridgeError, Result};

pub(crate) const BLUEZ_SERVICE: &str = "org.bluez";
const BLUEZ_ROOT: &str = "/org/bluez";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
const PROFILE_MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Property reads and quick adapter calls
pub(crate) const PROPERTY_TIMEOUT: Duration = Duration::from_secs(5);
/// Pair/ConnectProfile/Disconnect; the bridge applies its own, shorter deadlines
const METHOD_TIMEOUT: Duration = Duration::from_secs(120);

type ManagedObjects = HashMap<Path<'static>, HashMap<String, PropMap>>;

pub struct BluezBackend {
    conn: Arc<SyncConnection>,
    config: BluetoothConfig,
    device_watch: Mutex<Option<MsgMatch>>,
}

impl BluezBackend {
    /// Connect to the system bus.
    pub async fn connect(config: &BluetoothConfig) -> Result<Self> {
        let (resource, conn) = dbus_tokio::connection::new_system_sync()?;

        tokio::spawn(async move {
            let err = resource.await;
            error!("Lost connection to the system D-Bus: {}", err);
        });

        info!("Connected to BlueZ on the system bus");

        Ok(Self {
            conn,
            config: config.clone(),
            device_watch: Mutex::new(None),
        })
    }

    fn proxy<'a>(&self, path: &'a str, timeout: Duration) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_SERVICE, path, timeout, self.conn.clone())
    }

    async fn managed_objects(&self) -> Result<ManagedObjects> {
        let proxy = self.proxy("/", PROPERTY_TIMEOUT);
        Ok(proxy.get_managed_objects().await?)
    }
}

impl BluetoothBackend for BluezBackend {
    type Stream = UnixStream;

    async fn adapter(&self, name: &str) -> Result<AdapterHandle> {
        let path = format!("{}/{}", BLUEZ_ROOT, name);
        let objects = self.managed_objects().await?;

        let exists = objects
            .iter()
            .any(|(object, interfaces)| &**object == path && interfaces.contains_key(ADAPTER_INTERFACE));
        if !exists {
            return Err(BridgeError::AdapterNotFound(name.to_string()));
        }

        debug!("Using adapter {} at {}", name, path);
        Ok(AdapterHandle {
            name: name.to_string(),
            id: path,
        })
    }

    async fn is_discovering(&self, adapter: &AdapterHandle) -> Result<bool> {
        let proxy = self.proxy(&adapter.id, PROPERTY_TIMEOUT);
        Ok(proxy.get::<bool>(ADAPTER_INTERFACE, "Discovering").await?)
    }

    async fn start_discovery(&self, adapter: &AdapterHandle) -> Result<()> {
        let proxy = self.proxy(&adapter.id, PROPERTY_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(ADAPTER_INTERFACE, "StartDiscovery", ())
            .await
            .map_err(|e| BridgeError::Discovery(describe(&e)))
    }

    async fn stop_discovery(&self, adapter: &AdapterHandle) -> Result<()> {
        let proxy = self.proxy(&adapter.id, PROPERTY_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(ADAPTER_INTERFACE, "StopDiscovery", ())
            .await
            .map_err(|e| BridgeError::Discovery(describe(&e)))
    }

    async fn watch_devices(&self, events: BackendEvents<UnixStream>) -> Result<()> {
        let mut watch = self.device_watch.lock().await;
        if watch.is_some() {
            return Ok(());
        }

        let rule = MatchRule::new_signal(OBJECT_MANAGER_INTERFACE, "InterfacesAdded");
        let incoming = self.conn.add_match(rule).await?.cb(
            move |_, (path, interfaces): (Path<'static>, HashMap<String, PropMap>)| {
                if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                    let found = DeviceFound {
                        id: path.to_string(),
                        properties: device_properties(props),
                    };
                    let _ = events.send(BackendEvent::DeviceFound(found));
                }
                true
            },
        );

        debug!("Watching for new BlueZ devices");
        *watch = Some(incoming);
        Ok(())
    }

    async fn device(&self, address: &str) -> Result<DeviceHandle> {
        let objects = self.managed_objects().await?;

        objects
            .iter()
            .find_map(|(path, interfaces)| {
                let props = interfaces.get(DEVICE_INTERFACE)?;
                let known = prop_cast::<String>(props, "Address")?;
                known.eq_ignore_ascii_case(address).then(|| DeviceHandle {
                    address: known.clone(),
                    id: path.to_string(),
                })
            })
            .ok_or_else(|| BridgeError::DeviceNotFound(address.to_string()))
    }

    async fn device_name(&self, device: &DeviceHandle) -> Result<Option<String>> {
        let proxy = self.proxy(&device.id, PROPERTY_TIMEOUT);
        read_optional_name(&proxy).await
    }

    async fn is_paired(&self, device: &DeviceHandle) -> Result<bool> {
        let proxy = self.proxy(&device.id, PROPERTY_TIMEOUT);
        Ok(proxy.get::<bool>(DEVICE_INTERFACE, "Paired").await?)
    }

    async fn pair(&self, device: &DeviceHandle) -> Result<()> {
        let proxy = self.proxy(&device.id, METHOD_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Pair", ())
            .await
            .map_err(|e| BridgeError::PairingFailed(describe(&e)))
    }

    async fn connect_profile(&self, device: &DeviceHandle, uuid: &str) -> Result<()> {
        let proxy = self.proxy(&device.id, METHOD_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "ConnectProfile", (uuid,))
            .await
            .map_err(|e| BridgeError::ProfileFailed(describe(&e)))
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        let proxy = self.proxy(&device.id, METHOD_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Disconnect", ())
            .await
            .map_err(|e| BridgeError::DisconnectFailed(describe(&e)))
    }

    async fn register_pairing_agent(&self) -> Result<()> {
        agent::export(&self.conn, self.config.pin_code.clone());

        let agent_path = Path::new(agent::AGENT_PATH).map_err(BridgeError::BlueZ)?;
        let proxy = self.proxy(BLUEZ_ROOT, PROPERTY_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(
                AGENT_MANAGER_INTERFACE,
                "RegisterAgent",
                (agent_path.clone(), self.config.agent_capability.as_str()),
            )
            .await?;
        proxy
            .method_call::<(), _, _, _>(AGENT_MANAGER_INTERFACE, "RequestDefaultAgent", (agent_path,))
            .await?;

        info!(
            "Pairing agent registered ({})",
            self.config.agent_capability
        );
        Ok(())
    }

    async fn register_serial_profile(
        &self,
        uuid: &str,
        events: BackendEvents<UnixStream>,
    ) -> Result<()> {
        profile::export(&self.conn, events);

        let profile_path = Path::new(profile::PROFILE_PATH).map_err(BridgeError::BlueZ)?;
        let options = profile_options(&self.config.profile_role);
        let proxy = self.proxy(BLUEZ_ROOT, PROPERTY_TIMEOUT);
        proxy
            .method_call::<(), _, _, _>(
                PROFILE_MANAGER_INTERFACE,
                "RegisterProfile",
                (profile_path, uuid, options),
            )
            .await?;

        info!("Serial profile {} registered as {}", uuid, self.config.profile_role);
        Ok(())
    }
}

/// Read `Name`, treating an absent property as no name.
pub(crate) async fn read_optional_name(
    proxy: &Proxy<'_, Arc<SyncConnection>>,
) -> Result<Option<String>> {
    match proxy.get::<String>(DEVICE_INTERFACE, "Name").await {
        Ok(name) => Ok(Some(name)),
        Err(e) if e.name() == Some("org.freedesktop.DBus.Error.InvalidArgs") => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn device_properties(props: &PropMap) -> DeviceProperties {
    DeviceProperties {
        address: prop_cast::<String>(props, "Address").cloned(),
        name: prop_cast::<String>(props, "Name").cloned(),
    }
}

fn profile_options(role: &str) -> PropMap {
    let mut options: PropMap = HashMap::new();
    options.insert("Name".to_string(), Variant(Box::new("Serial Port".to_string()) as Box<dyn RefArg>));
    options.insert("Role".to_string(), Variant(Box::new(role.to_string()) as Box<dyn RefArg>));
    options
}

fn describe(err: &dbus::Error) -> String {
    match (err.name(), err.message()) {
        (Some(name), Some(message)) => format!("{} ({})", message, name),
        (Some(name), None) => name.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => "unknown D-Bus error".to_string(),
    }
}
