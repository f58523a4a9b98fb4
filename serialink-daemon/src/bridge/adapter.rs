/*!
 * Adapter Session
 * Holds the one adapter handle and starts/stops discovery on it
 */

use std::sync::Arc;
use tracing::{debug, info};

use crate::bluetooth::{AdapterHandle, BluetoothBackend};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Started,
    AlreadyDiscovering,
}

pub struct AdapterSession<B: BluetoothBackend> {
    backend: Arc<B>,
    adapter: Option<AdapterHandle>,
    scanning: bool,
}

impl<B: BluetoothBackend> AdapterSession<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            adapter: None,
            scanning: false,
        }
    }

    /// Acquire the adapter on first use, then start discovery unless it is already running.
    pub async fn start_scan(&mut self, name: &str) -> Result<ScanOutcome> {
        let adapter = match &self.adapter {
            Some(held) => {
                if held.name != name {
                    debug!("Keeping adapter {}; ignoring request for {}", held.name, name);
                }
                held.clone()
            }
            None => {
                let acquired = self.backend.adapter(name).await?;
                self.adapter = Some(acquired.clone());
                acquired
            }
        };

        if self.backend.is_discovering(&adapter).await? {
            self.scanning = true;
            return Ok(ScanOutcome::AlreadyDiscovering);
        }

        self.backend.start_discovery(&adapter).await?;
        self.scanning = true;
        info!("Discovery started on {}", adapter.name);
        Ok(ScanOutcome::Started)
    }

    /// Stop discovery if an adapter is held. Returns whether a stop was issued.
    pub async fn stop_scan(&mut self) -> Result<bool> {
        let Some(adapter) = &self.adapter else {
            return Ok(false);
        };

        // Considered stopped even when the call fails
        self.scanning = false;
        self.backend.stop_discovery(adapter).await?;
        info!("Discovery stopped on {}", adapter.name);
        Ok(true)
    }

    pub fn adapter(&self) -> Option<&AdapterHandle> {
        self.adapter.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}
