/*!
 * Status Reporter
 * Sole source of connection status messages and the indicator
 */

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::host::{ControlMessage, Indicator, OutputBus};

pub struct StatusReporter {
    outputs: OutputBus,
    indicator: watch::Sender<Indicator>,
}

impl StatusReporter {
    /// Starts out disconnected without emitting anything.
    pub fn new(outputs: OutputBus) -> (Self, watch::Receiver<Indicator>) {
        let (indicator, rx) = watch::channel(Indicator::disconnected());
        (Self { outputs, indicator }, rx)
    }

    pub fn connected(&self, device: &str, socket: Uuid) {
        debug!("Status: connected to {} ({})", device, socket);
        self.outputs.send_control(ControlMessage::connected(device, socket));
        self.set_indicator(Indicator::connected());
    }

    pub fn disconnected(&self) {
        debug!("Status: disconnected");
        self.outputs.send_control(ControlMessage::disconnected());
        self.set_indicator(Indicator::disconnected());
    }

    pub fn indicator(&self) -> Indicator {
        self.indicator.borrow().clone()
    }

    fn set_indicator(&self, indicator: Indicator) {
        self.indicator.send_replace(indicator.clone());
        self.outputs.send_indicator(indicator);
    }
}
