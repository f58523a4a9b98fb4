/*!
 * Host-facing messages
 * What the bridge receives from, and emits to, the message-routing host
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

const OUTPUT_BUFFER: usize = 256;

/// A message arriving on the command input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    #[serde(alias = "tag")]
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    /// Optional adapter override for `scan`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl HostMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            adapter: None,
        }
    }
}

/// Output channels. A third channel (2) is reserved and never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Port {
    Control = 0,
    Data = 1,
}

impl Port {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Messages on the control/status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "lowercase")]
pub enum ControlMessage {
    /// A candidate device seen during discovery
    Address {
        payload: String,
        address: String,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    Connexion {
        connected: bool,
        device: Option<String>,
        socket: Option<Uuid>,
    },
}

impl ControlMessage {
    pub fn candidate(address: &str, display_name: &str) -> Self {
        ControlMessage::Address {
            payload: format!("{} {}", address, display_name),
            address: address.to_string(),
            display_name: display_name.to_string(),
        }
    }

    pub fn connected(device: &str, socket: Uuid) -> Self {
        ControlMessage::Connexion {
            connected: true,
            device: Some(device.to_string()),
            socket: Some(socket),
        }
    }

    pub fn disconnected() -> Self {
        ControlMessage::Connexion {
            connected: false,
            device: None,
            socket: None,
        }
    }
}

/// Inbound serial bytes, forwarded on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorFill {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorShape {
    Dot,
    Ring,
}

/// Externally visible connection indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub fill: IndicatorFill,
    pub shape: IndicatorShape,
    pub text: String,
}

impl Indicator {
    pub fn connected() -> Self {
        Self {
            fill: IndicatorFill::Green,
            shape: IndicatorShape::Dot,
            text: "connected".to_string(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            fill: IndicatorFill::Red,
            shape: IndicatorShape::Ring,
            text: "disconnected".to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.fill == IndicatorFill::Green
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostOutput {
    Control(ControlMessage),
    Data(DataMessage),
    Indicator(Indicator),
}

/// Fan-out of host outputs to every attached host client.
#[derive(Debug, Clone)]
pub struct OutputBus {
    tx: broadcast::Sender<HostOutput>,
}

impl OutputBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(OUTPUT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostOutput> {
        self.tx.subscribe()
    }

    pub fn send_control(&self, message: ControlMessage) {
        self.publish(HostOutput::Control(message));
    }

    pub fn send_data(&self, payload: Vec<u8>) {
        self.publish(HostOutput::Data(DataMessage { payload }));
    }

    pub fn send_indicator(&self, indicator: Indicator) {
        self.publish(HostOutput::Indicator(indicator));
    }

    fn publish(&self, output: HostOutput) {
        // No attached host is not an error
        let _ = self.tx.send(output);
    }
}

impl Default for OutputBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_message_wire_format() {
        let msg = ControlMessage::candidate("AA:BB:CC:DD:EE:FF", "Widget");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "topic": "address",
                "payload": "AA:BB:CC:DD:EE:FF Widget",
                "address": "AA:BB:CC:DD:EE:FF",
                "displayName": "Widget",
            })
        );
    }

    #[test]
    fn disconnected_status_has_null_fields() {
        let value = serde_json::to_value(ControlMessage::disconnected()).unwrap();
        assert_eq!(
            value,
            json!({"topic": "connexion", "connected": false, "device": null, "socket": null})
        );
    }

    #[test]
    fn host_message_accepts_tag_alias() {
        let msg: HostMessage = serde_json::from_value(json!({"tag": "scan", "payload": true})).unwrap();
        assert_eq!(msg.topic, "scan");
        assert_eq!(msg.payload, json!(true));
        assert_eq!(msg.adapter, None);
    }

    #[test]
    fn port_indices_match_output_channels() {
        assert_eq!(Port::Control.index(), 0);
        assert_eq!(Port::Data.index(), 1);
        assert!(Indicator::connected().is_connected());
        assert!(!Indicator::disconnected().is_connected());
    }

    #[test]
    fn bus_without_subscribers_does_not_fail() {
        let bus = OutputBus::new();
        bus.send_data(b"ignored".to_vec());

        let mut rx = bus.subscribe();
        bus.send_indicator(Indicator::disconnected());
        assert_eq!(
            rx.try_recv().unwrap(),
            HostOutput::Indicator(Indicator::disconnected())
        );
    }
}
