/*!
 * Host command parsing
 * Topic dispatch from raw host messages to typed commands
 */

use serde_json::Value;

use super::serial::encode_payload;
use crate::config::WriteEncoding;
use crate::error::{BridgeError, Result};
use crate::host::HostMessage;

pub const TOPIC_SCAN: &str = "scan";
pub const TOPIC_ADDRESS: &str = "address";
pub const TOPIC_WRITE: &str = "write";
pub const TOPIC_DISCONNECT: &str = "disconnect";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan { enable: bool, adapter: Option<String> },
    Connect(String),
    Disconnect,
    Write(Vec<u8>),
    /// Nothing to do; carries the reason for the log line
    Ignored(String),
}

impl Command {
    pub fn parse(msg: &HostMessage, encoding: WriteEncoding) -> Result<Self> {
        match msg.topic.as_str() {
            TOPIC_SCAN => Ok(Command::Scan {
                enable: scan_flag(&msg.payload)?,
                adapter: msg.adapter.clone(),
            }),
            TOPIC_ADDRESS => {
                let Value::String(text) = &msg.payload else {
                    return Err(malformed(TOPIC_ADDRESS, "expected a string"));
                };
                // The address is everything before the first space, so a leading space means none
                match text.split(' ').next() {
                    Some(address) if !address.is_empty() => Ok(Command::Connect(address.to_string())),
                    _ => Ok(Command::Ignored("empty address".to_string())),
                }
            }
            TOPIC_WRITE => Ok(Command::Write(encode_payload(&msg.payload, encoding)?)),
            TOPIC_DISCONNECT => Ok(Command::Disconnect),
            other => Ok(Command::Ignored(format!("unknown topic '{}'", other))),
        }
    }
}

/// Loose truthiness: booleans, 1/0 and their string forms.
fn scan_flag(payload: &Value) -> Result<bool> {
    match payload {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::String(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            _ => Err(malformed(TOPIC_SCAN, "expected a boolean")),
        },
        _ => Err(malformed(TOPIC_SCAN, "expected a boolean")),
    }
}

fn malformed(topic: &str, reason: &str) -> BridgeError {
    BridgeError::MalformedPayload {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}
