/*!
 * Default Pairing Agent
 * org.bluez.Agent1 object that accepts every request and answers with a fixed PIN
 */

use dbus::channel::{MatchingReceiver, Sender, Token};
use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use dbus::Message;
use tracing::{debug, info, warn};

pub const AGENT_PATH: &str = "/serialink/agent";
const AGENT_INTERFACE: &str = "org.bluez.Agent1";
const REJECTED: &str = "org.bluez.Error.Rejected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentRequest {
    Release,
    RequestPinCode,
    DisplayPinCode,
    RequestPasskey,
    DisplayPasskey,
    RequestConfirmation,
    RequestAuthorization,
    AuthorizeService,
    Cancel,
}

impl AgentRequest {
    fn from_member(member: &str) -> Option<Self> {
        Some(match member {
            "Release" => Self::Release,
            "RequestPinCode" => Self::RequestPinCode,
            "DisplayPinCode" => Self::DisplayPinCode,
            "RequestPasskey" => Self::RequestPasskey,
            "DisplayPasskey" => Self::DisplayPasskey,
            "RequestConfirmation" => Self::RequestConfirmation,
            "RequestAuthorization" => Self::RequestAuthorization,
            "AuthorizeService" => Self::AuthorizeService,
            "Cancel" => Self::Cancel,
            _ => return None,
        })
    }
}

/// What the agent answers to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentReply {
    Empty,
    PinCode(String),
    Passkey(u32),
    Reject,
}

fn decide(request: AgentRequest, pin_code: &str) -> AgentReply {
    match request {
        AgentRequest::RequestPinCode => AgentReply::PinCode(pin_code.to_string()),
        AgentRequest::RequestPasskey => match pin_code.parse::<u32>() {
            Ok(passkey) if passkey <= 999_999 => AgentReply::Passkey(passkey),
            _ => AgentReply::Reject,
        },
        _ => AgentReply::Empty,
    }
}

/// Serve the agent object on `conn`.
pub fn export(conn: &SyncConnection, pin_code: String) -> Token {
    let rule = MatchRule::new_method_call()
        .with_path(AGENT_PATH)
        .with_interface(AGENT_INTERFACE);

    conn.start_receive(
        rule,
        Box::new(move |msg: Message, conn: &SyncConnection| {
            let reply = answer(&msg, &pin_code);
            if conn.send(reply).is_err() {
                warn!("Failed to answer pairing agent request");
            }
            true
        }),
    )
}

fn answer(msg: &Message, pin_code: &str) -> Message {
    let member = msg.member();
    let Some(request) = member.as_deref().and_then(AgentRequest::from_member) else {
        return msg.error(&REJECTED.into(), c"Unsupported agent request");
    };

    match request {
        AgentRequest::Release => info!("Pairing agent released by BlueZ"),
        AgentRequest::Cancel => debug!("Pairing request cancelled"),
        other => debug!("Pairing agent: {:?}", other),
    }

    match decide(request, pin_code) {
        AgentReply::Empty => msg.method_return(),
        AgentReply::PinCode(pin) => msg.method_return().append1(pin),
        AgentReply::Passkey(passkey) => msg.method_return().append1(passkey),
        AgentReply::Reject => {
            warn!("Configured PIN '{}' is not a valid passkey", pin_code);
            msg.error(&REJECTED.into(), c"No passkey available")
        }
    }
}
