use crate::api::models::{Message, Reaction, UserId};
use serde::{Deserialize, Serialize};

/// Raw push frame: `{"event": "...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(rename = "event")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Deltas the client subscribes to.
#[derive(Debug, Clone, PartialEq)]
pub enum PushDelta {
    NewMessage(Message),
    NewReaction(Reaction),
}

impl IncomingEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Typed view of the frame. `None` for events this client does not
    /// subscribe to or payloads that do not decode.
    pub fn into_delta(self) -> Option<PushDelta> {
        let decoded = match self.event_type.as_str() {
            "new_message" => serde_json::from_value(self.data).map(PushDelta::NewMessage),
            "new_reaction" => serde_json::from_value(self.data).map(PushDelta::NewReaction),
            other => {
                log::debug!("ignoring push event {other}");
                return None;
            }
        };
        match decoded {
            Ok(delta) => Some(delta),
            Err(e) => {
                log::debug!("undecodable {} payload: {e}", self.event_type);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutgoingEvent {
    Join(UserId),
    SendReaction(Reaction),
}

impl OutgoingEvent {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
