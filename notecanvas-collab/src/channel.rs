//! Typed messages for the per-document broadcast channel.
//!
//! Presence, node locks and canvas node updates share one best-effort
//! channel, separate from the operation log. Payloads are JSON so web
//! clients can speak them directly:
//!
//! ```text
//! {"event":"node_update","userId":"…","nodeId":"n1","action":"update","data":{…}}
//! {"event":"node_lock","userId":"…","nodeId":"n1","locked":true}
//! {"event":"presence_sync","user_id":"…","status":"editing",…,"online_at":…}   (userId also accepted)
//! {"event":"presence_leave","userId":"…"}
//! ```
//!
//! Every message is validated when decoded; nothing reaches a room or an
//! observer as untrusted JSON.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::UserId;
use crate::presence::PresencePayload;
use crate::protocol::ProtocolError;

/// Addressable canvas element.
pub type NodeId = String;

/// Longest node id accepted on the channel, in chars.
pub const MAX_NODE_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub user_id: UserId,
    pub node_id: NodeId,
    pub action: NodeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLock {
    pub user_id: UserId,
    pub node_id: NodeId,
    pub locked: bool,
}

/// Closed set of channel messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelMessage {
    NodeUpdate(NodeUpdate),
    NodeLock(NodeLock),
    PresenceSync(PresencePayload),
    PresenceLeave {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
}

impl ChannelMessage {
    /// The user the message speaks for.
    pub fn user_id(&self) -> UserId {
        match self {
            ChannelMessage::NodeUpdate(u) => u.user_id,
            ChannelMessage::NodeLock(l) => l.user_id,
            ChannelMessage::PresenceSync(p) => p.user_id,
            ChannelMessage::PresenceLeave { user_id } => *user_id,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.user_id() == Uuid::nil() {
            return Err(invalid("missing user id"));
        }
        match self {
            ChannelMessage::NodeUpdate(NodeUpdate { node_id, .. })
            | ChannelMessage::NodeLock(NodeLock { node_id, .. }) => validate_node_id(node_id),
            ChannelMessage::PresenceSync(p) => {
                if let Some(sel) = &p.selection {
                    if sel.start > sel.end {
                        return Err(invalid(format!(
                            "selection start {} after end {}",
                            sel.start, sel.end
                        )));
                    }
                }
                if let Some(focused) = &p.focused_element {
                    validate_node_id(focused)?;
                }
                Ok(())
            }
            ChannelMessage::PresenceLeave { .. } => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let msg: ChannelMessage = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

fn validate_node_id(node_id: &str) -> Result<(), ProtocolError> {
    if node_id.is_empty() {
        return Err(invalid("empty node id"));
    }
    if node_id.chars().count() > MAX_NODE_ID_LEN {
        return Err(invalid("node id too long"));
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceStatus, SelectionRange};

    fn user() -> Uuid {
        Uuid::from_u128(0xABCD)
    }

    #[test]
    fn test_node_update_wire_shape() {
        let msg = ChannelMessage::NodeUpdate(NodeUpdate {
            user_id: user(),
            node_id: "node-1".into(),
            action: NodeAction::Update,
            data: Some(serde_json::json!({"x": 10})),
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "node_update");
        assert_eq!(value["nodeId"], "node-1");
        assert_eq!(value["action"], "update");
        assert_eq!(value["data"]["x"], 10);
        assert_eq!(value["userId"], user().to_string());
    }

    #[test]
    fn test_decode_node_lock_from_json() {
        let json = format!(
            r#"{{"event":"node_lock","userId":"{}","nodeId":"card-7","locked":true}}"#,
            user()
        );
        let msg = ChannelMessage::decode(json.as_bytes()).unwrap();
        assert_eq!(
            msg,
            ChannelMessage::NodeLock(NodeLock {
                user_id: user(),
                node_id: "card-7".into(),
                locked: true
            })
        );
    }

    #[test]
    fn test_decode_node_update_without_data() {
        let json = format!(
            r#"{{"event":"node_update","userId":"{}","nodeId":"n","action":"delete"}}"#,
            user()
        );
        match ChannelMessage::decode(json.as_bytes()).unwrap() {
            ChannelMessage::NodeUpdate(u) => {
                assert_eq!(u.action, NodeAction::Delete);
                assert!(u.data.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let json = format!(r#"{{"event":"teleport","userId":"{}"}}"#, user());
        assert!(matches!(
            ChannelMessage::decode(json.as_bytes()),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let json = format!(
            r#"{{"event":"node_lock","userId":"{}","nodeId":"","locked":true}}"#,
            user()
        );
        assert!(matches!(
            ChannelMessage::decode(json.as_bytes()),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_nil_user_rejected() {
        let msg = ChannelMessage::PresenceLeave {
            user_id: Uuid::nil(),
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_inverted_selection_rejected() {
        let mut payload = PresencePayload::new(user(), PresenceStatus::Editing);
        payload.selection = Some(SelectionRange { start: 9, end: 3 });
        assert!(ChannelMessage::PresenceSync(payload).validate().is_err());
    }

    #[test]
    fn test_presence_sync_accepts_either_user_key() {
        let snake = format!(
            r#"{{"event":"presence_sync","user_id":"{}","status":"editing","online_at":5}}"#,
            user()
        );
        let camel = format!(
            r#"{{"event":"presence_sync","userId":"{}","status":"editing","online_at":5}}"#,
            user()
        );
        let a = ChannelMessage::decode(snake.as_bytes()).unwrap();
        let b = ChannelMessage::decode(camel.as_bytes()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.user_id(), user());

        let value: serde_json::Value = serde_json::from_slice(&b.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "presence_sync");
        assert_eq!(value["user_id"], user().to_string());
    }

    #[test]
    fn test_presence_leave_wire_shape() {
        let msg = ChannelMessage::PresenceLeave { user_id: user() };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "presence_leave");
        assert_eq!(value["userId"], user().to_string());
    }
}
