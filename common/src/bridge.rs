use thiserror::Error;

use crate::{
    inbox::{CommandSender, InboxError},
    store::StateStore,
    topics::Topics,
    types::LockCommand,
};

pub const MAX_CONTROL_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("oversized control payload ({0} bytes)")]
    Oversized(usize),
    #[error("control payload is not utf-8")]
    NotUtf8,
    #[error("control payload is not a boolean: `{0}`")]
    NotBoolean(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Inbox(#[from] InboxError),
}

/// Decodes a remote "requested lock state" value. Only JSON booleans are
/// accepted.
pub fn parse_lock_request(payload: &[u8]) -> Result<LockCommand, PayloadError> {
    if payload.len() > MAX_CONTROL_PAYLOAD_BYTES {
        return Err(PayloadError::Oversized(payload.len()));
    }

    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Bool(locked)) => Ok(LockCommand::new(locked)),
        _ => Err(PayloadError::NotBoolean(preview(text))),
    }
}

fn preview(text: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 32;
    let trimmed = text.trim();
    if trimmed.chars().count() > MAX_PREVIEW_CHARS {
        let head: String = trimmed.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// Serialized messages for one status publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: Vec<u8>,
    pub heartbeat: Vec<u8>,
}

/// Network-side half of the latch: turns remote values into inbox commands and
/// state snapshots into status messages. Never touches actuators.
#[derive(Debug, Clone)]
pub struct CloudBridge {
    topics: Topics,
    inbox: CommandSender,
}

impl CloudBridge {
    pub fn new(topics: Topics, inbox: CommandSender) -> Self {
        Self { topics, inbox }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_control_topic(&self, topic: &str) -> bool {
        topic == self.topics.control
    }

    /// Validates a control payload and queues it for the hardware loop.
    pub fn handle_control(&self, payload: &[u8]) -> Result<LockCommand, BridgeError> {
        let command = parse_lock_request(payload)?;
        self.inbox.push(command)?;
        Ok(command)
    }

    pub fn status_report(
        &self,
        store: &StateStore,
        now_epoch_ms: i64,
    ) -> Result<StatusReport, serde_json::Error> {
        let snapshot = store.read();
        Ok(StatusReport {
            status: serde_json::to_vec(&snapshot.status_payload())?,
            heartbeat: now_epoch_ms.to_string().into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{inbox::command_inbox, types::DeviceState};

    fn bridge() -> (CloudBridge, crate::inbox::CommandReceiver) {
        let (sender, receiver) = command_inbox(5);
        (CloudBridge::new(Topics::default(), sender), receiver)
    }

    #[test]
    fn parses_json_booleans() {
        assert_eq!(parse_lock_request(b"true"), Ok(LockCommand::new(true)));
        assert_eq!(parse_lock_request(b" false\n"), Ok(LockCommand::new(false)));
    }

    #[test]
    fn rejects_non_boolean_payloads() {
        let payloads: [&[u8]; 6] = [b"1", b"\"true\"", b"{\"set_lock\":true}", b"", b"null", b"yes"];
        for payload in payloads {
            assert!(
                matches!(parse_lock_request(payload), Err(PayloadError::NotBoolean(_))),
                "payload {payload:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_invalid_utf8_and_oversized_payloads() {
        assert_eq!(parse_lock_request(&[0xff, 0xfe]), Err(PayloadError::NotUtf8));

        let oversized = vec![b' '; MAX_CONTROL_PAYLOAD_BYTES + 1];
        assert_eq!(
            parse_lock_request(&oversized),
            Err(PayloadError::Oversized(MAX_CONTROL_PAYLOAD_BYTES + 1))
        );
    }

    #[test]
    fn rejection_preview_is_truncated() {
        let payload = "x".repeat(100);
        let Err(PayloadError::NotBoolean(preview)) = parse_lock_request(payload.as_bytes()) else {
            panic!("expected NotBoolean");
        };
        assert_eq!(preview.len(), 35);
    }

    #[test]
    fn control_values_are_queued_not_applied() {
        let (bridge, receiver) = bridge();

        assert_eq!(bridge.handle_control(b"false"), Ok(LockCommand::new(false)));
        assert_eq!(receiver.poll(), Some(LockCommand::new(false)));
    }

    #[test]
    fn malformed_control_value_queues_nothing() {
        let (bridge, receiver) = bridge();

        assert!(matches!(
            bridge.handle_control(b"\"open\""),
            Err(BridgeError::Payload(PayloadError::NotBoolean(_)))
        ));
        assert_eq!(receiver.poll(), None);
    }

    #[test]
    fn saturated_inbox_reports_dropped_command() {
        let (bridge, _receiver) = bridge();
        for _ in 0..5 {
            bridge.handle_control(b"true").unwrap();
        }

        assert_eq!(
            bridge.handle_control(b"false"),
            Err(BridgeError::Inbox(InboxError::Full(LockCommand::new(false))))
        );
    }

    #[test]
    fn status_report_reflects_store_snapshot() {
        let (bridge, _receiver) = bridge();
        let store = StateStore::new(DeviceState::new(true, false));

        let report = bridge.status_report(&store, 1_700_000_000_123).unwrap();
        let status: serde_json::Value = serde_json::from_slice(&report.status).unwrap();

        assert_eq!(
            status,
            serde_json::json!({
                "is_locked": true,
                "door_closed": false,
                "alarm_triggered": true,
            })
        );
        assert_eq!(report.heartbeat, b"1700000000123".to_vec());
    }

    #[test]
    fn recognises_only_its_control_topic() {
        let (bridge, _receiver) = bridge();
        assert!(bridge.is_control_topic("device_001/control/set_lock"));
        assert!(!bridge.is_control_topic("device_002/control/set_lock"));
        assert!(!bridge.is_control_topic("device_001/status"));
    }
}
