//! Autodarts subscription protocol.
//!
//! The vendor speaks JSON text frames over a single WebSocket. Clients send
//! commands addressing a `(channel, topic)` pair:
//!
//! ```json
//! {"channel": "autodarts.boards", "type": "subscribe", "topic": "<board_id>.matches"}
//! ```
//!
//! and receive event frames carrying a channel and an opaque `data` object:
//!
//! ```json
//! {"channel": "autodarts.boards", "topic": "<board_id>.matches", "data": {"event": "start", "id": "<match_id>"}}
//! {"channel": "autodarts.matches", "topic": "<match_id>.state", "data": {"id": "<match_id>", "turns": [ ... ]}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Channel carrying board-level match lifecycle events.
pub const BOARDS_CHANNEL: &str = "autodarts.boards";

/// Channel carrying per-match state updates.
pub const MATCHES_CHANNEL: &str = "autodarts.matches";

/// Largest inbound text frame we are willing to parse (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A pub/sub address. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub channel: String,
    pub topic: String,
}

impl Subscription {
    /// The board's match lifecycle topic.
    #[must_use]
    pub fn board(board_id: &str) -> Self {
        Self {
            channel: BOARDS_CHANNEL.to_string(),
            topic: format!("{board_id}.matches"),
        }
    }

    /// A match's state topic.
    #[must_use]
    pub fn match_state(match_id: &str) -> Self {
        Self {
            channel: MATCHES_CHANNEL.to_string(),
            topic: format!("{match_id}.state"),
        }
    }

    /// Builds the command subscribing to this address.
    #[must_use]
    pub fn subscribe(&self) -> Command {
        Command::new(CommandType::Subscribe, self)
    }

    /// Builds the command unsubscribing from this address.
    #[must_use]
    pub fn unsubscribe(&self) -> Command {
        Command::new(CommandType::Unsubscribe, self)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.topic)
    }
}

/// Kind of outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Subscribe,
    Unsubscribe,
}

/// An outbound command frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub topic: String,
}

impl Command {
    fn new(kind: CommandType, subscription: &Subscription) -> Self {
        Self {
            channel: subscription.channel.clone(),
            kind,
            topic: subscription.topic.clone(),
        }
    }

    /// The address this command targets.
    #[must_use]
    pub fn subscription(&self) -> Subscription {
        Subscription {
            channel: self.channel.clone(),
            topic: self.topic.clone(),
        }
    }
}

/// An inbound event frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    pub channel: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Oversized`] if the frame exceeds [`MAX_FRAME_BYTES`]
    /// - [`ProtocolError::InvalidJson`] if the frame is not a JSON object
    /// - [`ProtocolError::MissingField`] if `channel` is absent or not a string
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Oversized {
                size: text.len(),
                limit: MAX_FRAME_BYTES,
            });
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidJson("frame is not a JSON object".to_string()))?;

        if !object.get("channel").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingField("channel"));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// Interprets a board channel frame.
    ///
    /// Returns `None` for frames on other channels or without an `event` name.
    #[must_use]
    pub fn board_event(&self) -> Option<BoardEvent> {
        if self.channel != BOARDS_CHANNEL {
            return None;
        }

        let event = self.data.get("event")?.as_str()?;
        let match_id = self.data.get("id").and_then(Value::as_str).map(str::to_string);

        Some(match event {
            "start" => match match_id {
                Some(id) => BoardEvent::Start { match_id: id },
                None => BoardEvent::Other(event.to_string()),
            },
            "finish" | "stop" | "delete" => BoardEvent::End { match_id },
            other => BoardEvent::Other(other.to_string()),
        })
    }

    /// The id embedded in a match frame, from `data.id` or the topic prefix.
    #[must_use]
    pub fn match_id(&self) -> Option<&str> {
        self.data
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| self.topic.as_deref()?.strip_suffix(".state"))
    }

    /// The newest turn of a match frame.
    ///
    /// The vendor orders `turns` most-recent-first, so only index 0 counts.
    #[must_use]
    pub fn latest_turn(&self) -> Option<Round> {
        if self.channel != MATCHES_CHANNEL {
            return None;
        }

        self.data
            .get("turns")?
            .as_array()?
            .first()
            .cloned()
            .map(Round)
    }
}

/// Board lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    /// A match started on the board.
    Start { match_id: String },
    /// A match finished, stopped or was deleted.
    End { match_id: Option<String> },
    /// Any other board event.
    Other(String),
}

/// One player's turn. The payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Round(pub Value);

impl Round {
    /// Borrows the vendor payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn board_subscription_uses_matches_topic() {
        let sub = Subscription::board("board-1");
        assert_eq!(sub.channel, "autodarts.boards");
        assert_eq!(sub.topic, "board-1.matches");
        assert_eq!(sub.to_string(), "autodarts.boards/board-1.matches");
    }

    #[test]
    fn subscribe_command_serializes_to_wire_shape() {
        let cmd = Subscription::match_state("m-42").subscribe();
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            json,
            json!({"channel": "autodarts.matches", "type": "subscribe", "topic": "m-42.state"})
        );
    }

    #[test]
    fn unsubscribe_command_serializes_type() {
        let cmd = Subscription::match_state("m-42").unsubscribe();
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "unsubscribe");
        assert_eq!(cmd.subscription(), Subscription::match_state("m-42"));
    }

    #[test]
    fn parse_accepts_frame_without_data() {
        let frame = InboundFrame::parse(r#"{"channel": "autodarts.boards"}"#).unwrap();
        assert_eq!(frame.channel, "autodarts.boards");
        assert!(frame.topic.is_none());
        assert!(frame.data.is_null());
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn parse_rejects_non_object() {
        let err = InboundFrame::parse("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn parse_rejects_missing_channel() {
        let err = InboundFrame::parse(r#"{"data": {"event": "start"}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("channel"));

        let err = InboundFrame::parse(r#"{"channel": 7, "data": {}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("channel"));
    }

    #[test]
    fn parse_rejects_oversized_frame() {
        let text = format!(
            r#"{{"channel": "autodarts.matches", "data": "{}"}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        let err = InboundFrame::parse(&text).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn board_start_requires_id() {
        let frame = InboundFrame::parse(
            r#"{"channel": "autodarts.boards", "data": {"event": "start", "id": "m1"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame.board_event(),
            Some(BoardEvent::Start {
                match_id: "m1".to_string()
            })
        );

        let frame =
            InboundFrame::parse(r#"{"channel": "autodarts.boards", "data": {"event": "start"}}"#)
                .unwrap();
        assert_eq!(frame.board_event(), Some(BoardEvent::Other("start".into())));
    }

    #[test]
    fn board_end_events_are_recognised() {
        for name in ["finish", "stop", "delete"] {
            let text = format!(
                r#"{{"channel": "autodarts.boards", "data": {{"event": "{name}", "id": "m1"}}}}"#
            );
            let frame = InboundFrame::parse(&text).unwrap();
            assert_eq!(
                frame.board_event(),
                Some(BoardEvent::End {
                    match_id: Some("m1".to_string())
                })
            );
        }
    }

    #[test]
    fn board_event_ignores_other_channels() {
        let frame = InboundFrame::parse(
            r#"{"channel": "autodarts.matches", "data": {"event": "start", "id": "m1"}}"#,
        )
        .unwrap();
        assert!(frame.board_event().is_none());
    }

    #[test]
    fn latest_turn_takes_first_entry() {
        let frame = InboundFrame::parse(
            r#"{"channel": "autodarts.matches", "data": {"turns": [{"n": 2}, {"n": 1}]}}"#,
        )
        .unwrap();
        assert_eq!(frame.latest_turn(), Some(Round(json!({"n": 2}))));
    }

    #[test]
    fn latest_turn_absent_for_empty_or_missing_turns() {
        for text in [
            r#"{"channel": "autodarts.matches", "data": {"turns": []}}"#,
            r#"{"channel": "autodarts.matches", "data": {"turns": null}}"#,
            r#"{"channel": "autodarts.matches", "data": {"players": []}}"#,
            r#"{"channel": "autodarts.boards", "data": {"turns": [{"n": 1}]}}"#,
        ] {
            let frame = InboundFrame::parse(text).unwrap();
            assert!(frame.latest_turn().is_none(), "unexpected turn for {text}");
        }
    }

    #[test]
    fn match_id_prefers_data_then_topic() {
        let frame = InboundFrame::parse(
            r#"{"channel": "autodarts.matches", "topic": "t1.state", "data": {"id": "d1"}}"#,
        )
        .unwrap();
        assert_eq!(frame.match_id(), Some("d1"));

        let frame =
            InboundFrame::parse(r#"{"channel": "autodarts.matches", "topic": "t1.state"}"#)
                .unwrap();
        assert_eq!(frame.match_id(), Some("t1"));

        let frame = InboundFrame::parse(r#"{"channel": "autodarts.matches"}"#).unwrap();
        assert_eq!(frame.match_id(), None);
    }
}
