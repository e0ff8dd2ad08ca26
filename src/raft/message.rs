//! Wire format shared by every node on the topic.
//!
//! Each publication is a JSON envelope `{"type", "sentFrom", "data"}`. The
//! `type` string is the only extension point: values the election protocol
//! does not know decode as [`MessageType::Custom`] and are handed to the
//! application instead of being rejected.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RaftError;

const HEARTBEAT: &str = "heartbeat";
const REQUEST_VOTE: &str = "requestVote";
const REPLY_VOTE: &str = "replyVote";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Heartbeat,
    RequestVote,
    ReplyVote,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Heartbeat => HEARTBEAT,
            MessageType::RequestVote => REQUEST_VOTE,
            MessageType::ReplyVote => REPLY_VOTE,
            MessageType::Custom(kind) => kind,
        }
    }
}

impl From<String> for MessageType {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            HEARTBEAT => MessageType::Heartbeat,
            REQUEST_VOTE => MessageType::RequestVote,
            REPLY_VOTE => MessageType::ReplyVote,
            _ => MessageType::Custom(kind),
        }
    }
}

impl From<&str> for MessageType {
    fn from(kind: &str) -> Self {
        MessageType::from(kind.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "sentFrom")]
    pub sent_from: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "leaderID")]
    pub leader_id: String,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteMessage {
    pub term: u64,
}

/// `leader_id` names the candidate the reply is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyVoteMessage {
    #[serde(rename = "voteGranted")]
    pub vote_granted: bool,
    #[serde(rename = "leaderID")]
    pub leader_id: String,
}

impl Message {
    pub fn new<T: Serialize>(
        kind: MessageType,
        sent_from: impl Into<String>,
        payload: &T,
    ) -> Result<Self, RaftError> {
        Ok(Self {
            kind,
            sent_from: sent_from.into(),
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn heartbeat(sent_from: &str, term: u64) -> Result<Self, RaftError> {
        let payload = HeartbeatMessage {
            leader_id: sent_from.to_string(),
            term,
        };
        Self::new(MessageType::Heartbeat, sent_from, &payload)
    }

    pub fn request_vote(sent_from: &str, term: u64) -> Result<Self, RaftError> {
        Self::new(MessageType::RequestVote, sent_from, &RequestVoteMessage { term })
    }

    pub fn reply_vote(sent_from: &str, candidate: &str, vote_granted: bool) -> Result<Self, RaftError> {
        let payload = ReplyVoteMessage {
            vote_granted,
            leader_id: candidate.to_string(),
        };
        Self::new(MessageType::ReplyVote, sent_from, &payload)
    }

    /// Application message riding the election topic.
    pub fn custom(kind: impl Into<String>, sent_from: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageType::from(kind.into()),
            sent_from: sent_from.into(),
            data,
        }
    }

    /// Decodes the type-specific payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, RaftError> {
        Ok(T::deserialize(&self.data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_uses_wire_field_names() {
        let msg = Message::heartbeat("node-a", 7).expect("heartbeat");
        let wire: Value = serde_json::from_slice(&msg.encode().expect("encode")).expect("json");

        assert_eq!(
            wire,
            json!({
                "type": "heartbeat",
                "sentFrom": "node-a",
                "data": {"leaderID": "node-a", "term": 7}
            })
        );
    }

    #[test]
    fn reply_vote_payload_decodes() {
        let bytes = br#"{"type":"replyVote","sentFrom":"b","data":{"voteGranted":true,"leaderID":"a"}}"#;
        let msg = Message::decode(bytes).expect("decode");

        assert_eq!(msg.kind, MessageType::ReplyVote);
        assert_eq!(msg.sent_from, "b");
        let reply: ReplyVoteMessage = msg.payload().expect("payload");
        assert!(reply.vote_granted);
        assert_eq!(reply.leader_id, "a");
    }

    #[test]
    fn unknown_type_is_kept_as_custom() {
        let bytes = br#"{"type":"proofShare","sentFrom":"c","data":{"round":3}}"#;
        let msg = Message::decode(bytes).expect("decode");

        assert_eq!(msg.kind, MessageType::Custom("proofShare".to_string()));
        assert_eq!(msg.data["round"], 3);

        let reencoded: Value = serde_json::from_slice(&msg.encode().expect("encode")).expect("json");
        assert_eq!(reencoded["type"], "proofShare");
    }

    #[test]
    fn malformed_envelope_is_a_codec_error() {
        assert!(matches!(Message::decode(b"not json"), Err(RaftError::Codec(_))));
        assert!(matches!(
            Message::decode(br#"{"type":"heartbeat"}"#),
            Err(RaftError::Codec(_))
        ));
    }

    #[test]
    fn payload_of_wrong_shape_is_a_codec_error() {
        let msg = Message::custom("heartbeat", "x", json!({"term": "seven"}));
        assert_eq!(msg.kind, MessageType::Heartbeat);
        assert!(matches!(
            msg.payload::<HeartbeatMessage>(),
            Err(RaftError::Codec(_))
        ));
    }
}
