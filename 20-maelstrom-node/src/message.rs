//! Wire codec for the line-delimited JSON protocol.
//!
//! Every line is one [`Message`]. The body carries the reserved `msg_id` and
//! `in_reply_to` fields next to a `type`-tagged [`Payload`]; serde flattens the
//! two together so payload variants never declare the reserved fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub type NodeId = String;
pub type MessageId = u64;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    pub fn new(src: impl Into<NodeId>, dest: impl Into<NodeId>, body: Body) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// Decodes one protocol line. Trailing line endings are tolerated.
    pub fn decode(line: &str) -> Result<Self, Error> {
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        serde_json::from_str(trimmed).map_err(Error::Malformed)
    }

    /// Decodes one raw input line. Bytes that are not valid UTF-8 are malformed input.
    pub fn decode_bytes(line: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(line).map_err(Error::Malformed)
    }

    /// Encodes the message as a single line without the trailing newline.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::Encode)
    }

    /// Builds the reply envelope for this message, addressed back to its sender.
    pub fn reply(&self, payload: Payload) -> Message {
        Message {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body {
                payload,
                msg_id: None,
                in_reply_to: self.body.msg_id,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Body {
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
}

impl Body {
    pub fn request(msg_id: MessageId, payload: Payload) -> Self {
        Self {
            payload,
            msg_id: Some(msg_id),
            in_reply_to: None,
        }
    }

    pub fn response(in_reply_to: MessageId, payload: Payload) -> Self {
        Self {
            payload,
            msg_id: None,
            in_reply_to: Some(in_reply_to),
        }
    }

    /// A body is treated as a response when it correlates to one of our requests.
    pub fn is_response(&self) -> bool {
        self.in_reply_to.is_some() && self.payload.is_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Echo {
        echo: String,
    },
    EchoOk {
        echo: String,
    },
    Generate,
    GenerateOk {
        id: u64,
    },
    Broadcast {
        message: i64,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<i64>,
    },
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Error {
        code: u32,
        text: String,
    },
}

impl Payload {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::InitOk
                | Payload::EchoOk { .. }
                | Payload::GenerateOk { .. }
                | Payload::BroadcastOk
                | Payload::ReadOk { .. }
                | Payload::TopologyOk
                | Payload::Error { .. }
        )
    }

    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Payload::Error {
            code: code.into(),
            text: text.into(),
        }
    }

    /// Wire tag of the payload, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Echo { .. } => "echo",
            Payload::EchoOk { .. } => "echo_ok",
            Payload::Generate => "generate",
            Payload::GenerateOk { .. } => "generate_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Error { .. } => "error",
        }
    }
}

/// Standard error codes understood by the test harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
}

impl ErrorCode {
    const ALL: [ErrorCode; 11] = [
        ErrorCode::Timeout,
        ErrorCode::NodeNotFound,
        ErrorCode::NotSupported,
        ErrorCode::TemporarilyUnavailable,
        ErrorCode::MalformedRequest,
        ErrorCode::Crash,
        ErrorCode::Abort,
        ErrorCode::KeyDoesNotExist,
        ErrorCode::KeyAlreadyExists,
        ErrorCode::PreconditionFailed,
        ErrorCode::TxnConflict,
    ];

    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|known| known.code() == code)
    }

    /// Definite errors guarantee the requested operation did not take place.
    pub fn is_definite(self) -> bool {
        !matches!(self, ErrorCode::Timeout | ErrorCode::Crash)
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_init_request() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"init","msg_id":1,"node_id":"n1","node_ids":["n1","n2"]}}"#;
        let message = Message::decode(line).expect("decode init");

        assert_eq!(message.src, "c1");
        assert_eq!(message.dest, "n1");
        assert_eq!(message.body.msg_id, Some(1));
        assert_eq!(message.body.in_reply_to, None);
        assert_eq!(
            message.body.payload,
            Payload::Init {
                node_id: "n1".into(),
                node_ids: vec!["n1".into(), "n2".into()],
            }
        );
    }

    #[test]
    fn encodes_reply_without_absent_reserved_fields() {
        let request = Message::decode(
            r#"{"src":"c1","dest":"n1","body":{"type":"init","msg_id":1,"node_id":"n1","node_ids":["n1"]}}"#,
        )
        .expect("decode init");

        let line = request.reply(Payload::InitOk).encode().expect("encode");

        assert_eq!(
            line,
            r#"{"src":"n1","dest":"c1","body":{"type":"init_ok","in_reply_to":1}}"#
        );
    }

    #[test]
    fn raw_lines_with_invalid_utf8_are_malformed() {
        let valid = br#"{"src":"c1","dest":"n1","body":{"type":"read","msg_id":2}}"#;
        let message = Message::decode_bytes(valid).expect("decode read");
        assert_eq!(message.body, Body::request(2, Payload::Read));

        let invalid = b"{\"src\":\"c\xff\",\"dest\":\"n1\",\"body\":{\"type\":\"read\"}}";
        assert!(matches!(Message::decode_bytes(invalid), Err(Error::Malformed(_))));
        assert!(matches!(Message::decode_bytes(b"\xff\xfe garbage"), Err(Error::Malformed(_))));
    }

    #[test]
    fn ignores_unknown_body_fields() {
        let line = r#"{"src":"c1","dest":"n1","body":{"type":"read","msg_id":4,"trace":"abc","extra":[1,2]}}"#;
        let message = Message::decode(line).expect("decode read");

        assert_eq!(message.body, Body::request(4, Payload::Read));
    }

    #[test]
    fn rejects_unknown_tag_and_garbage() {
        let unknown = r#"{"src":"c1","dest":"n1","body":{"type":"cas","msg_id":1}}"#;
        assert!(matches!(Message::decode(unknown), Err(Error::Malformed(_))));
        assert!(matches!(Message::decode("not json"), Err(Error::Malformed(_))));
        assert!(matches!(
            Message::decode(r#"{"src":"c1","body":{"type":"read"}}"#),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn decodes_topology_and_error_bodies() {
        let topology = Message::decode(
            r#"{"src":"c1","dest":"n1","body":{"type":"topology","msg_id":2,"topology":{"n1":["n2","n3"],"n2":["n1"]}}}"#,
        )
        .expect("decode topology");
        match topology.body.payload {
            Payload::Topology { topology } => {
                assert_eq!(topology["n1"], vec!["n2".to_string(), "n3".to_string()]);
                assert_eq!(topology["n2"], vec!["n1".to_string()]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let error = Message::decode(
            r#"{"src":"n2","dest":"n1","body":{"type":"error","in_reply_to":7,"code":11,"text":"busy"}}"#,
        )
        .expect("decode error");
        assert!(error.body.is_response());
        assert_eq!(
            error.body.payload,
            Payload::error(ErrorCode::TemporarilyUnavailable, "busy")
        );
    }

    #[test]
    fn requests_are_not_responses_even_with_in_reply_to() {
        let body = Body {
            payload: Payload::Broadcast { message: 3 },
            msg_id: Some(9),
            in_reply_to: Some(2),
        };
        assert!(!body.is_response());
        assert!(Body::response(2, Payload::BroadcastOk).is_response());
    }

    #[test]
    fn error_codes_map_both_ways() {
        assert_eq!(ErrorCode::from_code(10), Some(ErrorCode::NotSupported));
        assert_eq!(ErrorCode::from_code(30), Some(ErrorCode::TxnConflict));
        assert_eq!(ErrorCode::from_code(99), None);
        assert!(!ErrorCode::Timeout.is_definite());
        assert!(ErrorCode::MalformedRequest.is_definite());
    }
}
