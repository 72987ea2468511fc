use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::{PeerId, RoomId};

/// Line index carried when the sender did not know which m-line a candidate
/// belongs to.
pub const UNKNOWN_M_LINE_INDEX: i32 = -1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// One signaling message as it travels through the relay.
///
/// `room` and `from` are stamped by the sender; the relay adds neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnvelopeBody {
    #[serde(rename = "peer-joined")]
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "ice")]
    Ice { candidate: IceCandidateDescriptor },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        payload: String,
    },
}

impl EnvelopeBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::PeerJoined { .. } => "peer-joined",
            EnvelopeBody::Offer { .. } => "offer",
            EnvelopeBody::Answer { .. } => "answer",
            EnvelopeBody::Ice { .. } => "ice",
            EnvelopeBody::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidateDescriptor {
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default = "unknown_m_line_index",
        deserialize_with = "deserialize_m_line_index",
        skip_serializing_if = "is_unknown_m_line_index"
    )]
    pub sdp_m_line_index: i32,
    pub candidate: String,
}

impl IceCandidateDescriptor {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: i32) -> Self {
        Self {
            sdp_mid,
            sdp_m_line_index,
            candidate: candidate.into(),
        }
    }
}

fn unknown_m_line_index() -> i32 {
    UNKNOWN_M_LINE_INDEX
}

fn is_unknown_m_line_index(index: &i32) -> bool {
    *index == UNKNOWN_M_LINE_INDEX
}

fn deserialize_m_line_index<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i32>::deserialize(deserializer)?.unwrap_or(UNKNOWN_M_LINE_INDEX))
}

impl Envelope {
    pub fn new(body: EnvelopeBody) -> Self {
        Self {
            room: None,
            from: None,
            body,
        }
    }

    pub fn stamped(room: RoomId, from: PeerId, body: EnvelopeBody) -> Self {
        Self {
            room: Some(room),
            from: Some(from),
            body,
        }
    }
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    encode_text(envelope).into_bytes()
}

/// Text-frame form of [`encode`].
pub fn encode_text(envelope: &Envelope) -> String {
    // Only string keys and plain values: serialization cannot fail.
    serde_json::to_string(envelope).expect("envelope serializes to json")
}

/// Unknown keys are ignored; a missing or unrecognised `type` is malformed.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    serde_json::from_slice(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))
}
