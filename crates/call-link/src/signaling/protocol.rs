//! Signaling message types exchanged with the rendezvous server
//!
//! Messages are JSON objects discriminated by a kebab-case `type` field.
//! The server relays `offer`/`answer`/`ice-candidate` between the two
//! partners of a room and emits presence events on its own.

use serde::{Deserialize, Serialize};

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages received from the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundSignal {
    /// Remote session description offer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Sending peer, when the server includes it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// SDP offer
        sdp: String,
        /// Offer restarts ICE on the existing link
        #[serde(default)]
        ice_restart: bool,
        /// Sender replaced its link; the receiver must replace its own
        #[serde(default)]
        rebuilt: bool,
    },

    /// Remote session description answer
    Answer {
        /// Sending peer, when the server includes it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// SDP answer
        sdp: String,
    },

    /// Remote trickle candidate
    IceCandidate {
        /// Sending peer, when the server includes it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Candidate payload
        candidate: IceCandidate,
    },

    /// Partner hung up
    CallEnded,

    /// Partner left the room for good
    PartnerDisconnected,

    /// Server stopped hearing the partner's heartbeat
    PartnerTimeout,

    /// Partner's signaling connection dropped but may come back
    PartnerTemporarilyDisconnected,

    /// Partner's signaling connection came back
    PartnerReconnected,

    /// Server expired the room
    SessionTimeout,
}

/// Messages sent to the signaling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundSignal {
    /// Local session description offer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Room shared with the partner
        room_id: String,
        /// Partner peer id
        to: String,
        /// SDP offer
        sdp: String,
        /// Offer restarts ICE on the existing link
        ice_restart: bool,
        /// The local link was replaced
        rebuilt: bool,
    },

    /// Local session description answer
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Room shared with the partner
        room_id: String,
        /// Partner peer id
        to: String,
        /// SDP answer
        sdp: String,
    },

    /// Local trickle candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Room shared with the partner
        room_id: String,
        /// Partner peer id
        to: String,
        /// Candidate payload
        candidate: IceCandidate,
    },

    /// Keep the room alive
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Room shared with the partner
        room_id: String,
    },

    /// Local hangup
    #[serde(rename_all = "camelCase")]
    EndCall {
        /// Room shared with the partner
        room_id: String,
        /// Partner peer id
        to: String,
    },

    /// Local process is going away
    #[serde(rename_all = "camelCase")]
    BrowserClosing {
        /// Room shared with the partner
        room_id: String,
    },
}

impl InboundSignal {
    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }

    /// Sending peer, for relayed messages that carry one
    pub fn sender(&self) -> Option<&str> {
        match self {
            InboundSignal::Offer { from, .. }
            | InboundSignal::Answer { from, .. }
            | InboundSignal::IceCandidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    /// Get the message type name
    pub fn kind(&self) -> &'static str {
        match self {
            InboundSignal::Offer { .. } => "offer",
            InboundSignal::Answer { .. } => "answer",
            InboundSignal::IceCandidate { .. } => "ice-candidate",
            InboundSignal::CallEnded => "call-ended",
            InboundSignal::PartnerDisconnected => "partner-disconnected",
            InboundSignal::PartnerTimeout => "partner-timeout",
            InboundSignal::PartnerTemporarilyDisconnected => "partner-temporarily-disconnected",
            InboundSignal::PartnerReconnected => "partner-reconnected",
            InboundSignal::SessionTimeout => "session-timeout",
        }
    }
}

impl OutboundSignal {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Get the message type name
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::IceCandidate { .. } => "ice-candidate",
            OutboundSignal::Heartbeat { .. } => "heartbeat",
            OutboundSignal::EndCall { .. } => "end-call",
            OutboundSignal::BrowserClosing { .. } => "browser-closing",
        }
    }
}
