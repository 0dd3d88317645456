//! Signaling message types exchanged over the relay
//!
//! One `SignalMessage` is the unit of exchange: an envelope (session, sender,
//! optional recipient, sender role) plus a tagged payload. Offer/answer carry
//! a session description, candidate carries an ICE descriptor, roster carries
//! a field-level delta. Join/leave/end have no body and no recipient.

use serde::{Deserialize, Serialize};

use crate::roster::RosterUpdate;
use crate::session::SessionId;

/// Stable participant identifier
pub type ParticipantId = String;

/// Role a participant plays in a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Source of the live media
    Broadcaster,
    /// Receiver of the live media
    Viewer,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    /// Offer from the initiating side
    Offer,
    /// Answer from the responding side
    Answer,
}

/// Session description carried by offer/answer signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSdp {
    /// Description kind
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP text
    pub body: String,
}

/// ICE candidate descriptor
///
/// Field names mirror the candidate-init shape used by the transport layer
/// so conversion is direct in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Session the message belongs to
    pub session_id: SessionId,

    /// Sending participant
    pub from: ParticipantId,

    /// Intended recipient; absent for broadcast-scope messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<ParticipantId>,

    /// Role of the sender
    pub role: PeerRole,

    /// Typed payload
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Payload variants, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Viewer requests to join the session
    Join,

    /// Session description offer addressed to one viewer
    Offer {
        /// The offer description
        sdp: SessionSdp,
    },

    /// Session description answer addressed to the broadcaster
    Answer {
        /// The answer description
        sdp: SessionSdp,
    },

    /// ICE candidate addressed to the remote side of one link
    Candidate {
        /// The candidate descriptor
        candidate: CandidateInit,
    },

    /// Viewer leaves the session (fast path; link-state transitions remain
    /// authoritative if this message is lost)
    Leave,

    /// Broadcaster ends the session
    End,

    /// Roster delta (self-reported video state, attendance checks)
    Roster {
        /// Fields to merge into the participant's roster entry
        update: RosterUpdate,
    },
}

impl SignalMessage {
    /// Viewer announces itself to the session
    pub fn join(session_id: impl Into<SessionId>, from: impl Into<ParticipantId>) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: None,
            role: PeerRole::Viewer,
            payload: SignalPayload::Join,
        }
    }

    /// Broadcaster offers a session description to one viewer
    pub fn offer(
        session_id: impl Into<SessionId>,
        from: impl Into<ParticipantId>,
        to: impl Into<ParticipantId>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: Some(to.into()),
            role: PeerRole::Broadcaster,
            payload: SignalPayload::Offer {
                sdp: SessionSdp {
                    kind: SdpKind::Offer,
                    body: body.into(),
                },
            },
        }
    }

    /// Viewer answers the broadcaster's offer
    pub fn answer(
        session_id: impl Into<SessionId>,
        from: impl Into<ParticipantId>,
        to: impl Into<ParticipantId>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: Some(to.into()),
            role: PeerRole::Viewer,
            payload: SignalPayload::Answer {
                sdp: SessionSdp {
                    kind: SdpKind::Answer,
                    body: body.into(),
                },
            },
        }
    }

    /// ICE candidate for the remote side of one link
    pub fn candidate(
        session_id: impl Into<SessionId>,
        from: impl Into<ParticipantId>,
        to: impl Into<ParticipantId>,
        role: PeerRole,
        candidate: CandidateInit,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: Some(to.into()),
            role,
            payload: SignalPayload::Candidate { candidate },
        }
    }

    /// Viewer departs the session
    pub fn leave(session_id: impl Into<SessionId>, from: impl Into<ParticipantId>) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: None,
            role: PeerRole::Viewer,
            payload: SignalPayload::Leave,
        }
    }

    /// Broadcaster ends the session
    pub fn end(session_id: impl Into<SessionId>, from: impl Into<ParticipantId>) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: None,
            role: PeerRole::Broadcaster,
            payload: SignalPayload::End,
        }
    }

    /// Roster delta from either role
    pub fn roster(
        session_id: impl Into<SessionId>,
        from: impl Into<ParticipantId>,
        role: PeerRole,
        update: RosterUpdate,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: None,
            role,
            payload: SignalPayload::Roster { update },
        }
    }

    /// Wire name of the payload type
    pub fn type_name(&self) -> &'static str {
        match &self.payload {
            SignalPayload::Join => "join",
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::Leave => "leave",
            SignalPayload::End => "end",
            SignalPayload::Roster { .. } => "roster",
        }
    }

    /// Whether this message may be consumed by `participant_id`
    ///
    /// Broadcast-scope messages (no recipient) are addressed to everyone;
    /// targeted messages only to their named recipient.
    pub fn is_addressed_to(&self, participant_id: &str) -> bool {
        match &self.to {
            Some(to) => to == participant_id,
            None => true,
        }
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signal message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to deserialize signal message: {}", e))
        })
    }
}
