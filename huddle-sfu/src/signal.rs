//! Signal protocol exchanged with clients over the duplex signal stream
//!
//! Messages are JSON objects tagged with `type` and carrying a `payload`:
//!
//! ```json
//! {"type": "sdp", "payload": {"pc": "pub", "type": "offer", "sdp": "v=0..."}}
//! {"type": "action", "payload": {"type": "join"}}
//! ```

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::types::PeerId;

/// A single message on the signal stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    Sdp(SdpMessage),
    Ice(IceMessage),
    Action(Action),
    Event(Event),
}

impl Signal {
    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sdp(_) => "sdp",
            Self::Ice(_) => "ice",
            Self::Action(_) => "action",
            Self::Event(_) => "event",
        }
    }
}

/// Which of the participant's two connections a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PcType {
    /// Participant to SFU media
    #[serde(rename = "pub")]
    Uplink,
    /// SFU to participant media
    #[serde(rename = "sub")]
    Downlink,
    #[default]
    #[serde(rename = "pc_unspecified")]
    Unspecified,
}

impl PcType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Uplink => "pub",
            Self::Downlink => "sub",
            Self::Unspecified => "pc_unspecified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpMessage {
    pub pc: PcType,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SdpMessage {
    pub fn offer(pc: PcType, sdp: impl Into<String>) -> Self {
        Self {
            pc,
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(pc: PcType, sdp: impl Into<String>) -> Self {
        Self {
            pc,
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IceMessage {
    pub pc: PcType,
    pub candidate: String,
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub username_fragment: String,
}

impl IceMessage {
    #[must_use]
    pub fn from_candidate_init(pc: PcType, init: RTCIceCandidateInit) -> Self {
        Self {
            pc,
            candidate: init.candidate,
            sdp_mid: init.sdp_mid.unwrap_or_default(),
            sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
            username_fragment: init.username_fragment.unwrap_or_default(),
        }
    }

    /// Empty optional fields are left unset.
    #[must_use]
    pub fn to_candidate_init(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: Some(self.sdp_mid.clone()).filter(|mid| !mid.is_empty()),
            sdp_mline_index: Some(self.sdp_mline_index),
            username_fragment: Some(self.username_fragment.clone()).filter(|u| !u.is_empty()),
        }
    }
}

/// Room-control request from a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
}

impl From<ActionType> for Action {
    fn from(action_type: ActionType) -> Self {
        Self { action_type }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    StartRoom,
    Join,
    Leave,
    EndRoom,
    AudioOn,
    AudioOff,
    VideoOn,
    VideoOff,
    DubbingOn,
    DubbingOff,
}

impl ActionType {
    /// Event broadcast for a mute/unmute action
    #[must_use]
    pub const fn media_event(&self) -> Option<EventType> {
        match self {
            Self::AudioOn => Some(EventType::AudioEnabled),
            Self::AudioOff => Some(EventType::AudioDisabled),
            Self::VideoOn => Some(EventType::VideoEnabled),
            Self::VideoOff => Some(EventType::VideoDisabled),
            _ => None,
        }
    }
}

/// Room notification about a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "peerID")]
    pub peer_id: PeerId,
    #[serde(rename = "type")]
    pub event_type: EventType,
}

impl Event {
    pub fn new(event_type: EventType, peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer_id,
            event_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RoomActive,
    RoomInactive,
    RoomEnded,
    JoinEvent,
    LeaveEvent,
    AudioEnabled,
    AudioDisabled,
    VideoEnabled,
    VideoDisabled,
    ActiveSpeaker,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sdp_wire_format() {
        let signal = Signal::Sdp(SdpMessage::offer(PcType::Downlink, "v=0"));
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({"type": "sdp", "payload": {"pc": "sub", "type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_browser_ice_candidate_parses() {
        let raw = json!({
            "type": "ice",
            "payload": {
                "pc": "pub",
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        });
        let signal: Signal = serde_json::from_value(raw).unwrap();
        let Signal::Ice(ice) = signal else {
            panic!("expected ice, got {signal:?}");
        };
        assert_eq!(ice.pc, PcType::Uplink);
        assert_eq!(ice.sdp_mid, "0");

        let init = ice.to_candidate_init();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_ice_without_optional_fields() {
        let ice: IceMessage =
            serde_json::from_value(json!({"pc": "sub", "candidate": "candidate:x"})).unwrap();
        let init = ice.to_candidate_init();
        assert_eq!(init.sdp_mid, None);
        assert_eq!(init.username_fragment, None);
        assert_eq!(init.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_action_ignores_client_extras() {
        let raw = json!({
            "type": "action",
            "payload": {"peerID": "p1", "roomID": "r1", "role": "host", "type": "start_room"}
        });
        let signal: Signal = serde_json::from_value(raw).unwrap();
        assert_eq!(signal, Signal::Action(Action::from(ActionType::StartRoom)));
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event::new(EventType::JoinEvent, PeerId::new("p2"), "Bob");
        let value = serde_json::to_value(Signal::Event(event)).unwrap();
        assert_eq!(
            value,
            json!({"type": "event", "payload": {"name": "Bob", "peerID": "p2", "type": "join_event"}})
        );
    }

    #[test]
    fn test_media_event_mapping() {
        assert_eq!(ActionType::AudioOff.media_event(), Some(EventType::AudioDisabled));
        assert_eq!(ActionType::VideoOn.media_event(), Some(EventType::VideoEnabled));
        assert_eq!(ActionType::DubbingOn.media_event(), None);
    }
}
