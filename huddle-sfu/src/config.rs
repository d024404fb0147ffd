//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::mailbox::OverflowPolicy;

/// Bounded queue settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued items
    pub capacity: usize,
    /// What to discard when the queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            overflow: OverflowPolicy::DropNewest,
        }
    }
}

/// SFU configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// STUN server URLs handed to every peer connection
    pub stun_servers: Vec<String>,
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub turn_server: Option<String>,
    pub turn_username: String,
    pub turn_credential: String,
    /// Number of preallocated audio+video transceiver pairs per subscriber
    pub slot_pool_size: usize,
    /// Quiet period before a coalesced renegotiation offer is sent
    pub renegotiation_debounce_ms: u64,
    /// Active-speaker evaluation period
    pub detector_interval_ms: u64,
    /// Mean-level advantage a challenger needs to replace the current speaker
    pub detector_margin: u8,
    /// Minimum spacing between keyframe requests sent to a publisher
    pub keyframe_request_interval_ms: u64,
    /// RTP packets buffered per published track for slow subscribers
    pub packet_buffer: usize,
    /// Outbound signals waiting to be written to the client
    pub send_queue: QueueConfig,
    /// Room events waiting to be handled by a peer
    pub event_queue: QueueConfig,
    /// SDP and ICE messages waiting for a connection's negotiation loop
    pub signal_queue: QueueConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_server: None,
            turn_username: String::new(),
            turn_credential: String::new(),
            slot_pool_size: 8,
            renegotiation_debounce_ms: 50,
            detector_interval_ms: 200,
            detector_margin: 5,
            keyframe_request_interval_ms: 1000,
            packet_buffer: 256,
            send_queue: QueueConfig::default(),
            event_queue: QueueConfig::default(),
            signal_queue: QueueConfig::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn renegotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.renegotiation_debounce_ms)
    }

    #[must_use]
    pub const fn detector_interval(&self) -> Duration {
        Duration::from_millis(self.detector_interval_ms)
    }

    #[must_use]
    pub const fn keyframe_request_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_request_interval_ms)
    }

    /// ICE server list for a new peer connection
    #[must_use]
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::with_capacity(2);
        if !self.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = self.turn_server.as_ref().filter(|url| !url.is_empty()) {
            servers.push(RTCIceServer {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    /// Check settings that would make the SFU unusable
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.slot_pool_size == 0 {
            errors.push("sfu.slot_pool_size must be greater than 0".to_string());
        }
        if self.detector_interval_ms == 0 {
            errors.push("sfu.detector_interval_ms must be greater than 0".to_string());
        }
        if self.packet_buffer == 0 {
            errors.push("sfu.packet_buffer must be greater than 0".to_string());
        }
        for (name, queue) in [
            ("send_queue", &self.send_queue),
            ("event_queue", &self.event_queue),
            ("signal_queue", &self.signal_queue),
        ] {
            if queue.capacity == 0 {
                errors.push(format!("sfu.{name}.capacity must be greater than 0"));
            }
        }
        let has_turn = self.turn_server.as_ref().is_some_and(|url| !url.is_empty());
        if self.stun_servers.is_empty() && !has_turn {
            errors.push("at least one STUN server or a TURN server must be configured".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
