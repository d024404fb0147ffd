//! WebRTC media plane: connections, uplink/downlink roles, speaker detection

mod candidates;
mod connection;
mod debounce;
mod detector;
mod publisher;
mod slots;
mod subscriber;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

use crate::error::Result;
use crate::signal::{IceMessage, SdpMessage};
use crate::types::PeerId;

pub use connection::Connection;
pub use detector::{Detector, SILENCE_LEVEL};
pub use publisher::Publisher;
pub use slots::SlotTable;
pub use subscriber::{SubscribeOutcome, Subscriber};

pub(crate) use candidates::CandidateBuffer;
pub(crate) use debounce::Debouncer;

/// RTP header extension carrying the sender's audio level (RFC 6464)
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Build a WebRTC API with the default codecs, interceptors and the
/// audio-level header extension.
pub(crate) fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    media_engine.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.to_owned(),
        },
        RTPCodecType::Audio,
        None,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Remote negotiation input queued for a role's loop
#[derive(Debug, Clone)]
pub(crate) enum Negotiation {
    Sdp(SdpMessage),
    Ice(IceMessage),
}

/// A role that runs an offer/answer exchange over one [`Connection`]
#[async_trait]
pub trait Negotiable: Send + Sync {
    /// Hand a remote SDP to the negotiation loop without waiting.
    ///
    /// Returns false if the message was discarded.
    fn enqueue_sdp(&self, sdp: SdpMessage) -> bool;

    /// Hand a remote ICE candidate to the negotiation loop without waiting
    fn enqueue_ice(&self, ice: IceMessage) -> bool;

    /// Run the negotiation loop until the role is closed or fails
    async fn run(&self) -> Result<()>;

    /// Tear down the role and its connection
    async fn close(&self) -> Result<()>;
}

/// Something whose media can be relayed to subscribers
#[async_trait]
pub trait TrackSource: Send + Sync {
    /// Participant that owns the media
    fn owner(&self) -> &PeerId;

    /// Wait until both audio and video tracks exist.
    ///
    /// `None` if the source shut down first.
    async fn local_av(&self) -> Option<PublishedTracks>;

    /// Ask the sender for a fresh keyframe. Returns false when rate limited
    /// or when no video track exists yet.
    async fn request_keyframe(&self) -> Result<bool>;
}

/// One published remote track, fanned out to any number of subscribers
pub struct PublishedTrack {
    kind: RTPCodecType,
    codec: RTCRtpCodecCapability,
    id: String,
    stream_id: String,
    ssrc: u32,
    packets: Mutex<Option<broadcast::Sender<Packet>>>,
}

impl PublishedTrack {
    pub(crate) fn new(
        kind: RTPCodecType,
        codec: RTCRtpCodecCapability,
        id: String,
        stream_id: String,
        ssrc: u32,
        packets: broadcast::Sender<Packet>,
    ) -> Self {
        Self {
            kind,
            codec,
            id,
            stream_id,
            ssrc,
            packets: Mutex::new(Some(packets)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> RTPCodecType {
        self.kind
    }

    #[must_use]
    pub const fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Receive packets from now on. `None` once the track is closed.
    #[must_use]
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Packet>> {
        self.packets.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Stop handing out receivers. Existing receivers see the channel close
    /// once the track's reader also stops.
    pub(crate) fn close(&self) {
        self.packets.lock().take();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.packets.lock().is_none()
    }
}

impl std::fmt::Debug for PublishedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedTrack")
            .field("kind", &self.kind)
            .field("mime_type", &self.codec.mime_type)
            .field("id", &self.id)
            .field("ssrc", &self.ssrc)
            .finish_non_exhaustive()
    }
}

/// A participant's audio and video, available once both have arrived
#[derive(Debug, Clone)]
pub struct PublishedTracks {
    pub audio: Arc<PublishedTrack>,
    pub video: Arc<PublishedTrack>,
}
