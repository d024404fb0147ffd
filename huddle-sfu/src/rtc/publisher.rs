//! Uplink: the participant's own audio and video coming into the SFU

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::extension::audio_level_extension::AudioLevelExtension;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Unmarshal;

use super::{
    Connection, Detector, Negotiable, Negotiation, PublishedTrack, PublishedTracks, TrackSource,
    AUDIO_LEVEL_URI,
};
use crate::config::SfuConfig;
use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::signal::{IceMessage, PcType, SdpMessage, SdpType, Signal};
use crate::types::PeerId;

#[derive(Debug, Clone, Default)]
struct TrackSet {
    audio: Option<Arc<PublishedTrack>>,
    video: Option<Arc<PublishedTrack>>,
}

impl TrackSet {
    fn both(&self) -> Option<PublishedTracks> {
        Some(PublishedTracks {
            audio: self.audio.clone()?,
            video: self.video.clone()?,
        })
    }
}

/// Receives one participant's media and fans it out to subscribers
pub struct Publisher {
    peer_id: PeerId,
    conn: Arc<Connection>,
    inbox: Mailbox<Negotiation>,
    tracks: watch::Sender<TrackSet>,
    detector: RwLock<Option<Arc<Detector>>>,
    cancel: CancellationToken,
    packet_buffer: usize,
    keyframe_interval: Duration,
    last_keyframe_request: Mutex<Option<Instant>>,
}

impl Publisher {
    /// Create the uplink connection. `parent` is the owning peer's lifetime.
    pub async fn new(
        peer_id: PeerId,
        config: &SfuConfig,
        outbound: Mailbox<Signal>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let cancel = parent.child_token();
        let conn = Connection::new(
            peer_id.clone(),
            PcType::Uplink,
            config,
            outbound,
            cancel.clone(),
        )
        .await?;
        let (tracks, _) = watch::channel(TrackSet::default());

        let publisher = Arc::new(Self {
            peer_id,
            conn,
            inbox: Mailbox::from_config(&config.signal_queue),
            tracks,
            detector: RwLock::new(None),
            cancel,
            packet_buffer: config.packet_buffer.max(1),
            keyframe_interval: config.keyframe_request_interval(),
            last_keyframe_request: Mutex::new(None),
        });
        publisher.wire_tracks();
        Ok(publisher)
    }

    fn wire_tracks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.conn.peer_connection().on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(publisher) = weak.upgrade() {
                        publisher.handle_track(remote, receiver).await;
                    }
                })
            },
        ));
    }

    async fn handle_track(self: Arc<Self>, remote: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) {
        let kind = remote.kind();
        if kind == RTPCodecType::Unspecified {
            error!(peer_id = %self.peer_id, ssrc = remote.ssrc(), "Remote track has no media kind, closing publisher");
            self.cancel.cancel();
            return;
        }

        let (sender, _) = broadcast::channel(self.packet_buffer);
        let track = Arc::new(PublishedTrack::new(
            kind,
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
            remote.ssrc(),
            sender.clone(),
        ));

        let level_extension = if kind == RTPCodecType::Audio {
            audio_level_extension_id(&receiver).await
        } else {
            None
        };

        let replaced = {
            let mut previous = None;
            self.tracks.send_modify(|set| {
                let slot = if kind == RTPCodecType::Audio {
                    &mut set.audio
                } else {
                    &mut set.video
                };
                previous = slot.replace(Arc::clone(&track));
            });
            previous
        };
        if let Some(previous) = replaced {
            warn!(peer_id = %self.peer_id, kind = %kind, "Replacing previously published track");
            previous.close();
        }

        info!(
            peer_id = %self.peer_id,
            kind = %kind,
            ssrc = track.ssrc(),
            codec = %track.codec().mime_type,
            audio_level = level_extension.is_some(),
            "Publishing remote track"
        );

        tokio::spawn(async move {
            self.forward(remote, sender, level_extension).await;
        });
    }

    /// Read packets from the remote track until it ends or the publisher
    /// closes, feeding subscribers and the detector.
    async fn forward(
        &self,
        remote: Arc<TrackRemote>,
        sender: broadcast::Sender<Packet>,
        level_extension: Option<u8>,
    ) {
        let kind = remote.kind();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = remote.read_rtp() => match result {
                    Ok((packet, _)) => self.relay(packet, &sender, level_extension),
                    Err(e) => {
                        debug!(peer_id = %self.peer_id, kind = %kind, error = %e, "Remote track ended");
                        break;
                    }
                }
            }
        }
        debug!(peer_id = %self.peer_id, kind = %kind, "RTP reader stopped");
    }

    /// Hand one packet to subscribers, sampling its audio level first
    fn relay(&self, packet: Packet, sender: &broadcast::Sender<Packet>, level_extension: Option<u8>) {
        if let Some(level) = level_extension.and_then(|ext_id| audio_level(&packet, ext_id)) {
            self.sample_level(level);
        }
        // No receivers just means nobody is subscribed yet
        let _ = sender.send(packet);
    }

    fn sample_level(&self, level: u8) {
        if let Some(detector) = self.detector.read().as_ref() {
            detector.sample(&self.peer_id, level);
        }
    }

    /// Feed this participant's audio levels to a room's detector
    pub fn attach_detector(&self, detector: Arc<Detector>) {
        *self.detector.write() = Some(detector);
    }

    pub fn detach_detector(&self) {
        self.detector.write().take();
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tracks published so far, without waiting
    #[must_use]
    pub fn published(&self) -> Option<PublishedTracks> {
        self.tracks.borrow().both()
    }

    async fn handle(&self, message: Negotiation) -> Result<()> {
        match message {
            Negotiation::Sdp(sdp) => match sdp.sdp_type {
                SdpType::Offer => self.conn.handle_offer(sdp.sdp).await,
                SdpType::Answer => {
                    warn!(peer_id = %self.peer_id, "Ignoring SDP answer on uplink");
                    Ok(())
                }
            },
            Negotiation::Ice(ice) => {
                if let Err(e) = self.conn.handle_remote_ice(&ice).await {
                    warn!(peer_id = %self.peer_id, pc = "pub", error = %e, "Failed to add remote ICE candidate");
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Negotiable for Publisher {
    fn enqueue_sdp(&self, sdp: SdpMessage) -> bool {
        let queued = self.inbox.push(Negotiation::Sdp(sdp)).is_queued();
        if !queued {
            debug!(peer_id = %self.peer_id, pc = "pub", "Negotiation queue full, dropped SDP");
        }
        queued
    }

    fn enqueue_ice(&self, ice: IceMessage) -> bool {
        let queued = self.inbox.push(Negotiation::Ice(ice)).is_queued();
        if !queued {
            debug!(peer_id = %self.peer_id, pc = "pub", "Negotiation queue full, dropped ICE candidate");
        }
        queued
    }

    async fn run(&self) -> Result<()> {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                message = self.inbox.recv() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };
            if let Err(e) = self.handle(message).await {
                error!(peer_id = %self.peer_id, error = %e, "Uplink negotiation failed");
                self.cancel.cancel();
                return Err(e);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.inbox.close();
        self.detach_detector();
        {
            let set = self.tracks.borrow();
            for track in [&set.audio, &set.video].into_iter().flatten() {
                track.close();
            }
        }
        self.conn.close().await
    }
}

#[async_trait]
impl TrackSource for Publisher {
    fn owner(&self) -> &PeerId {
        &self.peer_id
    }

    async fn local_av(&self) -> Option<PublishedTracks> {
        let mut rx = self.tracks.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => None,
            result = rx.wait_for(|set| set.both().is_some()) => {
                result.ok().and_then(|set| set.both())
            }
        }
    }

    async fn request_keyframe(&self) -> Result<bool> {
        let Some(ssrc) = self.tracks.borrow().video.as_ref().map(|video| video.ssrc()) else {
            return Ok(false);
        };

        {
            let mut last = self.last_keyframe_request.lock();
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.keyframe_interval) {
                return Ok(false);
            }
            *last = Some(now);
        }

        debug!(peer_id = %self.peer_id, media_ssrc = ssrc, "Requesting keyframe");
        self.conn
            .peer_connection()
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc,
            })])
            .await?;
        Ok(true)
    }
}

/// Negotiated id of the audio-level header extension for a receiver
async fn audio_level_extension_id(receiver: &RTCRtpReceiver) -> Option<u8> {
    receiver
        .get_parameters()
        .await
        .header_extensions
        .iter()
        .find(|ext| ext.uri == AUDIO_LEVEL_URI)
        .and_then(|ext| u8::try_from(ext.id).ok())
}

/// Audio level carried by a packet (0 loudest, 127 silent)
pub(crate) fn audio_level(packet: &Packet, ext_id: u8) -> Option<u8> {
    let mut raw = packet.header.get_extension(ext_id)?;
    AudioLevelExtension::unmarshal(&mut raw)
        .ok()
        .map(|ext| ext.level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;
    use webrtc::util::Marshal;

    fn packet_with_level(ext_id: u8, level: u8) -> Packet {
        let mut header = Header {
            version: 2,
            payload_type: 111,
            sequence_number: 1,
            timestamp: 960,
            ssrc: 1234,
            ..Default::default()
        };
        let ext = AudioLevelExtension { level, voice: true };
        header
            .set_extension(ext_id, ext.marshal().unwrap())
            .unwrap();
        Packet {
            header,
            payload: vec![0u8; 4].into(),
        }
    }

    #[test]
    fn test_audio_level_extraction() {
        let packet = packet_with_level(1, 42);
        assert_eq!(audio_level(&packet, 1), Some(42));
        assert_eq!(audio_level(&packet, 2), None);
    }

    async fn publisher() -> Arc<Publisher> {
        let config = SfuConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        let outbound = Mailbox::new(64, crate::mailbox::OverflowPolicy::DropNewest);
        Publisher::new(PeerId::new("p1"), &config, outbound, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_av_returns_none_after_close() {
        let publisher = publisher().await;
        let waiter = {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { publisher.local_av().await })
        };

        publisher.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn test_relay_feeds_subscribers_and_detector() {
        let publisher = publisher().await;
        let detector = Arc::new(Detector::new(5));
        publisher.attach_detector(Arc::clone(&detector));
        let (sender, mut receiver) = broadcast::channel(8);

        publisher.relay(packet_with_level(3, 30), &sender, Some(3));
        let relayed = receiver.try_recv().unwrap();
        assert_eq!(audio_level(&relayed, 3), Some(30));
        assert_eq!(detector.active_speaker(), Some(PeerId::new("p1")));

        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_without_detector_or_extension() {
        let publisher = publisher().await;
        let (sender, mut receiver) = broadcast::channel(8);

        // No detector attached yet
        publisher.relay(packet_with_level(3, 10), &sender, Some(3));
        assert!(receiver.try_recv().is_ok());

        // Video carries no level extension
        let detector = Arc::new(Detector::new(5));
        publisher.attach_detector(Arc::clone(&detector));
        publisher.relay(packet_with_level(3, 10), &sender, None);
        assert!(receiver.try_recv().is_ok());
        assert_eq!(detector.active_speaker(), None);

        // Nobody subscribed is not an error
        drop(receiver);
        publisher.relay(packet_with_level(3, 10), &sender, Some(3));
        assert_eq!(detector.active_speaker(), Some(PeerId::new("p1")));

        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_keyframe_request_without_video_is_skipped() {
        let publisher = publisher().await;
        assert!(!publisher.request_keyframe().await.unwrap());
        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_dropped() {
        let publisher = publisher().await;
        publisher.close().await.unwrap();
        assert!(!publisher.enqueue_sdp(SdpMessage::offer(PcType::Uplink, "v=0")));
    }
}
