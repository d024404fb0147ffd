//! Downlink: a fixed pool of send-only transceiver slots relaying other
//! participants' media to this participant

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::{
    Connection, Negotiable, Negotiation, PublishedTrack, PublishedTracks, SlotTable, TrackSource,
};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use crate::signal::{IceMessage, PcType, SdpMessage, SdpType, Signal};
use crate::types::PeerId;

/// Result of [`Subscriber::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Media is being relayed through this slot
    Bound(usize),
    /// Every slot is taken; the peer waits for one to free up
    Pending,
    AlreadySubscribed,
    /// Self-subscription, or the source went away before its tracks arrived
    Skipped,
}

struct Binding {
    owner: PeerId,
    pump: CancellationToken,
}

struct Slot {
    index: usize,
    audio: Arc<RTCRtpTransceiver>,
    video: Arc<RTCRtpTransceiver>,
    binding: tokio::sync::Mutex<Option<Binding>>,
}

type Queued = (Arc<dyn TrackSource>, PublishedTracks);

/// Relays remote participants' tracks into a bounded set of slots
pub struct Subscriber {
    peer_id: PeerId,
    conn: Arc<Connection>,
    inbox: Mailbox<Negotiation>,
    slots: Vec<Slot>,
    table: Mutex<SlotTable>,
    queued: Mutex<HashMap<PeerId, Queued>>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Create the downlink connection with `slot_pool_size` audio+video
    /// transceiver pairs already in place.
    pub async fn new(
        peer_id: PeerId,
        config: &SfuConfig,
        outbound: Mailbox<Signal>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let cancel = parent.child_token();
        let conn = Connection::new(
            peer_id.clone(),
            PcType::Downlink,
            config,
            outbound,
            cancel.clone(),
        )
        .await?;

        let pool_size = config.slot_pool_size;
        let mut slots = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let audio = add_sendonly(&conn, RTPCodecType::Audio).await?;
            let video = add_sendonly(&conn, RTPCodecType::Video).await?;
            slots.push(Slot {
                index,
                audio,
                video,
                binding: tokio::sync::Mutex::new(None),
            });
        }
        debug!(peer_id = %peer_id, slots = pool_size, "Allocated subscriber slots");

        Ok(Arc::new(Self {
            peer_id,
            conn,
            inbox: Mailbox::from_config(&config.signal_queue),
            slots,
            table: Mutex::new(SlotTable::new(pool_size)),
            queued: Mutex::new(HashMap::new()),
            cancel,
        }))
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
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Start relaying a remote participant's media.
    ///
    /// Waits for the source to publish both tracks. Subscribing twice to the
    /// same owner never takes a second slot.
    pub async fn subscribe(&self, source: Arc<dyn TrackSource>) -> Result<SubscribeOutcome> {
        let owner = source.owner().clone();
        if owner == self.peer_id {
            return Ok(SubscribeOutcome::Skipped);
        }
        if self.is_closed() {
            return Err(Error::Closed("subscriber"));
        }
        if !self.table.lock().track(&owner) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let tracks = tokio::select! {
            () = self.cancel.cancelled() => None,
            tracks = source.local_av() => tracks,
        };
        let Some(tracks) = tracks else {
            self.table.lock().release(&owner);
            debug!(peer_id = %self.peer_id, owner = %owner, "Source closed before publishing, not subscribing");
            return Ok(SubscribeOutcome::Skipped);
        };

        let index = {
            let mut table = self.table.lock();
            if !table.is_pending(&owner) {
                // Unsubscribed while waiting for tracks
                return Ok(SubscribeOutcome::Skipped);
            }
            match table.assign(&owner) {
                Some(index) => index,
                None => {
                    self.queued.lock().insert(owner.clone(), (source, tracks));
                    info!(peer_id = %self.peer_id, owner = %owner, pending = table.pending().len(), "No free slot, subscription pending");
                    return Ok(SubscribeOutcome::Pending);
                }
            }
        };

        match self.bind_slot(index, source, tracks).await {
            Ok(true) => Ok(SubscribeOutcome::Bound(index)),
            Ok(false) => Ok(SubscribeOutcome::Skipped),
            Err(e) => {
                error!(peer_id = %self.peer_id, owner = %owner, slot = index, error = %e, "Failed to bind slot");
                self.table.lock().release(&owner);
                self.clear_slot(index, &owner).await;
                Err(e)
            }
        }
    }

    /// Subscribe to every source concurrently. Failures are logged per source.
    pub async fn subscribe_all(&self, sources: Vec<Arc<dyn TrackSource>>) -> usize {
        let results = futures::future::join_all(sources.into_iter().map(|source| async move {
            let owner = source.owner().clone();
            (owner, self.subscribe(source).await)
        }))
        .await;

        results
            .into_iter()
            .filter(|(owner, result)| match result {
                Ok(SubscribeOutcome::Bound(_) | SubscribeOutcome::Pending) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!(peer_id = %self.peer_id, owner = %owner, error = %e, "Subscribe failed");
                    false
                }
            })
            .count()
    }

    /// Stop relaying a participant and hand its slot to the next pending one.
    ///
    /// Returns the slot that was freed, if the participant held one.
    pub async fn unsubscribe(&self, owner: &PeerId) -> Result<Option<usize>> {
        let index = self.table.lock().slot_of(owner);
        let mut result = Ok(index);

        if let Some(index) = index {
            let slot = &self.slots[index];
            let mut binding = slot.binding.lock().await;
            if binding.as_ref().is_some_and(|b| &b.owner == owner) {
                if let Some(bound) = binding.take() {
                    bound.pump.cancel();
                }
                if let Err(e) = detach(slot).await {
                    warn!(peer_id = %self.peer_id, owner = %owner, slot = index, error = %e, "Failed to clear slot tracks");
                    result = Err(e);
                }
            }
            self.table.lock().release(owner);
            info!(peer_id = %self.peer_id, owner = %owner, slot = index, "Slot unbound");
        } else {
            self.table.lock().release(owner);
        }
        self.queued.lock().remove(owner);

        self.promote().await;
        result
    }

    /// Bind queued peers to free slots, oldest first
    async fn promote(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let next = {
                let mut table = self.table.lock();
                let mut queued = self.queued.lock();
                let Some(owner) = table
                    .pending()
                    .iter()
                    .find(|p| queued.contains_key(*p))
                    .cloned()
                else {
                    return;
                };
                let Some(index) = table.assign(&owner) else {
                    return;
                };
                queued
                    .remove(&owner)
                    .map(|(source, tracks)| (owner, index, source, tracks))
            };
            let Some((owner, index, source, tracks)) = next else {
                return;
            };

            match self.bind_slot(index, source, tracks).await {
                Ok(_) => {
                    debug!(peer_id = %self.peer_id, owner = %owner, slot = index, "Promoted pending subscription");
                }
                Err(e) => {
                    warn!(peer_id = %self.peer_id, owner = %owner, slot = index, error = %e, "Failed to bind promoted subscription");
                    self.table.lock().release(&owner);
                    self.clear_slot(index, &owner).await;
                }
            }
        }
    }

    /// Attach a source's tracks to a slot the table has assigned to it.
    ///
    /// Returns false if the assignment was withdrawn before the slot lock
    /// was acquired.
    async fn bind_slot(
        &self,
        index: usize,
        source: Arc<dyn TrackSource>,
        tracks: PublishedTracks,
    ) -> Result<bool> {
        let slot = &self.slots[index];
        let owner = source.owner().clone();
        let mut binding = slot.binding.lock().await;

        if self.table.lock().slot_of(&owner) != Some(index) {
            return Ok(false);
        }
        if let Some(stale) = binding.take() {
            stale.pump.cancel();
        }

        let audio_rx = tracks.audio.subscribe().ok_or(Error::Closed("audio track"))?;
        let video_rx = tracks.video.subscribe().ok_or(Error::Closed("video track"))?;
        let audio_local = local_track(&tracks.audio);
        let video_local = local_track(&tracks.video);

        let audio_sender = slot.audio.sender().await;
        let video_sender = slot.video.sender().await;
        audio_sender
            .replace_track(Some(Arc::clone(&audio_local) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        if let Err(e) = video_sender
            .replace_track(Some(Arc::clone(&video_local) as Arc<dyn TrackLocal + Send + Sync>))
            .await
        {
            if let Err(clear) = audio_sender.replace_track(None).await {
                debug!(slot = slot.index, error = %clear, "Failed to roll back audio track");
            }
            return Err(e.into());
        }

        let pump = self.cancel.child_token();
        tokio::spawn(pump_packets(audio_local, RTPCodecType::Audio, audio_rx, pump.clone(), index));
        tokio::spawn(pump_packets(video_local, RTPCodecType::Video, video_rx, pump.clone(), index));
        tokio::spawn(drain_rtcp(audio_sender, None, pump.clone(), index));
        tokio::spawn(drain_rtcp(
            video_sender,
            Some(Arc::clone(&source)),
            pump.clone(),
            index,
        ));

        *binding = Some(Binding {
            owner: owner.clone(),
            pump,
        });
        drop(binding);

        info!(peer_id = %self.peer_id, owner = %owner, slot = index, "Slot bound");
        if let Err(e) = source.request_keyframe().await {
            debug!(peer_id = %self.peer_id, owner = %owner, error = %e, "Keyframe request on bind failed");
        }
        Ok(true)
    }

    /// Drop a binding that still belongs to `owner` after a failed bind
    async fn clear_slot(&self, index: usize, owner: &PeerId) {
        let slot = &self.slots[index];
        let mut binding = slot.binding.lock().await;
        if binding.as_ref().is_some_and(|b| &b.owner == owner) {
            if let Some(bound) = binding.take() {
                bound.pump.cancel();
            }
            if let Err(e) = detach(slot).await {
                debug!(slot = index, error = %e, "Failed to clear slot after bind failure");
            }
        }
    }

    /// Bound owners sorted by slot
    #[must_use]
    pub fn assignments(&self) -> Vec<(usize, PeerId)> {
        self.table.lock().assignments()
    }

    /// Owners waiting for a slot, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<PeerId> {
        self.table.lock().pending().to_vec()
    }

    #[must_use]
    pub fn is_subscribed(&self, owner: &PeerId) -> bool {
        self.table.lock().contains(owner)
    }

    #[must_use]
    pub fn slot_of(&self, owner: &PeerId) -> Option<usize> {
        self.table.lock().slot_of(owner)
    }

    async fn handle(&self, message: Negotiation) -> Result<()> {
        match message {
            Negotiation::Sdp(sdp) => match sdp.sdp_type {
                SdpType::Answer => self.conn.handle_answer(sdp.sdp).await,
                SdpType::Offer => {
                    warn!(peer_id = %self.peer_id, "Ignoring SDP offer on downlink");
                    Ok(())
                }
            },
            Negotiation::Ice(ice) => {
                if let Err(e) = self.conn.handle_remote_ice(&ice).await {
                    warn!(peer_id = %self.peer_id, pc = "sub", error = %e, "Failed to add remote ICE candidate");
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Negotiable for Subscriber {
    fn enqueue_sdp(&self, sdp: SdpMessage) -> bool {
        let queued = self.inbox.push(Negotiation::Sdp(sdp)).is_queued();
        if !queued {
            debug!(peer_id = %self.peer_id, pc = "sub", "Negotiation queue full, dropped SDP");
        }
        queued
    }

    fn enqueue_ice(&self, ice: IceMessage) -> bool {
        let queued = self.inbox.push(Negotiation::Ice(ice)).is_queued();
        if !queued {
            debug!(peer_id = %self.peer_id, pc = "sub", "Negotiation queue full, dropped ICE candidate");
        }
        queued
    }

    /// Send the initial downlink offer, then apply answers and candidates
    async fn run(&self) -> Result<()> {
        if let Err(e) = self.conn.send_offer().await {
            error!(peer_id = %self.peer_id, error = %e, "Failed to send downlink offer");
            self.cancel.cancel();
            return Err(e);
        }

        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                message = self.inbox.recv() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };
            if let Err(e) = self.handle(message).await {
                error!(peer_id = %self.peer_id, error = %e, "Downlink negotiation failed");
                self.cancel.cancel();
                return Err(e);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.inbox.close();
        self.queued.lock().clear();
        for slot in &self.slots {
            if let Some(bound) = slot.binding.lock().await.take() {
                bound.pump.cancel();
            }
        }
        self.conn.close().await
    }
}

async fn add_sendonly(conn: &Connection, kind: RTPCodecType) -> Result<Arc<RTCRtpTransceiver>> {
    let transceiver = conn
        .peer_connection()
        .add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await?;
    Ok(transceiver)
}

fn local_track(track: &PublishedTrack) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        track.codec().clone(),
        track.id().to_owned(),
        track.stream_id().to_owned(),
    ))
}

async fn detach(slot: &Slot) -> Result<()> {
    let audio = slot.audio.sender().await.replace_track(None).await;
    let video = slot.video.sender().await.replace_track(None).await;
    audio?;
    video?;
    debug!(slot = slot.index, "Slot tracks cleared");
    Ok(())
}

/// Copy packets from a published track into a slot's local track until the
/// binding is cancelled or the publisher goes away.
async fn pump_packets<W>(
    local: Arc<W>,
    kind: RTPCodecType,
    mut packets: broadcast::Receiver<Packet>,
    cancel: CancellationToken,
    slot: usize,
) where
    W: TrackLocalWriter + Send + Sync + ?Sized,
{
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            packet = packets.recv() => packet,
        };
        match packet {
            Ok(packet) => {
                if let Err(e) = local.write_rtp(&packet).await {
                    if e == webrtc::Error::ErrClosedPipe {
                        break;
                    }
                    debug!(slot, error = %e, "Failed to write RTP to slot");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(slot, skipped, "Slot pump lagging, skipped packets");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(slot, kind = %kind, "Slot pump stopped");
}

/// Read RTCP from a slot's sender. Picture loss on video is turned into a
/// keyframe request to the source.
async fn drain_rtcp(
    sender: Arc<RTCRtpSender>,
    source: Option<Arc<dyn TrackSource>>,
    cancel: CancellationToken,
    slot: usize,
) {
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = sender.read_rtcp() => result,
        };
        let packets = match result {
            Ok((packets, _)) => packets,
            Err(e) => {
                if !cancel.is_cancelled() {
                    debug!(slot, error = %e, "RTCP read stopped");
                }
                break;
            }
        };
        let Some(source) = &source else {
            continue;
        };
        let wants_keyframe = packets.iter().any(|packet| {
            let any = packet.as_any();
            any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
        });
        if wants_keyframe {
            if let Err(e) = source.request_keyframe().await {
                warn!(slot, owner = %source.owner(), error = %e, "Failed to forward keyframe request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::OverflowPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct FakeSource {
        owner: PeerId,
        tracks: Option<PublishedTracks>,
        keyframes: AtomicUsize,
    }

    fn codec(mime_type: &str, clock_rate: u32, channels: u16) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            ..Default::default()
        }
    }

    impl FakeSource {
        fn new(owner: &str) -> Arc<Self> {
            let (audio_tx, _) = broadcast::channel(16);
            let (video_tx, _) = broadcast::channel(16);
            let audio = PublishedTrack::new(
                RTPCodecType::Audio,
                codec("audio/opus", 48000, 2),
                format!("{owner}-audio"),
                owner.to_string(),
                1,
                audio_tx,
            );
            let video = PublishedTrack::new(
                RTPCodecType::Video,
                codec("video/VP8", 90000, 0),
                format!("{owner}-video"),
                owner.to_string(),
                2,
                video_tx,
            );
            Arc::new(Self {
                owner: PeerId::new(owner),
                tracks: Some(PublishedTracks {
                    audio: Arc::new(audio),
                    video: Arc::new(video),
                }),
                keyframes: AtomicUsize::new(0),
            })
        }

        fn closed(owner: &str) -> Arc<Self> {
            Arc::new(Self {
                owner: PeerId::new(owner),
                tracks: None,
                keyframes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TrackSource for FakeSource {
        fn owner(&self) -> &PeerId {
            &self.owner
        }

        async fn local_av(&self) -> Option<PublishedTracks> {
            self.tracks.clone()
        }

        async fn request_keyframe(&self) -> Result<bool> {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    async fn subscriber(pool_size: usize) -> Arc<Subscriber> {
        let config = SfuConfig {
            stun_servers: Vec::new(),
            slot_pool_size: pool_size,
            ..Default::default()
        };
        let outbound = Mailbox::new(256, OverflowPolicy::DropNewest);
        Subscriber::new(PeerId::new("me"), &config, outbound, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[tokio::test]
    async fn test_binds_first_free_slot_and_requests_keyframe() {
        let sub = subscriber(2).await;
        let a = FakeSource::new("a");

        let outcome = sub.subscribe(a.clone()).await.unwrap();
        assert_eq!(outcome, SubscribeOutcome::Bound(0));
        assert_eq!(sub.assignments(), vec![(0, peer("a"))]);
        assert_eq!(a.keyframes.load(Ordering::SeqCst), 1);

        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let sub = subscriber(2).await;
        let a = FakeSource::new("a");

        sub.subscribe(a.clone()).await.unwrap();
        let again = sub.subscribe(a).await.unwrap();
        assert_eq!(again, SubscribeOutcome::AlreadySubscribed);
        assert_eq!(sub.assignments().len(), 1);

        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_self_subscription_is_skipped() {
        let sub = subscriber(1).await;
        let me = FakeSource::new("me");
        assert_eq!(sub.subscribe(me).await.unwrap(), SubscribeOutcome::Skipped);
        assert!(sub.assignments().is_empty());
        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_source_is_forgotten() {
        let sub = subscriber(1).await;
        let gone = FakeSource::closed("gone");
        assert_eq!(sub.subscribe(gone).await.unwrap(), SubscribeOutcome::Skipped);
        assert!(!sub.is_subscribed(&peer("gone")));
        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_pends_then_promotes_in_order() {
        let sub = subscriber(1).await;
        let a = FakeSource::new("a");
        let b = FakeSource::new("b");
        let c = FakeSource::new("c");

        assert_eq!(sub.subscribe(a).await.unwrap(), SubscribeOutcome::Bound(0));
        assert_eq!(sub.subscribe(b).await.unwrap(), SubscribeOutcome::Pending);
        assert_eq!(sub.subscribe(c).await.unwrap(), SubscribeOutcome::Pending);
        assert_eq!(sub.pending(), vec![peer("b"), peer("c")]);

        assert_eq!(sub.unsubscribe(&peer("a")).await.unwrap(), Some(0));
        assert_eq!(sub.assignments(), vec![(0, peer("b"))]);
        assert_eq!(sub.pending(), vec![peer("c")]);

        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_pending_peer() {
        let sub = subscriber(1).await;
        sub.subscribe(FakeSource::new("a")).await.unwrap();
        sub.subscribe(FakeSource::new("b")).await.unwrap();

        assert_eq!(sub.unsubscribe(&peer("b")).await.unwrap(), None);
        assert!(sub.pending().is_empty());
        assert_eq!(sub.assignments(), vec![(0, peer("a"))]);

        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let sub = subscriber(1).await;
        assert_eq!(sub.unsubscribe(&peer("nobody")).await.unwrap(), None);
        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_all_counts_accepted() {
        let sub = subscriber(2).await;
        let sources: Vec<Arc<dyn TrackSource>> = vec![
            FakeSource::new("a"),
            FakeSource::new("b"),
            FakeSource::new("c"),
            FakeSource::new("me"),
        ];

        let accepted = tokio::time::timeout(Duration::from_secs(5), sub.subscribe_all(sources))
            .await
            .unwrap();
        assert_eq!(accepted, 3);
        assert_eq!(sub.assignments().len(), 2);
        assert_eq!(sub.pending().len(), 1);

        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_slot_tracks_and_stops_pump() {
        let sub = subscriber(1).await;
        let a = FakeSource::new("a");
        assert_eq!(sub.subscribe(a.clone()).await.unwrap(), SubscribeOutcome::Bound(0));

        let slot = &sub.slots[0];
        assert!(slot.audio.sender().await.track().await.is_some());
        assert!(slot.video.sender().await.track().await.is_some());
        let pump = slot
            .binding
            .lock()
            .await
            .as_ref()
            .map(|binding| binding.pump.clone())
            .unwrap();
        assert!(!pump.is_cancelled());

        assert_eq!(sub.unsubscribe(&peer("a")).await.unwrap(), Some(0));
        assert!(pump.is_cancelled());
        assert!(slot.binding.lock().await.is_none());
        assert!(slot.audio.sender().await.track().await.is_none());
        assert!(slot.video.sender().await.track().await.is_none());

        sub.close().await.unwrap();
    }

    #[derive(Debug, Default)]
    struct RecordingWriter {
        written: parking_lot::Mutex<Vec<u16>>,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TrackLocalWriter for RecordingWriter {
        async fn write_rtp(&self, packet: &Packet) -> webrtc::error::Result<usize> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(webrtc::Error::ErrClosedPipe);
            }
            self.written.lock().push(packet.header.sequence_number);
            Ok(packet.payload.len())
        }

        async fn write(&self, b: &[u8]) -> webrtc::error::Result<usize> {
            Ok(b.len())
        }
    }

    fn rtp(sequence_number: u16) -> Packet {
        Packet {
            header: webrtc::rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number,
                ssrc: 7,
                ..Default::default()
            },
            payload: vec![1u8, 2, 3].into(),
        }
    }

    async fn wait_for_writes(writer: &RecordingWriter, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while writer.written.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pump_relays_packets_until_cancelled() {
        let (tx, rx) = broadcast::channel(16);
        let writer = Arc::new(RecordingWriter::default());
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_packets(
            Arc::clone(&writer),
            RTPCodecType::Video,
            rx,
            cancel.clone(),
            0,
        ));

        for seq in 1..=3 {
            tx.send(rtp(seq)).unwrap();
        }
        wait_for_writes(&writer, 3).await;
        assert_eq!(*writer.written.lock(), vec![1, 2, 3]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();

        // Nothing is written once the binding is gone
        let _ = tx.send(rtp(4));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(writer.written.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_pump_stops_when_publisher_goes_away() {
        let (tx, rx) = broadcast::channel(16);
        let writer = Arc::new(RecordingWriter::default());
        let pump = tokio::spawn(pump_packets(
            Arc::clone(&writer),
            RTPCodecType::Audio,
            rx,
            CancellationToken::new(),
            0,
        ));

        tx.send(rtp(1)).unwrap();
        wait_for_writes(&writer, 1).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pump_stops_on_closed_track() {
        let (tx, rx) = broadcast::channel(16);
        let writer = Arc::new(RecordingWriter::default());
        writer.closed.store(true, Ordering::SeqCst);
        let pump = tokio::spawn(pump_packets(
            Arc::clone(&writer),
            RTPCodecType::Audio,
            rx,
            CancellationToken::new(),
            0,
        ));

        tx.send(rtp(1)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(writer.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let sub = subscriber(1).await;
        sub.close().await.unwrap();
        assert!(matches!(
            sub.subscribe(FakeSource::new("a")).await,
            Err(Error::Closed("subscriber"))
        ));
    }
}
