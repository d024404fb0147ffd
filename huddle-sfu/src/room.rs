//! Room: member registry, lobby/live lifecycle and event fan-out

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::peer::Peer;
use crate::rtc::Detector;
use crate::signal::{Event, EventType, Signal};
use crate::types::{PeerId, RoomId};

/// A set of participants relaying media to each other.
///
/// Starts in the lobby, goes live when a host starts it and is closed for
/// good when the host ends it or the hub reaps it.
pub struct Room {
    id: RoomId,
    live: AtomicBool,
    closed: AtomicBool,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    detector: Arc<Detector>,
    cancel: CancellationToken,
    hub: Weak<Hub>,
}

impl Room {
    /// Create a room under `hub` and start its speaker detection.
    ///
    /// The room is not registered; use [`Hub::get_or_create_room`] for that.
    pub fn new(id: RoomId, hub: &Arc<Hub>) -> Arc<Self> {
        let config = hub.config();
        let room = Arc::new(Self {
            id,
            live: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            detector: Arc::new(Detector::new(config.detector_margin)),
            cancel: hub.cancellation_token().child_token(),
            hub: Arc::downgrade(hub),
        });

        room.detector
            .spawn(config.detector_interval(), room.cancel.clone());
        room.spawn_speaker_watch();
        debug!(room_id = %room.id, "Room created");
        room
    }

    fn spawn_speaker_watch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut winner = self.detector.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut announced: Option<PeerId> = None;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = winner.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let current = winner.borrow_and_update().clone();
                let Some(room) = weak.upgrade() else {
                    break;
                };
                let Some(speaker) = current else {
                    announced = None;
                    continue;
                };
                if announced.as_ref() == Some(&speaker) || !room.is_live() {
                    continue;
                }
                let name = room
                    .get_peer(&speaker)
                    .map(|peer| peer.name().to_string())
                    .unwrap_or_default();
                let delivered = room.broadcast(
                    None,
                    &Event::new(EventType::ActiveSpeaker, speaker.clone(), name),
                );
                debug!(room_id = %room.id, peer_id = %speaker, delivered, "Announced active speaker");
                announced = Some(speaker);
            }
        });
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Move from the lobby to live. Returns false if already live.
    pub fn make_live(&self) -> bool {
        let was_live = self.live.swap(true, Ordering::AcqRel);
        if !was_live {
            info!(room_id = %self.id, "Room is live");
        }
        !was_live
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<PeerId> {
        self.detector.active_speaker()
    }

    /// Add a member and feed its audio levels to this room's detector.
    ///
    /// Returns false if the peer was already a member.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<bool> {
        let mut peers = self.peers.write();
        if self.is_closed() {
            return Err(Error::RoomClosed(self.id.to_string()));
        }
        if peers.contains_key(peer.id()) {
            return Ok(false);
        }
        peer.publisher().attach_detector(Arc::clone(&self.detector));
        info!(room_id = %self.id, peer_id = %peer.id(), role = %peer.role(), "Peer joined room");
        peers.insert(peer.id().clone(), peer);
        Ok(true)
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().remove(peer_id);
        if let Some(peer) = &removed {
            peer.publisher().detach_detector();
            self.detector.remove(peer_id);
            info!(room_id = %self.id, peer_id = %peer_id, "Peer left room");
        }
        removed
    }

    #[must_use]
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(peer_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Every member except `peer_id`
    #[must_use]
    pub fn peers_except(&self, peer_id: &PeerId) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .iter()
            .filter(|(id, _)| *id != peer_id)
            .map(|(_, peer)| Arc::clone(peer))
            .collect()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Queue `event` for every member other than `originator`.
    ///
    /// Holds the member lock for the whole pass so concurrent broadcasts
    /// reach each queue in one order. Returns how many queues accepted it.
    pub fn broadcast(&self, originator: Option<&PeerId>, event: &Event) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }
        let peers = self.peers.write();
        let mut delivered = 0;
        for (id, peer) in peers.iter() {
            if Some(id) == originator {
                continue;
            }
            if peer.enqueue_event(event.clone()) {
                delivered += 1;
            }
        }
        debug!(room_id = %self.id, event = ?event.event_type, delivered, "Broadcast event");
        delivered
    }

    /// End the room: stop its tasks, cancel every member still in it and
    /// unregister it from the hub.
    ///
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        {
            let peers = self.peers.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            for peer in peers.values() {
                peer.cancellation_token().cancel();
            }
        }
        self.finish_close();
        true
    }

    /// Close the room on behalf of `originator`, handing `event` straight
    /// to every other member's send queue before cancelling them.
    ///
    /// Returns false if it was already closed.
    pub fn end(&self, originator: &PeerId, event: &Event) -> bool {
        {
            let peers = self.peers.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            for (id, peer) in peers.iter() {
                if id != originator && !peer.enqueue_send(Signal::Event(event.clone())) {
                    debug!(room_id = %self.id, peer_id = %id, "Send queue full, member misses room end");
                }
                peer.cancellation_token().cancel();
            }
        }
        self.finish_close();
        true
    }

    /// Close the room only if nobody is in it.
    ///
    /// Emptiness and the closed flag are decided under one member lock, so
    /// a concurrent [`Room::add_peer`] either lands first and keeps the room
    /// open or sees it closed and fails.
    pub fn close_if_empty(&self) -> bool {
        {
            let peers = self.peers.write();
            if !peers.is_empty() || self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
        }
        self.finish_close();
        true
    }

    fn finish_close(&self) {
        self.cancel.cancel();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_room(&self.id, self);
        }
        info!(room_id = %self.id, "Room closed");
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("closed", &self.is_closed())
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SfuConfig};
    use crate::mailbox::OverflowPolicy;
    use crate::stream::{channel_stream, ClientHandle, PeerMetadata};
    use crate::types::Role;

    fn hub() -> Arc<Hub> {
        Hub::new(SfuConfig {
            stun_servers: Vec::new(),
            slot_pool_size: 2,
            ..Default::default()
        })
    }

    async fn peer(hub: &Arc<Hub>, id: &str, role: Role) -> (Arc<Peer>, ClientHandle) {
        let metadata = PeerMetadata::new(id, id, "room-1", role);
        let (stream, client) = channel_stream(metadata, 32);
        (Peer::new(Arc::clone(hub), stream).await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_add_and_remove_peer() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (a, _ca) = peer(&hub, "a", Role::Host).await;

        assert!(room.add_peer(Arc::clone(&a)).unwrap());
        assert!(!room.add_peer(Arc::clone(&a)).unwrap());
        assert_eq!(room.peer_count(), 1);

        assert!(room.remove_peer(&PeerId::new("a")).is_some());
        assert!(room.remove_peer(&PeerId::new("a")).is_none());
        assert!(room.is_empty());

        a.disconnect().await.ok();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_skips_originator() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (a, _ca) = peer(&hub, "a", Role::Host).await;
        let (b, _cb) = peer(&hub, "b", Role::Guest).await;
        let (c, _cc) = peer(&hub, "c", Role::Guest).await;
        for p in [&a, &b, &c] {
            room.add_peer(Arc::clone(p)).unwrap();
        }

        let event = Event::new(EventType::AudioDisabled, PeerId::new("a"), "a");
        assert_eq!(room.broadcast(Some(a.id()), &event), 2);
        assert_eq!(a.pending_events(), 0);
        assert_eq!(b.pending_events(), 1);
        assert_eq!(c.pending_events(), 1);

        assert_eq!(room.broadcast(None, &event), 3);
        assert_eq!(a.pending_events(), 1);

        for p in [a, b, c] {
            p.disconnect().await.ok();
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_make_live_once() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        assert!(!room.is_live());
        assert!(room.make_live());
        assert!(!room.make_live());
        assert!(room.is_live());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_close_unregisters_and_rejects_joins() {
        let hub = hub();
        let room_id = RoomId::new("room-1");
        let room = hub.get_or_create_room(&room_id);
        let (a, _ca) = peer(&hub, "a", Role::Guest).await;

        assert!(room.close());
        assert!(!room.close());
        assert!(hub.get_room(&room_id).is_none());
        assert!(room.cancellation_token().is_cancelled());
        assert!(matches!(room.add_peer(Arc::clone(&a)), Err(Error::RoomClosed(_))));
        assert_eq!(room.broadcast(None, &Event::new(EventType::RoomEnded, PeerId::new("x"), "")), 0);

        a.disconnect().await.ok();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_close_cancels_members() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (a, _ca) = peer(&hub, "a", Role::Guest).await;
        let (b, _cb) = peer(&hub, "b", Role::Guest).await;
        room.add_peer(Arc::clone(&a)).unwrap();
        room.add_peer(Arc::clone(&b)).unwrap();

        assert!(room.close());
        assert!(a.cancellation_token().is_cancelled());
        assert!(b.cancellation_token().is_cancelled());
        assert!(!hub.is_shutdown());

        for p in [a, b] {
            p.disconnect().await.ok();
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_end_reaches_member_with_full_event_queue() {
        let hub = Hub::new(SfuConfig {
            stun_servers: Vec::new(),
            slot_pool_size: 1,
            event_queue: QueueConfig {
                capacity: 1,
                overflow: OverflowPolicy::DropNewest,
            },
            ..Default::default()
        });
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (host, _ch) = peer(&hub, "host", Role::Host).await;
        let (guest, mut guest_client) = peer(&hub, "guest", Role::Guest).await;
        room.add_peer(Arc::clone(&host)).unwrap();
        room.add_peer(Arc::clone(&guest)).unwrap();
        room.make_live();

        // Fill the guest's event queue so a broadcast would be dropped
        let filler = Event::new(EventType::AudioDisabled, PeerId::new("host"), "host");
        assert_eq!(room.broadcast(Some(host.id()), &filler), 1);
        assert_eq!(room.broadcast(Some(host.id()), &filler), 0);

        let ended = Event::new(EventType::RoomEnded, PeerId::new("host"), "host");
        assert!(room.end(host.id(), &ended));
        assert!(!room.end(host.id(), &ended));

        assert!(room.is_closed());
        assert!(guest.cancellation_token().is_cancelled());
        assert!(host.cancellation_token().is_cancelled());
        assert!(hub.get_room(&RoomId::new("room-1")).is_none());

        // The end event went to the send queue, not the full event queue,
        // and the cancelled session flushes it on its way out
        tokio::time::timeout(std::time::Duration::from_secs(5), guest.connect())
            .await
            .unwrap()
            .ok();
        let mut saw_end = false;
        while let Some(signal) = guest_client.try_recv() {
            if matches!(signal, Signal::Event(ref e) if e.event_type == EventType::RoomEnded) {
                saw_end = true;
            }
        }
        assert!(saw_end);

        host.disconnect().await.ok();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_close_if_empty_keeps_occupied_room() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (a, _ca) = peer(&hub, "a", Role::Guest).await;
        room.add_peer(Arc::clone(&a)).unwrap();

        assert!(!room.close_if_empty());
        assert!(!room.is_closed());
        assert!(!a.cancellation_token().is_cancelled());

        room.remove_peer(a.id());
        assert!(room.close_if_empty());
        assert!(room.is_closed());
        assert!(!room.close_if_empty());

        a.disconnect().await.ok();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_speaker_change_is_broadcast_when_live() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::new("room-1"));
        let (a, _ca) = peer(&hub, "a", Role::Host).await;
        let (b, _cb) = peer(&hub, "b", Role::Guest).await;
        room.add_peer(Arc::clone(&a)).unwrap();
        room.add_peer(Arc::clone(&b)).unwrap();
        room.make_live();

        room.detector().sample(b.id(), 20);
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if a.pending_events() > 0 && b.pending_events() > 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(delivered.is_ok());
        assert_eq!(room.active_speaker(), Some(PeerId::new("b")));

        for p in [a, b] {
            p.disconnect().await.ok();
        }
        hub.shutdown();
    }
}
