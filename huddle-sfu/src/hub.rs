//! Hub - process-wide room registry
//!
//! This module provides:
//! - Atomic get-or-create of rooms keyed by id
//! - The ICE server list every connection is built with
//! - Aggregate statistics
//! - Background reaping of empty rooms
//! - Shutdown of every room and peer in one call

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::SfuConfig;
use crate::room::Room;
use crate::types::RoomId;

/// Snapshot of hub occupancy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered rooms
    pub rooms: usize,
    /// Rooms a host has started
    pub live_rooms: usize,
    /// Members across all rooms
    pub peers: usize,
}

/// Registry of rooms, shared by every peer
pub struct Hub {
    config: Arc<SfuConfig>,

    /// Active rooms (DashMap shards the lock per key)
    rooms: DashMap<RoomId, Arc<Room>>,

    /// Parent of every room and peer lifetime
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(config: SfuConfig) -> Arc<Self> {
        info!(
            slot_pool_size = config.slot_pool_size,
            stun_servers = config.stun_servers.len(),
            turn = config.turn_server.is_some(),
            "Hub initialized"
        );
        Arc::new(Self {
            config: Arc::new(config),
            rooms: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// ICE servers for new peer connections
    #[must_use]
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config.ice_servers()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Return the registered room, creating and registering it if absent.
    ///
    /// A room that is closed but not yet unregistered is replaced.
    pub fn get_or_create_room(self: &Arc<Self>, room_id: &RoomId) -> Arc<Room> {
        let mut entry = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!(room_id = %room_id, "Created new room");
                Room::new(room_id.clone(), self)
            });
        if entry.value().is_closed() {
            debug!(room_id = %room_id, "Replacing closed room");
            *entry.value_mut() = Room::new(room_id.clone(), self);
        }
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn get_room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Register a room, replacing any room with the same id.
    ///
    /// The replaced room is returned and left running.
    pub fn add_room(&self, room: Arc<Room>) -> Option<Arc<Room>> {
        self.rooms.insert(room.id().clone(), room)
    }

    /// Unregister `room` if it is still the one registered under `room_id`
    pub fn remove_room(&self, room_id: &RoomId, room: &Room) -> bool {
        let removed = self
            .rooms
            .remove_if(room_id, |_, registered| std::ptr::eq(Arc::as_ptr(registered), room))
            .is_some();
        if removed {
            debug!(room_id = %room_id, remaining_rooms = self.rooms.len(), "Removed room");
        }
        removed
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats::default();
        for entry in &self.rooms {
            let room = entry.value();
            stats.rooms += 1;
            stats.peers += room.peer_count();
            if room.is_live() {
                stats.live_rooms += 1;
            }
        }
        stats
    }

    /// Close every room without members. Returns how many were closed.
    pub fn cleanup_empty_rooms(&self) -> usize {
        let empty: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed_count = 0;
        for room in empty {
            // A peer may have joined since the scan
            if room.close_if_empty() {
                removed_count += 1;
            }
        }

        if removed_count > 0 {
            info!(
                removed_count,
                remaining_rooms = self.rooms.len(),
                "Cleaned up empty rooms"
            );
        }
        removed_count
    }

    /// Reap empty rooms every `period` until shutdown
    pub fn spawn_janitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "Starting room janitor");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(hub) = hub.upgrade() else {
                            break;
                        };
                        hub.cleanup_empty_rooms();
                    }
                }
            }
            debug!("Room janitor stopped");
        })
    }

    /// Cancel every room and peer and close all rooms
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for room in rooms {
            room.close();
        }
        info!("Hub shut down");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<Hub> {
        Hub::new(SfuConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let hub = hub();
        let id = RoomId::from("standup");
        let first = hub.get_or_create_room(&id);
        let second = hub.get_or_create_room(&id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hub.room_count(), 1);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let hub = hub();
        let id = RoomId::from("busy");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let hub = Arc::clone(&hub);
                let id = id.clone();
                tokio::spawn(async move { hub.get_or_create_room(&id) })
            })
            .collect();

        let rooms: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(hub.room_count(), 1);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_remove_only_matching_room() {
        let hub = hub();
        let id = RoomId::from("r");
        let old = hub.get_or_create_room(&id);
        let replacement = Room::new(id.clone(), &hub);
        hub.add_room(Arc::clone(&replacement));

        assert!(!hub.remove_room(&id, &old));
        assert!(hub.get_room(&id).is_some());
        assert!(hub.remove_room(&id, &replacement));
        assert!(hub.get_room(&id).is_none());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_get_or_create_replaces_closed_room() {
        let hub = hub();
        let id = RoomId::from("r");
        let closed = Room::new(id.clone(), &hub);
        assert!(closed.close());
        hub.add_room(Arc::clone(&closed));

        let fresh = hub.get_or_create_room(&id);
        assert!(!Arc::ptr_eq(&fresh, &closed));
        assert!(!fresh.is_closed());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let hub = hub();
        let a = hub.get_or_create_room(&RoomId::from("a"));
        hub.get_or_create_room(&RoomId::from("b"));
        a.make_live();

        assert_eq!(
            hub.stats(),
            HubStats {
                rooms: 2,
                live_rooms: 1,
                peers: 0
            }
        );

        assert_eq!(hub.cleanup_empty_rooms(), 2);
        assert_eq!(hub.room_count(), 0);
        assert!(a.is_closed());
        hub.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_never_closes_room_with_member() {
        use crate::peer::Peer;
        use crate::stream::{channel_stream, PeerMetadata};
        use crate::types::Role;
        use std::sync::atomic::{AtomicBool, Ordering};

        let hub = hub();
        let id = RoomId::from("contended");
        let (stream, _client) = channel_stream(PeerMetadata::new("a", "a", "contended", Role::Guest), 8);
        let peer = Peer::new(Arc::clone(&hub), stream).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let janitor = {
            let hub = Arc::clone(&hub);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    hub.cleanup_empty_rooms();
                }
            })
        };

        let mut joined = 0;
        for _ in 0..500 {
            let room = hub.get_or_create_room(&id);
            if room.add_peer(Arc::clone(&peer)).is_ok() {
                joined += 1;
                assert!(!room.is_closed(), "room closed with a member inside");
                room.remove_peer(peer.id());
            }
        }
        stop.store(true, Ordering::Relaxed);
        janitor.join().unwrap();

        assert!(joined > 0);
        peer.disconnect().await.ok();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_rooms() {
        let hub = hub();
        let room = hub.get_or_create_room(&RoomId::from("a"));
        hub.shutdown();
        assert!(hub.is_shutdown());
        assert!(room.is_closed());
        assert!(room.cancellation_token().is_cancelled());
        assert_eq!(hub.room_count(), 0);
    }
}
