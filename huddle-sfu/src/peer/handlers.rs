//! Room-control actions from the client and room events for this peer

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Peer;
use crate::error::{Error, Result};
use crate::room::Room;
use crate::rtc::{SubscribeOutcome, TrackSource};
use crate::signal::{ActionType, Event, EventType, Signal};

/// Attempts to join a room that is closed underneath us
const JOIN_ATTEMPTS: usize = 2;

impl Peer {
    pub(crate) async fn handle_action(self: &Arc<Self>, action: ActionType) -> Result<()> {
        debug!(peer_id = %self.id(), action = ?action, "Handling action");
        match action {
            ActionType::StartRoom => self.start_room(),
            ActionType::Join => self.join(),
            ActionType::Leave => {
                self.leave();
                Ok(())
            }
            ActionType::EndRoom => {
                self.end_room();
                Ok(())
            }
            ActionType::AudioOn
            | ActionType::AudioOff
            | ActionType::VideoOn
            | ActionType::VideoOff => {
                self.announce_media(action);
                Ok(())
            }
            ActionType::DubbingOn | ActionType::DubbingOff => {
                debug!(peer_id = %self.id(), action = ?action, "Dubbing is not relayed");
                Ok(())
            }
        }
    }

    /// Become a member of this peer's room, creating the room if needed
    fn enter_room(self: &Arc<Self>) -> Result<Arc<Room>> {
        if let Some(room) = self.room() {
            if !room.is_closed() {
                return Ok(room);
            }
        }
        if self.hub.is_shutdown() {
            return Err(Error::Closed("hub"));
        }

        let mut last_error = None;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.hub.get_or_create_room(self.room_id());
            match room.add_peer(Arc::clone(self)) {
                Ok(_) => {
                    *self.room.lock() = Some(Arc::clone(&room));
                    return Ok(room);
                }
                Err(e @ Error::RoomClosed(_)) => {
                    debug!(peer_id = %self.id(), room_id = %self.room_id(), "Room closed while joining, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::RoomClosed(self.room_id().to_string())))
    }

    fn start_room(self: &Arc<Self>) -> Result<()> {
        if !self.role().is_host() {
            debug!(peer_id = %self.id(), role = %self.role(), "Ignoring start_room from non-host");
            return Ok(());
        }

        let room = self.enter_room()?;
        if room.make_live() {
            let delivered = room.broadcast(Some(self.id()), &self.event(EventType::RoomActive));
            info!(peer_id = %self.id(), room_id = %room.id(), delivered, "Host started room");
        }
        Ok(())
    }

    fn join(self: &Arc<Self>) -> Result<()> {
        let room = self.enter_room()?;

        if !room.is_live() {
            self.enqueue_send(Signal::Event(self.event(EventType::RoomInactive)));
            info!(peer_id = %self.id(), room_id = %room.id(), "Joined room lobby");
            return Ok(());
        }

        self.enqueue_send(Signal::Event(self.event(EventType::RoomActive)));
        self.subscribe_room(&room);
        room.broadcast(Some(self.id()), &self.event(EventType::JoinEvent));
        info!(peer_id = %self.id(), room_id = %room.id(), "Joined live room");
        Ok(())
    }

    fn leave(&self) {
        let room = self.room.lock().take();
        if let Some(room) = room {
            if room.remove_peer(self.id()).is_some() && room.is_live() {
                room.broadcast(Some(self.id()), &self.event(EventType::LeaveEvent));
            }
            info!(peer_id = %self.id(), room_id = %room.id(), "Left room");
        }
        self.cancel.cancel();
    }

    fn end_room(&self) {
        if !self.role().is_host() {
            debug!(peer_id = %self.id(), role = %self.role(), "Ignoring end_room from non-host");
            return;
        }
        let Some(room) = self.room() else {
            debug!(peer_id = %self.id(), "Ignoring end_room outside a room");
            return;
        };
        if !room.is_live() {
            debug!(peer_id = %self.id(), room_id = %room.id(), "Ignoring end_room for room that is not live");
            return;
        }

        room.end(self.id(), &self.event(EventType::RoomEnded));
        info!(peer_id = %self.id(), room_id = %room.id(), "Host ended room");
        self.cancel.cancel();
    }

    fn announce_media(&self, action: ActionType) {
        let Some(event_type) = action.media_event() else {
            return;
        };
        match self.room() {
            Some(room) if room.is_live() => {
                room.broadcast(Some(self.id()), &self.event(event_type));
            }
            _ => {
                debug!(peer_id = %self.id(), action = ?action, "Ignoring media action outside a live room");
            }
        }
    }

    /// Subscribe to every other member's media in the background
    fn subscribe_room(&self, room: &Room) {
        let sources: Vec<Arc<dyn TrackSource>> = room
            .peers_except(self.id())
            .into_iter()
            .map(|peer| Arc::clone(peer.publisher()) as Arc<dyn TrackSource>)
            .collect();
        if sources.is_empty() {
            return;
        }

        let subscriber = Arc::clone(self.subscriber());
        let peer_id = self.id().clone();
        tokio::spawn(async move {
            let total = sources.len();
            let accepted = subscriber.subscribe_all(sources).await;
            debug!(peer_id = %peer_id, accepted, total, "Subscribed to room");
        });
    }

    fn subscribe_to(&self, source: Arc<dyn TrackSource>) {
        let subscriber = Arc::clone(self.subscriber());
        tokio::spawn(async move {
            let owner = source.owner().clone();
            match subscriber.subscribe(source).await {
                Ok(SubscribeOutcome::Pending) => {
                    debug!(peer_id = %subscriber.peer_id(), owner = %owner, "Subscription waiting for a slot");
                }
                Ok(outcome) => {
                    debug!(peer_id = %subscriber.peer_id(), owner = %owner, outcome = ?outcome, "Subscribed");
                }
                Err(e) => {
                    warn!(peer_id = %subscriber.peer_id(), owner = %owner, error = %e, "Subscribe failed");
                }
            }
        });
    }

    pub(crate) async fn handle_event(&self, event: Event) -> Result<()> {
        debug!(peer_id = %self.id(), event = ?event.event_type, from = %event.peer_id, "Handling event");
        match event.event_type {
            EventType::RoomActive
            | EventType::RoomInactive
            | EventType::AudioEnabled
            | EventType::AudioDisabled
            | EventType::VideoEnabled
            | EventType::VideoDisabled
            | EventType::ActiveSpeaker => {
                self.enqueue_send(Signal::Event(event));
            }
            EventType::JoinEvent => {
                if event.peer_id != *self.id() {
                    match self.room().and_then(|room| room.get_peer(&event.peer_id)) {
                        Some(joined) => {
                            self.subscribe_to(Arc::clone(joined.publisher()) as Arc<dyn TrackSource>);
                        }
                        None => {
                            warn!(peer_id = %self.id(), joined = %event.peer_id, "Joined peer is not in the room");
                        }
                    }
                }
                self.enqueue_send(Signal::Event(event));
            }
            EventType::LeaveEvent => {
                let result = if event.peer_id == *self.id() {
                    Ok(())
                } else {
                    self.subscriber.unsubscribe(&event.peer_id).await.map(|_| ())
                };
                self.enqueue_send(Signal::Event(event));
                result?;
            }
            EventType::RoomEnded => {
                self.enqueue_send(Signal::Event(event));
                info!(peer_id = %self.id(), room_id = %self.room_id(), "Room ended by host");
                self.cancel.cancel();
            }
        }
        Ok(())
    }
}
