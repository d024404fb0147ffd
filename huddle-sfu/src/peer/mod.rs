//! Peer: one participant's session from stream open to teardown
//!
//! A peer owns an uplink [`Publisher`] and a downlink [`Subscriber`] for its
//! whole lifetime. [`Peer::connect`] runs five tasks until the first of them
//! finishes:
//!
//! - the publisher's negotiation loop
//! - the subscriber's negotiation loop (sends the first downlink offer)
//! - the send loop, draining the send queue into the stream
//! - the event loop, draining room events
//! - the receive loop, routing inbound signals
//!
//! Whichever ends first (stream closed, LEAVE, negotiation failure) cancels
//! the rest, and the peer is torn down with [`Peer::disconnect`].

mod handlers;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::mailbox::{Mailbox, PushOutcome};
use crate::room::Room;
use crate::rtc::{Negotiable, Publisher, Subscriber};
use crate::signal::{Event, EventType, PcType, Signal};
use crate::stream::{PeerMetadata, SignalReader, SignalStream, SignalWriter};
use crate::types::{PeerId, Role, RoomId};

/// A connected participant
pub struct Peer {
    metadata: PeerMetadata,
    hub: Arc<Hub>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    send_queue: Mailbox<Signal>,
    events: Mailbox<Event>,
    /// Room this peer is a member of
    room: Mutex<Option<Arc<Room>>>,
    reader: tokio::sync::Mutex<Option<Box<dyn SignalReader>>>,
    writer: tokio::sync::Mutex<Option<Box<dyn SignalWriter>>>,
    cancel: CancellationToken,
    disconnected: AtomicBool,
}

impl Peer {
    /// Build a peer from a freshly opened signal stream
    pub async fn new(hub: Arc<Hub>, stream: SignalStream) -> Result<Arc<Self>> {
        let SignalStream {
            metadata,
            reader,
            writer,
        } = stream;
        let config = hub.config();
        let cancel = hub.cancellation_token().child_token();
        let send_queue = Mailbox::from_config(&config.send_queue);

        let publisher =
            Publisher::new(metadata.peer_id.clone(), config, send_queue.clone(), &cancel).await?;
        let subscriber =
            match Subscriber::new(metadata.peer_id.clone(), config, send_queue.clone(), &cancel)
                .await
            {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    if let Err(close) = publisher.close().await {
                        debug!(error = %close, "Failed to close publisher after subscriber setup failed");
                    }
                    return Err(e);
                }
            };

        debug!(
            peer_id = %metadata.peer_id,
            room_id = %metadata.room_id,
            role = %metadata.role,
            "Peer created"
        );

        Ok(Arc::new(Self {
            events: Mailbox::from_config(&config.event_queue),
            metadata,
            hub,
            publisher,
            subscriber,
            send_queue,
            room: Mutex::new(None),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            cancel,
            disconnected: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.metadata.peer_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.metadata.role
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.metadata.room_id
    }

    #[must_use]
    pub const fn metadata(&self) -> &PeerMetadata {
        &self.metadata
    }

    #[must_use]
    pub const fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    #[must_use]
    pub const fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Room this peer currently belongs to
    #[must_use]
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().clone()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Events queued but not yet handled
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Hand a room event to this peer without waiting
    pub fn enqueue_event(&self, event: Event) -> bool {
        match self.events.push(event) {
            PushOutcome::Queued => true,
            PushOutcome::Evicted => {
                debug!(peer_id = %self.id(), dropped = self.events.dropped(), "Event queue full, evicted oldest event");
                true
            }
            PushOutcome::Dropped => {
                debug!(peer_id = %self.id(), dropped = self.events.dropped(), "Event queue full, dropped event");
                false
            }
            PushOutcome::Closed => false,
        }
    }

    /// Queue a signal for the client without waiting
    pub fn enqueue_send(&self, signal: Signal) -> bool {
        let kind = signal.kind();
        match self.send_queue.push(signal) {
            PushOutcome::Queued => true,
            PushOutcome::Evicted => {
                debug!(peer_id = %self.id(), kind, dropped = self.send_queue.dropped(), "Send queue full, evicted oldest signal");
                true
            }
            PushOutcome::Dropped => {
                debug!(peer_id = %self.id(), kind, dropped = self.send_queue.dropped(), "Send queue full, dropped signal");
                false
            }
            PushOutcome::Closed => false,
        }
    }

    fn negotiator(&self, pc: PcType) -> Option<&dyn Negotiable> {
        match pc {
            PcType::Uplink => Some(&*self.publisher as &dyn Negotiable),
            PcType::Downlink => Some(&*self.subscriber as &dyn Negotiable),
            PcType::Unspecified => None,
        }
    }

    /// This peer's identity stamped on an event
    pub(crate) fn event(&self, event_type: EventType) -> Event {
        Event::new(event_type, self.id().clone(), self.name())
    }

    /// Run the session until it ends, then tear the peer down.
    ///
    /// Can only be called once; the stream halves are consumed.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(Error::Closed("signal stream"))?;
        let writer = self
            .writer
            .lock()
            .await
            .take()
            .ok_or(Error::Closed("signal stream"))?;

        info!(peer_id = %self.id(), room_id = %self.room_id(), role = %self.role(), "Peer connected");

        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        {
            let publisher = Arc::clone(&self.publisher);
            tasks.spawn(async move { ("publisher", publisher.run().await) });
        }
        {
            let subscriber = Arc::clone(&self.subscriber);
            tasks.spawn(async move { ("subscriber", subscriber.run().await) });
        }
        {
            let peer = Arc::clone(self);
            tasks.spawn(async move { ("send", peer.send_loop(writer).await) });
        }
        {
            let peer = Arc::clone(self);
            tasks.spawn(async move { ("event", peer.event_loop().await) });
        }
        {
            let peer = Arc::clone(self);
            tasks.spawn(async move { ("receive", peer.receive_loop(reader).await) });
        }

        let mut first_error = None;
        let mut first = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((task, Ok(()))) => {
                    debug!(peer_id = %self.id(), task, "Peer task finished");
                }
                Ok((task, Err(e))) => {
                    warn!(peer_id = %self.id(), task, error = %e, "Peer task failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(peer_id = %self.id(), error = %e, "Peer task panicked");
                    first_error.get_or_insert(Error::Task(e.to_string()));
                }
            }
            if first {
                first = false;
                self.cancel.cancel();
            }
        }

        let teardown = self.disconnect().await;
        match first_error {
            Some(e) => Err(e),
            None => teardown,
        }
    }

    async fn send_loop(self: Arc<Self>, mut writer: Box<dyn SignalWriter>) -> Result<()> {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = self.send_queue.recv() => next,
            };
            let Some(signal) = next else {
                return Ok(());
            };
            debug!(peer_id = %self.id(), kind = signal.kind(), "Sending signal");
            writer.send(signal).await?;
        }

        // Deliver what was queued before teardown, such as a final event
        for signal in self.send_queue.drain() {
            if writer.send(signal).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn event_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                next = self.events.recv() => next,
            };
            let Some(event) = next else {
                return Ok(());
            };
            if let Err(e) = self.handle_event(event).await {
                warn!(peer_id = %self.id(), error = %e, "Failed to handle room event");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: Box<dyn SignalReader>) -> Result<()> {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                next = reader.recv() => next,
            };
            match next {
                None => {
                    info!(peer_id = %self.id(), "Signal stream closed by client");
                    return Ok(());
                }
                Some(Err(e)) => {
                    warn!(peer_id = %self.id(), error = %e, "Signal stream failed");
                    return Err(e);
                }
                Some(Ok(signal)) => self.route(signal).await,
            }
        }
    }

    async fn route(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::Sdp(sdp) => {
                debug!(peer_id = %self.id(), pc = sdp.pc.as_str(), sdp_type = ?sdp.sdp_type, "Received SDP");
                match self.negotiator(sdp.pc) {
                    Some(role) => {
                        role.enqueue_sdp(sdp);
                    }
                    None => {
                        warn!(peer_id = %self.id(), "Dropping SDP without connection type");
                    }
                }
            }
            Signal::Ice(ice) => match self.negotiator(ice.pc) {
                Some(role) => {
                    role.enqueue_ice(ice);
                }
                None => {
                    warn!(peer_id = %self.id(), "Dropping ICE candidate without connection type");
                }
            },
            Signal::Action(action) => {
                if let Err(e) = self.handle_action(action.action_type).await {
                    warn!(peer_id = %self.id(), action = ?action.action_type, error = %e, "Action failed");
                }
            }
            Signal::Event(event) => {
                debug!(peer_id = %self.id(), event = ?event.event_type, "Ignoring event sent by client");
            }
        }
    }

    /// Leave the room and release both connections.
    ///
    /// If the room is live the remaining members are told this peer left.
    /// Both connections are closed even if the first close fails; the first
    /// error is returned. Later calls do nothing.
    pub async fn disconnect(&self) -> Result<()> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let room = self.room.lock().take();
        if let Some(room) = room {
            if room.remove_peer(self.id()).is_some() && room.is_live() {
                room.broadcast(Some(self.id()), &self.event(EventType::LeaveEvent));
            }
        }

        let publisher = self.publisher.close().await;
        if let Err(e) = &publisher {
            warn!(peer_id = %self.id(), error = %e, "Failed to close publisher");
        }
        let subscriber = self.subscriber.close().await;
        if let Err(e) = &subscriber {
            warn!(peer_id = %self.id(), error = %e, "Failed to close subscriber");
        }

        self.cancel.cancel();
        self.send_queue.close();
        self.events.close();
        info!(peer_id = %self.id(), room_id = %self.room_id(), "Peer disconnected");

        publisher.and(subscriber)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", self.id())
            .field("room_id", self.room_id())
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}
