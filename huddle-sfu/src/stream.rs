//! Transport seam between the SFU core and whatever carries signals
//!
//! The outer server owns the actual wire (a WebSocket, an RPC stream) and
//! hands each participant's duplex stream to a [`crate::Peer`] as a
//! [`SignalStream`]: the identity metadata that arrived with the stream plus
//! independent read and write halves.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::types::{PeerId, Role, RoomId};

/// Inbound half of a signal stream
#[async_trait]
pub trait SignalReader: Send {
    /// Next message from the client.
    ///
    /// `None` means the stream ended cleanly.
    async fn recv(&mut self) -> Option<Result<Signal>>;
}

/// Outbound half of a signal stream
#[async_trait]
pub trait SignalWriter: Send {
    async fn send(&mut self, signal: Signal) -> Result<()>;
}

/// Participant identity delivered with stream establishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMetadata {
    pub name: String,
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub role: Role,
}

impl PeerMetadata {
    pub const NAME_KEY: &'static str = "name";
    pub const PEER_ID_KEY: &'static str = "peer-id";
    pub const ROOM_ID_KEY: &'static str = "room-id";
    pub const ROLE_KEY: &'static str = "role";

    pub fn new(
        name: impl Into<String>,
        peer_id: impl Into<PeerId>,
        room_id: impl Into<RoomId>,
        role: Role,
    ) -> Self {
        Self {
            name: name.into(),
            peer_id: peer_id.into(),
            room_id: room_id.into(),
            role,
        }
    }

    /// Build from key/value pairs such as request headers or query params.
    ///
    /// `peer-id` and `room-id` are required; `name` defaults to empty and
    /// `role` to guest.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut name = None;
        let mut peer_id = None;
        let mut room_id = None;
        let mut role = None;

        for (key, value) in pairs {
            match key {
                Self::NAME_KEY => name = Some(value),
                Self::PEER_ID_KEY => peer_id = Some(value),
                Self::ROOM_ID_KEY => room_id = Some(value),
                Self::ROLE_KEY => role = Some(value),
                _ => {}
            }
        }

        let peer_id = peer_id
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingMetadata(Self::PEER_ID_KEY))?;
        let room_id = room_id
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingMetadata(Self::ROOM_ID_KEY))?;
        let role = match role.filter(|v| !v.is_empty()) {
            Some(role) => role.parse()?,
            None => Role::default(),
        };

        Ok(Self::new(name.unwrap_or_default(), peer_id, room_id, role))
    }
}

/// A participant's signal stream as handed to the SFU
pub struct SignalStream {
    pub metadata: PeerMetadata,
    pub reader: Box<dyn SignalReader>,
    pub writer: Box<dyn SignalWriter>,
}

impl SignalStream {
    pub fn new(
        metadata: PeerMetadata,
        reader: impl SignalReader + 'static,
        writer: impl SignalWriter + 'static,
    ) -> Self {
        Self {
            metadata,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// In-process reader backed by an mpsc channel
pub struct ChannelReader {
    rx: mpsc::Receiver<Signal>,
}

#[async_trait]
impl SignalReader for ChannelReader {
    async fn recv(&mut self) -> Option<Result<Signal>> {
        self.rx.recv().await.map(Ok)
    }
}

/// In-process writer backed by an mpsc channel
pub struct ChannelWriter {
    tx: mpsc::Sender<Signal>,
}

#[async_trait]
impl SignalWriter for ChannelWriter {
    async fn send(&mut self, signal: Signal) -> Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| Error::Transport("client side of channel stream dropped".to_string()))
    }
}

/// Client end of an in-process signal stream
pub struct ClientHandle {
    tx: mpsc::Sender<Signal>,
    rx: mpsc::Receiver<Signal>,
}

impl ClientHandle {
    /// Deliver a message to the SFU side
    pub async fn send(&self, signal: Signal) -> Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| Error::Transport("server side of channel stream dropped".to_string()))
    }

    /// Next message written by the SFU side
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    /// Split into the sending and receiving channel ends
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Sender<Signal>, mpsc::Receiver<Signal>) {
        (self.tx, self.rx)
    }
}

/// Create an in-process signal stream.
///
/// Dropping the [`ClientHandle`] (or its sender) ends the server side's
/// inbound stream, which the SFU treats as the participant disconnecting.
#[must_use]
pub fn channel_stream(metadata: PeerMetadata, capacity: usize) -> (SignalStream, ClientHandle) {
    let (to_server, from_client) = mpsc::channel(capacity.max(1));
    let (to_client, from_server) = mpsc::channel(capacity.max(1));

    let stream = SignalStream::new(
        metadata,
        ChannelReader { rx: from_client },
        ChannelWriter { tx: to_client },
    );
    let client = ClientHandle {
        tx: to_server,
        rx: from_server,
    };
    (stream, client)
}
