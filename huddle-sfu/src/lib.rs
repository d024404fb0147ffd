//! Huddle SFU (Selective Forwarding Unit)
//!
//! Media-plane engine for group calls. Every participant sends one uplink
//! audio/video stream; the SFU relays it, untouched, to every other member
//! of the room over a downlink connection with a fixed pool of slots.
//!
//! ## Architecture
//!
//! - **`Hub`**: Registry of rooms, shared ICE configuration
//! - **`Room`**: Members, lobby/live lifecycle, event broadcast, speaker detection
//! - **`Peer`**: One participant's session: signal routing, actions, events
//! - **`Publisher`**: Uplink connection; fans received tracks out to subscribers
//! - **`Subscriber`**: Downlink connection; binds remote participants to slots
//! - **`Connection`**: Offer/answer, ICE buffering and debounced renegotiation
//! - **`Detector`**: Active-speaker election from RTP audio levels
//!
//! ## Features
//!
//! - Bounded per-subscriber relay fan-out with FIFO promotion of waiting peers
//! - Keyframe requests relayed from subscribers, rate limited per publisher
//! - Non-blocking mailboxes with configurable overflow policy
//! - Transport-agnostic signaling through [`SignalReader`] / [`SignalWriter`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{channel_stream, Hub, Peer, PeerMetadata, Role, SfuConfig};
//!
//! let hub = Hub::new(SfuConfig::default());
//! hub.spawn_janitor(Duration::from_secs(60));
//!
//! let metadata = PeerMetadata::new("Ada", "peer-1", "standup", Role::Host);
//! let (stream, client) = channel_stream(metadata, 64);
//! let peer = Peer::new(Arc::clone(&hub), stream).await?;
//! tokio::spawn(async move { peer.connect().await });
//! ```

mod config;
mod error;
mod hub;
mod mailbox;
mod peer;
mod room;
pub mod rtc;
mod signal;
mod stream;
mod types;

pub use config::{QueueConfig, SfuConfig};
pub use error::{Error, Result};
pub use hub::{Hub, HubStats};
pub use mailbox::{Mailbox, OverflowPolicy, PushOutcome};
pub use peer::Peer;
pub use room::Room;
pub use rtc::{Connection, Detector, Publisher, SubscribeOutcome, Subscriber};
pub use signal::{
    Action, ActionType, Event, EventType, IceMessage, PcType, SdpMessage, SdpType, Signal,
};
pub use stream::{
    channel_stream, ChannelReader, ChannelWriter, ClientHandle, PeerMetadata, SignalReader,
    SignalStream, SignalWriter,
};
pub use types::{PeerId, Role, RoomId};
