//! Signaling state machine around one `RTCPeerConnection`

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{build_api, CandidateBuffer, Debouncer};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::mailbox::{Mailbox, PushOutcome};
use crate::signal::{IceMessage, PcType, SdpMessage, Signal};
use crate::types::PeerId;

/// One peer connection plus the offer/answer bookkeeping around it.
///
/// Local SDP and ICE candidates are pushed into the owning peer's outbound
/// mailbox tagged with this connection's [`PcType`].
pub struct Connection {
    pc: Arc<RTCPeerConnection>,
    pc_type: PcType,
    peer_id: PeerId,
    outbound: Mailbox<Signal>,
    candidates: Mutex<CandidateBuffer>,
    debouncer: Debouncer,
    closed: AtomicBool,
}

impl Connection {
    /// Create the transport and wire its callbacks.
    ///
    /// `lifetime` is cancelled if the transport fails.
    pub async fn new(
        peer_id: PeerId,
        pc_type: PcType,
        config: &SfuConfig,
        outbound: Mailbox<Signal>,
        lifetime: CancellationToken,
    ) -> Result<Arc<Self>> {
        let api = build_api()?;
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: config.ice_servers(),
                ..Default::default()
            })
            .await?;

        let conn = Arc::new(Self {
            pc: Arc::new(pc),
            pc_type,
            peer_id,
            outbound,
            candidates: Mutex::new(CandidateBuffer::default()),
            debouncer: Debouncer::new(config.renegotiation_debounce()),
            closed: AtomicBool::new(false),
        });
        conn.wire_callbacks(lifetime);
        Ok(conn)
    }

    fn wire_callbacks(self: &Arc<Self>, lifetime: CancellationToken) {
        let outbound = self.outbound.clone();
        let pc_type = self.pc_type;
        let peer_id = self.peer_id.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let ice = IceMessage::from_candidate_init(pc_type, init);
                        if !outbound.push(Signal::Ice(ice)).is_queued() {
                            debug!(peer_id = %peer_id, pc = pc_type.as_str(), "Dropped local ICE candidate");
                        }
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, pc = pc_type.as_str(), error = %e, "Failed to serialize local ICE candidate");
                    }
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        self.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    conn.request_renegotiation();
                }
            })
        }));

        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let lifetime = lifetime.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!(peer_id = %peer_id, pc = pc_type.as_str(), state = %state, "Peer connection state changed");
                    if state == RTCPeerConnectionState::Failed {
                        error!(peer_id = %peer_id, pc = pc_type.as_str(), "Peer connection failed");
                        lifetime.cancel();
                    }
                })
            }));
    }

    #[must_use]
    pub const fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    #[must_use]
    pub const fn pc_type(&self) -> PcType {
        self.pc_type
    }

    #[must_use]
    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    /// Create an offer, apply it locally and send it to the client
    pub async fn send_offer(&self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("local description missing after offer".to_string()))?;

        debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Sending offer");
        self.emit(Signal::Sdp(SdpMessage::offer(self.pc_type, local.sdp)));
        Ok(())
    }

    /// Apply a remote offer and answer it
    pub async fn handle_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("local description missing after answer".to_string()))?;

        debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Sending answer");
        self.emit(Signal::Sdp(SdpMessage::answer(self.pc_type, local.sdp)));
        Ok(())
    }

    /// Apply a remote answer to our outstanding offer
    pub async fn handle_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        self.flush_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or hold it until a remote description exists
    pub async fn handle_remote_ice(&self, ice: &IceMessage) -> Result<()> {
        let ready = self.candidates.lock().admit(ice.to_candidate_init());
        match ready {
            Some(candidate) => {
                self.pc.add_ice_candidate(candidate).await?;
            }
            None => {
                debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Buffered remote ICE candidate");
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self) {
        let pending = self.candidates.lock().mark_ready();
        if pending.is_empty() {
            return;
        }
        debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), count = pending.len(), "Flushing buffered ICE candidates");
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    /// Ask for a renegotiation offer once requests stop arriving
    pub fn request_renegotiation(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.debouncer.schedule(move || async move {
            if let Some(conn) = weak.upgrade() {
                conn.renegotiate().await;
            }
        });
    }

    async fn renegotiate(&self) {
        if self.is_closed() {
            return;
        }
        let state = self.pc.signaling_state();
        if state != RTCSignalingState::Stable {
            debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), state = %state, "Skipping renegotiation, signaling not stable");
            return;
        }
        if let Err(e) = self.send_offer().await {
            warn!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), error = %e, "Renegotiation offer failed");
        }
    }

    fn emit(&self, signal: Signal) {
        match self.outbound.push(signal) {
            PushOutcome::Queued => {}
            PushOutcome::Evicted => {
                debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Send queue full, evicted oldest signal");
            }
            PushOutcome::Dropped => {
                warn!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Send queue full, dropped SDP");
            }
            PushOutcome::Closed => {
                debug!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Send queue closed, dropped SDP");
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn buffered_candidates(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Stop pending work and close the transport. A second call is an error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("connection"));
        }
        self.debouncer.cancel();
        self.candidates.lock().clear();
        self.pc.close().await?;
        info!(peer_id = %self.peer_id, pc = self.pc_type.as_str(), "Connection closed");
        Ok(())
    }
}
