use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Holds remote ICE candidates until a remote description is applied
#[derive(Debug, Default)]
pub(crate) struct CandidateBuffer {
    pending: Vec<RTCIceCandidateInit>,
    remote_ready: bool,
}

impl CandidateBuffer {
    /// Returns the candidate back if it can be applied right away,
    /// otherwise keeps it in arrival order.
    pub(crate) fn admit(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Mark the remote description as applied and hand back everything
    /// buffered so far, oldest first.
    pub(crate) fn mark_ready(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_ready = true;
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
