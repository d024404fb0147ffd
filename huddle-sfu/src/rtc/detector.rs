//! Active-speaker detection from RTP audio levels
//!
//! Audio levels follow RFC 6464: 0 is the loudest, 127 is silence. Each
//! evaluation tick averages the samples every participant sent since the
//! previous tick and picks the lowest mean. The incumbent keeps the floor
//! unless a challenger's mean is lower by more than the hysteresis margin.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::PeerId;

/// Level assigned to a participant with no samples in a tick
pub const SILENCE_LEVEL: u8 = 127;

#[derive(Debug, Default)]
struct Accumulator {
    sum: u64,
    count: u64,
}

impl Accumulator {
    fn mean(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum / self.count)
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    levels: HashMap<PeerId, Accumulator>,
    current: Option<PeerId>,
}

/// Per-room active-speaker detector
pub struct Detector {
    state: Mutex<DetectorState>,
    margin: u64,
    winner: watch::Sender<Option<PeerId>>,
    reevaluate: Notify,
}

impl Detector {
    #[must_use]
    pub fn new(margin: u8) -> Self {
        let (winner, _) = watch::channel(None);
        Self {
            state: Mutex::new(DetectorState::default()),
            margin: u64::from(margin),
            winner,
            reevaluate: Notify::new(),
        }
    }

    /// Record one audio-level sample for a participant
    pub fn sample(&self, peer_id: &PeerId, level: u8) {
        let level = level.min(SILENCE_LEVEL);
        let mut state = self.state.lock();
        let acc = state.levels.entry(peer_id.clone()).or_default();
        acc.sum += u64::from(level);
        acc.count += 1;

        if state.current.is_none() {
            state.current = Some(peer_id.clone());
            drop(state);
            debug!(peer_id = %peer_id, "Provisional active speaker");
            self.winner.send_replace(Some(peer_id.clone()));
        }
    }

    /// Forget a departing participant
    pub fn remove(&self, peer_id: &PeerId) {
        let was_speaker = {
            let mut state = self.state.lock();
            state.levels.remove(peer_id);
            if state.current.as_ref() == Some(peer_id) {
                state.current = None;
                true
            } else {
                false
            }
        };

        if was_speaker {
            debug!(peer_id = %peer_id, "Active speaker left, re-evaluating");
            self.winner.send_replace(None);
            self.reevaluate.notify_one();
        }
    }

    /// Run one evaluation over the samples gathered since the last one and
    /// reset the accumulators.
    pub fn evaluate(&self) -> Option<PeerId> {
        let (winner, changed) = {
            let mut state = self.state.lock();

            let mut best: Option<(&PeerId, u64)> = None;
            for (peer_id, acc) in &state.levels {
                if let Some(mean) = acc.mean() {
                    if best.map_or(true, |(_, best_mean)| mean < best_mean) {
                        best = Some((peer_id, mean));
                    }
                }
            }
            let best = best.map(|(peer_id, mean)| (peer_id.clone(), mean));

            let incumbent_mean = state
                .current
                .as_ref()
                .and_then(|current| state.levels.get(current))
                .and_then(Accumulator::mean)
                .unwrap_or(u64::from(SILENCE_LEVEL));

            let mut changed = false;
            if let Some((candidate, mean)) = best {
                let should_switch = match &state.current {
                    None => true,
                    Some(current) => {
                        *current != candidate && mean + self.margin < incumbent_mean
                    }
                };
                if should_switch {
                    state.current = Some(candidate);
                    changed = true;
                }
            }

            for acc in state.levels.values_mut() {
                *acc = Accumulator::default();
            }

            (state.current.clone(), changed)
        };

        if changed {
            if let Some(speaker) = &winner {
                info!(peer_id = %speaker, "Active speaker changed");
            }
        }
        self.winner.send_replace(winner.clone());
        winner
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<PeerId> {
        self.state.lock().current.clone()
    }

    /// Latest winner; unread updates are overwritten by newer ones
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<PeerId>> {
        self.winner.subscribe()
    }

    /// Evaluate every `interval` and whenever the speaker leaves, until
    /// `cancel` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        detector.evaluate();
                    }
                    () = detector.reevaluate.notified() => {
                        detector.evaluate();
                    }
                }
            }
            debug!("Detector loop stopped");
        })
    }
}
