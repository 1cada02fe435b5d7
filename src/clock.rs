//! Clock synchronization with the room's reference peer
//!
//! NTP-style polling: every interval the local peer sends `t0`, the reference
//! answers with its own (already corrected) time `tr`, and the receive time
//! `t1` gives one offset sample `((tr - t0) + (tr - t1)) / 2`. Samples go
//! through a sliding window that drops values farther than one standard
//! deviation from the median.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClockSyncConfig;
use crate::mesh::{MeshMessage, PeerMesh};
use crate::signaling::PeerId;

/// Offset to add to local time to get room time, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ClockDelta(pub f64);

impl ClockDelta {
    pub fn as_millis(self) -> f64 {
        self.0
    }

    pub fn room_time(self, local_ms: i64) -> i64 {
        local_ms.saturating_add(self.0.round() as i64)
    }
}

/// Local wall clock in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One offset sample from a poll round trip. `None` when the timestamps are
/// too far apart to be real.
pub fn offset_sample(t0: i64, tr: i64, t1: i64) -> Option<i64> {
    let sum = tr.checked_sub(t0)?.checked_add(tr.checked_sub(t1)?)?;
    Some(sum / 2)
}

/// Polls sent to the reference and not answered yet
const OUTSTANDING_POLLS: usize = 32;

/// Sliding window of offset samples with median/standard deviation outlier
/// rejection.
#[derive(Debug, Clone)]
pub struct DeltaFilter {
    capacity: usize,
    samples: VecDeque<i64>,
}

impl DeltaFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Add a sample and return the new estimate.
    pub fn push(&mut self, sample: i64) -> Option<f64> {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.estimate()
    }

    /// Mean of the samples within one standard deviation of the median
    pub fn estimate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean = self.samples.iter().map(|&s| i128::from(s)).sum::<i128>() as f64 / n;
        let variance = self
            .samples
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let sd = variance.sqrt();

        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 1 {
            sorted[mid] as f64
        } else {
            (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
        };

        let (min, max) = (median - sd, median + sd);
        let kept: Vec<f64> = sorted
            .iter()
            .map(|&s| s as f64)
            .filter(|s| (min..=max).contains(s))
            .collect();
        if kept.is_empty() {
            return None;
        }
        Some(kept.iter().sum::<f64>() / kept.len() as f64)
    }
}

/// Lowest peer id in the room, or `None` when that is the local peer.
pub fn pick_reference(local: PeerId, peers: &[PeerId]) -> Option<PeerId> {
    peers.iter().copied().min().filter(|reference| *reference < local)
}

struct ClockState {
    running: bool,
    reference: Option<PeerId>,
    filter: DeltaFilter,
    outstanding: VecDeque<i64>,
    poller: Option<JoinHandle<()>>,
}

impl ClockState {
    fn record_poll(&mut self, t0: i64) {
        if self.outstanding.len() == OUTSTANDING_POLLS {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(t0);
    }

    /// Consume the poll an answer refers to.
    fn take_poll(&mut self, t0: i64) -> bool {
        match self.outstanding.iter().position(|&sent| sent == t0) {
            Some(index) => {
                self.outstanding.remove(index);
                true
            }
            None => false,
        }
    }
}

struct ClockInner {
    mesh: PeerMesh,
    config: ClockSyncConfig,
    state: Mutex<ClockState>,
    delta: watch::Sender<Option<ClockDelta>>,
}

impl ClockInner {
    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct ClockSync {
    inner: Arc<ClockInner>,
}

impl ClockSync {
    pub fn new(mesh: PeerMesh, config: ClockSyncConfig) -> Self {
        let (delta, _) = watch::channel(None);
        Self {
            inner: Arc::new(ClockInner {
                mesh,
                state: Mutex::new(ClockState {
                    running: false,
                    reference: None,
                    filter: DeltaFilter::new(config.window_len),
                    outstanding: VecDeque::new(),
                    poller: None,
                }),
                config,
                delta,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.inner.state()
    }

    pub fn delta(&self) -> Option<ClockDelta> {
        *self.inner.delta.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ClockDelta>> {
        self.inner.delta.subscribe()
    }

    pub fn reference(&self) -> Option<PeerId> {
        self.state().reference
    }

    /// Samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.state().filter.len()
    }

    /// Local time corrected by the current delta
    pub fn room_time_ms(&self) -> i64 {
        let now = now_ms();
        self.delta().map_or(now, |delta| delta.room_time(now))
    }

    pub fn start(&self) {
        self.state().running = true;
        self.select_reference();
    }

    pub fn stop(&self) {
        let mut state = self.state();
        state.running = false;
        state.reference = None;
        state.filter.clear();
        state.outstanding.clear();
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        self.inner.delta.send_replace(None);
        debug!("Clock synchronization stopped");
    }

    pub fn on_peer_connected(&self, _peer_id: PeerId) {
        self.select_reference();
    }

    pub fn on_peer_disconnected(&self, peer_id: PeerId) {
        if self.reference() == Some(peer_id) {
            info!("Clock reference {} left, selecting a new one", peer_id);
            self.select_reference();
        }
    }

    pub fn on_message(&self, from: PeerId, message: &MeshMessage) {
        match *message {
            MeshMessage::TimePoll { t0 } => {
                let answer = MeshMessage::TimeAnswer {
                    t0,
                    tr: self.room_time_ms(),
                };
                if let Err(e) = self.inner.mesh.send(from, &answer) {
                    warn!("Could not answer time poll from peer {}: {}", from, e);
                }
            }
            MeshMessage::TimeAnswer { t0, tr } => self.on_answer(from, t0, tr, now_ms()),
            MeshMessage::RegisterPlayer { .. } | MeshMessage::PlayerStateChanged { .. } => {}
        }
    }

    fn on_answer(&self, from: PeerId, t0: i64, tr: i64, t1: i64) {
        let mut state = self.state();
        if !state.running || state.reference != Some(from) {
            debug!("Ignoring time answer from peer {}", from);
            return;
        }
        if !state.take_poll(t0) {
            warn!("Time answer from peer {} for a poll never sent", from);
            return;
        }
        let Some(sample) = offset_sample(t0, tr, t1) else {
            warn!("Dropping out of range time answer from peer {} (tr {})", from, tr);
            return;
        };
        if let Some(estimate) = state.filter.push(sample) {
            self.inner.delta.send_replace(Some(ClockDelta(estimate)));
            debug!("Clock delta sample {} ms, estimate {:.1} ms", sample, estimate);
        }
    }

    /// (Re)start polling against the lowest peer id. A new reference starts
    /// from an empty window and a null delta.
    fn select_reference(&self) {
        let Some(local) = self.inner.mesh.local_peer_id() else {
            return;
        };
        let reference = pick_reference(local, &self.inner.mesh.connected_peers());

        let mut state = self.state();
        if !state.running || state.reference == reference {
            return;
        }
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        state.filter.clear();
        state.outstanding.clear();
        state.reference = reference;
        self.inner.delta.send_replace(None);

        match reference {
            Some(reference) => {
                info!("Synchronizing clock with peer {}", reference);
                state.poller = Some(tokio::spawn(poll_reference(
                    Arc::downgrade(&self.inner),
                    reference,
                    self.inner.config.poll_interval(),
                    self.inner.config.max_samples,
                )));
            }
            None => info!("Local peer {} is the clock reference", local),
        }
    }
}

async fn poll_reference(
    clock: Weak<ClockInner>,
    reference: PeerId,
    interval: Duration,
    max_samples: Option<u32>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut polls = 0u32;
    while max_samples.is_none_or(|max| polls < max) {
        ticker.tick().await;
        let Some(inner) = clock.upgrade() else {
            return;
        };
        let t0 = now_ms();
        inner.state().record_poll(t0);
        if let Err(e) = inner.mesh.send(reference, &MeshMessage::TimePoll { t0 }) {
            warn!("Time poll to peer {} failed: {}", reference, e);
        }
        polls += 1;
    }
    debug!("Sent {} time polls to peer {}", polls, reference);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filtered(samples: &[i64]) -> Option<f64> {
        let mut filter = DeltaFilter::new(samples.len());
        samples.iter().fold(None, |_, &s| filter.push(s))
    }

    #[test]
    fn outlier_is_excluded() {
        let estimate = filtered(&[100, 102, 101, 500, 99]).unwrap();
        assert_eq!(estimate, 100.5);
    }

    #[test]
    fn estimate_stays_within_kept_samples() {
        let windows: [&[i64]; 4] = [
            &[100, 102, 101, 500, 99],
            &[-20, 15, 3, 3, 8, 900, -700, 4, 5],
            &[7, 7, 7],
            &[10, 30],
        ];
        for window in windows {
            let estimate = filtered(window).unwrap();
            let min = *window.iter().min().unwrap() as f64;
            let max = *window.iter().max().unwrap() as f64;
            assert!(min <= estimate && estimate <= max, "{window:?} -> {estimate}");
        }
    }

    #[test]
    fn even_window_uses_middle_average() {
        // median 15, sd ~ 7.1: 5 and 25 fall outside
        assert_eq!(filtered(&[5, 14, 16, 25]), Some(15.0));
    }

    #[test]
    fn window_slides() {
        let mut filter = DeltaFilter::new(3);
        for s in [1000, 1000, 1000, 10, 10, 10] {
            filter.push(s);
        }
        assert_eq!(filter.len(), 3);
        assert_eq!(filter.estimate(), Some(10.0));
    }

    #[test]
    fn offset_sample_formula() {
        // Reference 50 ms ahead, 10 ms each way.
        assert_eq!(offset_sample(1_000, 1_060, 1_020), Some(50));
        assert_eq!(offset_sample(0, -3, 2), Some(-4));
    }

    #[test]
    fn out_of_range_timestamps_give_no_sample() {
        assert_eq!(offset_sample(i64::MIN + 1, i64::MAX, 0), None);
        assert_eq!(offset_sample(0, i64::MAX, -1), None);
        assert_eq!(offset_sample(0, i64::MIN, 1), None);
    }

    #[test]
    fn extreme_samples_do_not_overflow() {
        assert!(filtered(&[i64::MAX, i64::MAX - 1, i64::MAX]).is_some());
        assert!(filtered(&[i64::MIN, i64::MIN + 1]).is_some());
        assert_eq!(ClockDelta(f64::MAX).room_time(1_000), i64::MAX);
        assert_eq!(ClockDelta(-1e30).room_time(-5), i64::MIN);
    }

    #[test]
    fn answers_must_match_a_sent_poll() {
        let mut state = ClockState {
            running: true,
            reference: Some(PeerId(1)),
            filter: DeltaFilter::new(9),
            outstanding: VecDeque::new(),
            poller: None,
        };
        state.record_poll(10);
        state.record_poll(20);
        assert!(!state.take_poll(15));
        assert!(state.take_poll(20));
        assert!(!state.take_poll(20));
        assert!(state.take_poll(10));

        for t0 in 0..OUTSTANDING_POLLS as i64 + 5 {
            state.record_poll(t0);
        }
        assert_eq!(state.outstanding.len(), OUTSTANDING_POLLS);
        assert!(!state.take_poll(0));
        assert!(state.take_poll(OUTSTANDING_POLLS as i64 + 4));
    }

    #[test]
    fn lowest_peer_is_the_reference() {
        assert_eq!(pick_reference(PeerId(3), &[PeerId(2), PeerId(1)]), Some(PeerId(1)));
        assert_eq!(pick_reference(PeerId(1), &[PeerId(2), PeerId(3)]), None);
        assert_eq!(pick_reference(PeerId(2), &[]), None);
    }

    #[test]
    fn room_time_adds_the_delta() {
        assert_eq!(ClockDelta(49.6).room_time(1_000), 1_050);
        assert_eq!(ClockDelta(-10.0).room_time(1_000), 990);
    }
}
