//! Turn latency tracking
//!
//! A turn starts when the server's VAD reports the end of user speech and
//! completes at the first assistant delta that follows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MAX_COMPLETED: usize = 100;

/// Latency tracking for turns
#[derive(Debug, Default)]
pub struct TurnTracker {
    next_turn_id: u64,
    pending_turns: VecDeque<(u64, Instant)>,
    latencies: VecDeque<Duration>,
    completed: u64,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_turn(&mut self) -> u64 {
        self.start_turn_at(Instant::now())
    }

    pub fn start_turn_at(&mut self, at: Instant) -> u64 {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.pending_turns.push_back((turn_id, at));
        debug!("Turn {} started, {} pending", turn_id, self.pending_turns.len());
        turn_id
    }

    /// Record the first response for the oldest pending turn. No-op when
    /// nothing is pending (e.g. later deltas of the same response).
    pub fn first_response(&mut self) -> Option<Duration> {
        self.first_response_at(Instant::now())
    }

    pub fn first_response_at(&mut self, at: Instant) -> Option<Duration> {
        let (turn_id, started) = self.pending_turns.pop_front()?;
        let latency = at.saturating_duration_since(started);

        self.latencies.push_back(latency);
        if self.latencies.len() > MAX_COMPLETED {
            self.latencies.pop_front();
        }
        self.completed += 1;

        info!(
            "Turn {} latency {}ms (avg {}ms over {} turns)",
            turn_id,
            latency.as_millis(),
            self.average_latency().unwrap_or_default().as_millis(),
            self.latencies.len()
        );
        Some(latency)
    }

    pub fn pending_turns(&self) -> usize {
        self.pending_turns.len()
    }

    pub fn completed_turns(&self) -> u64 {
        self.completed
    }

    /// Mean over the most recent completed turns.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            None
        } else {
            let sum: Duration = self.latencies.iter().sum();
            Some(sum / self.latencies.len() as u32)
        }
    }

    /// Forget turns still waiting for a response (used on teardown).
    pub fn abandon_pending(&mut self) {
        self.pending_turns.clear();
    }

    pub fn summary(&self) -> String {
        match (
            self.latencies.iter().min(),
            self.latencies.iter().max(),
            self.average_latency(),
        ) {
            (Some(min), Some(max), Some(avg)) => format!(
                "{} turns, {} pending, latency min {}ms / max {}ms / avg {}ms",
                self.completed,
                self.pending_turns.len(),
                min.as_millis(),
                max.as_millis(),
                avg.as_millis()
            ),
            _ => format!("{} turns, {} pending", self.completed, self.pending_turns.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_recorded_once_per_turn() {
        let mut tracker = TurnTracker::new();
        let t0 = Instant::now();
        tracker.start_turn_at(t0);

        let latency = tracker.first_response_at(t0 + Duration::from_millis(250));
        assert_eq!(latency, Some(Duration::from_millis(250)));
        // Later deltas of the same response do not count
        assert_eq!(tracker.first_response_at(t0 + Duration::from_millis(400)), None);

        assert_eq!(tracker.completed_turns(), 1);
        assert_eq!(tracker.pending_turns(), 0);
        assert_eq!(tracker.average_latency(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_average_and_summary() {
        let mut tracker = TurnTracker::new();
        let t0 = Instant::now();
        for ms in [100u64, 300] {
            tracker.start_turn_at(t0);
            tracker.first_response_at(t0 + Duration::from_millis(ms));
        }
        assert_eq!(tracker.average_latency(), Some(Duration::from_millis(200)));
        assert_eq!(
            tracker.summary(),
            "2 turns, 0 pending, latency min 100ms / max 300ms / avg 200ms"
        );
    }

    #[test]
    fn test_window_is_bounded() {
        let mut tracker = TurnTracker::new();
        let t0 = Instant::now();
        for _ in 0..(MAX_COMPLETED + 20) {
            tracker.start_turn_at(t0);
            tracker.first_response_at(t0 + Duration::from_millis(10));
        }
        assert_eq!(tracker.completed_turns(), (MAX_COMPLETED + 20) as u64);
        assert_eq!(tracker.average_latency(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_abandon_pending() {
        let mut tracker = TurnTracker::new();
        tracker.start_turn();
        tracker.start_turn();
        tracker.abandon_pending();
        assert_eq!(tracker.pending_turns(), 0);
        assert_eq!(tracker.first_response(), None);
        assert_eq!(tracker.summary(), "0 turns, 0 pending");
    }
}
