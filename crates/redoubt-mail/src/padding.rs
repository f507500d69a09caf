//! Minimum-size padding policies.
//!
//! An observer of ciphertext lengths can correlate mail within a topic to
//! message sizes. Padding the sealed body to a policy-chosen minimum blunts
//! that: all mail below the target encrypts to the same length.
//!
//! The padding itself is random fill inside the AEAD-sealed plaintext, so
//! it is invisible to the recipient after decryption and indistinguishable
//! from content to anyone without the key.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::limits::MOVING_AVERAGE_WINDOW;

/// Policy deciding the minimum encrypted size of outgoing mail.
///
/// Cloning a `MovingAverage` policy shares its state: a single policy
/// instance is meant to be shared across all post offices of one enclave so
/// ciphertext lengths converge across topics and destinations.
#[derive(Clone, Debug, Default)]
pub enum SizePolicy {
    /// No padding beyond the structural minimum.
    #[default]
    None,
    /// Pad every mail so the encrypted blob is at least this many bytes.
    Fixed(usize),
    /// Pad to a moving average of recently observed body sizes.
    MovingAverage(Arc<MovingAverageSizePolicy>),
}

impl SizePolicy {
    /// Create a shared moving-average policy.
    pub fn moving_average() -> Self {
        Self::MovingAverage(Arc::new(MovingAverageSizePolicy::new()))
    }

    /// The minimum encrypted-blob size this policy currently demands.
    pub fn min_size(&self) -> usize {
        match self {
            SizePolicy::None => 0,
            SizePolicy::Fixed(min) => *min,
            SizePolicy::MovingAverage(avg) => avg.target(),
        }
    }

    /// Record the size of a body that was just encrypted.
    ///
    /// Only the moving-average policy keeps state; the others ignore this.
    pub fn observe(&self, body_len: usize) {
        if let SizePolicy::MovingAverage(avg) = self {
            avg.observe(body_len);
        }
    }
}

/// Moving average over the last [`MOVING_AVERAGE_WINDOW`] body sizes.
#[derive(Debug, Default)]
pub struct MovingAverageSizePolicy {
    state: Mutex<AverageState>,
}

#[derive(Debug, Default)]
struct AverageState {
    window: VecDeque<usize>,
    sum: usize,
}

impl MovingAverageSizePolicy {
    /// Create an empty moving average.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current padding target: the average of observed sizes, or 0 when
    /// nothing has been observed yet.
    pub fn target(&self) -> usize {
        let state = self.state.lock().expect("size policy lock poisoned");
        if state.window.is_empty() {
            0
        } else {
            state.sum / state.window.len()
        }
    }

    /// Record one body size, evicting the oldest once the window is full.
    pub fn observe(&self, body_len: usize) {
        let mut state = self.state.lock().expect("size policy lock poisoned");
        state.window.push_back(body_len);
        state.sum += body_len;
        if state.window.len() > MOVING_AVERAGE_WINDOW {
            if let Some(evicted) = state.window.pop_front() {
                state.sum -= evicted;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_policy() {
        let policy = SizePolicy::None;
        assert_eq!(policy.min_size(), 0);
        policy.observe(4096);
        assert_eq!(policy.min_size(), 0);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = SizePolicy::Fixed(10240);
        assert_eq!(policy.min_size(), 10240);
        policy.observe(1);
        assert_eq!(policy.min_size(), 10240);
    }

    #[test]
    fn test_moving_average_starts_at_zero() {
        let policy = SizePolicy::moving_average();
        assert_eq!(policy.min_size(), 0);
    }

    #[test]
    fn test_moving_average_tracks_observations() {
        let policy = SizePolicy::moving_average();
        policy.observe(100);
        policy.observe(300);
        assert_eq!(policy.min_size(), 200);
    }

    #[test]
    fn test_moving_average_window_eviction() {
        let avg = MovingAverageSizePolicy::new();
        for _ in 0..MOVING_AVERAGE_WINDOW {
            avg.observe(1000);
        }
        assert_eq!(avg.target(), 1000);

        // Push the window full of small sizes; old large ones must age out
        for _ in 0..MOVING_AVERAGE_WINDOW {
            avg.observe(10);
        }
        assert_eq!(avg.target(), 10);
    }

    #[test]
    fn test_cloned_policy_shares_state() {
        let policy = SizePolicy::moving_average();
        let clone = policy.clone();

        policy.observe(500);
        assert_eq!(clone.min_size(), 500);
    }
}
