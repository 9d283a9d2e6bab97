//! # Pending Audio Queue & Commit Tracking
//!
//! Per-call buffering between the telephony audio source and the speech
//! service socket.
//!
//! ## Two pieces of state:
//! - **PendingAudioQueue**: frames captured while the remote session
//!   handshake is still in flight. Bounded; overflow drops the incoming
//!   frame with a warning so the telephony side is never blocked.
//! - **CommitTracker**: counts appends since the last commit and guards
//!   against overlapping commit requests (at most one in flight per call).
//!
//! Both are owned exclusively by one call's session task; no locking here.

use std::collections::VecDeque;
use tracing::warn;

/// Limits for the pending queue and commit batching.
#[derive(Debug, Clone)]
pub struct AudioQueueConfig {
    /// Maximum frames held while the session handshake is incomplete.
    pub max_pending_chunks: usize,

    /// Appends since the last commit that trigger a new commit.
    pub commit_batch_size: u32,
}

impl Default for AudioQueueConfig {
    fn default() -> Self {
        Self {
            max_pending_chunks: 50,
            commit_batch_size: 10,
        }
    }
}

/// Bounded queue of transcoded frames awaiting session readiness.
///
/// ## Invariant:
/// Every entry has already passed outbound transcoding (base64 PCM16 @ 24 kHz)
/// before enqueue. Length never exceeds `max_pending_chunks`.
#[derive(Debug)]
pub struct PendingAudioQueue {
    frames: VecDeque<String>,
    max_pending_chunks: usize,
    dropped: u64,
}

impl PendingAudioQueue {
    pub fn new(max_pending_chunks: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_pending_chunks),
            max_pending_chunks,
            dropped: 0,
        }
    }

    /// Enqueue a transcoded frame. Returns false if the queue was full and
    /// the frame was dropped.
    pub fn push(&mut self, frame: String) -> bool {
        if self.frames.len() >= self.max_pending_chunks {
            self.dropped += 1;
            warn!(
                max = self.max_pending_chunks,
                dropped_total = self.dropped,
                "pending audio queue full, dropping frame"
            );
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Drain all queued frames in arrival order.
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frames rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard everything (session teardown).
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Tracks appends since the last commit and the single-in-flight guard.
#[derive(Debug, Default)]
pub struct CommitTracker {
    /// Appends sent since the last acknowledged commit.
    sent_since_commit: u32,

    /// True while a commit awaits `input_audio_buffer.committed`.
    pending_commit: bool,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sent append; returns the running count.
    pub fn record_append(&mut self) -> u32 {
        self.sent_since_commit += 1;
        self.sent_since_commit
    }

    pub fn sent_since_commit(&self) -> u32 {
        self.sent_since_commit
    }

    /// Whether a commit should be requested: batch reached and none in flight.
    pub fn batch_ready(&self, batch_size: u32) -> bool {
        !self.pending_commit && self.sent_since_commit >= batch_size
    }

    /// Try to take the in-flight slot. Returns false when a commit is
    /// already outstanding or nothing has been appended.
    pub fn begin_commit(&mut self) -> bool {
        if self.pending_commit || self.sent_since_commit == 0 {
            return false;
        }
        self.pending_commit = true;
        true
    }

    /// Commit acknowledged: clear the guard and reset the counter.
    pub fn ack_commit(&mut self) {
        self.pending_commit = false;
        self.sent_since_commit = 0;
    }

    /// Clear a stuck guard without resetting the counter (ack never arrived).
    pub fn abort_commit(&mut self) {
        self.pending_commit = false;
    }

    pub fn commit_in_flight(&self) -> bool {
        self.pending_commit
    }

    /// Reset everything (reconnect discards server-side buffer state).
    pub fn reset(&mut self) {
        self.sent_since_commit = 0;
        self.pending_commit = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: usize) -> String {
        format!("frame-{i}")
    }

    #[test]
    fn test_queue_never_exceeds_bound() {
        let mut q = PendingAudioQueue::new(50);
        for i in 0..200 {
            q.push(frame(i));
            assert!(q.len() <= 50);
        }
        assert_eq!(q.len(), 50);
        assert_eq!(q.dropped(), 150);
    }

    #[test]
    fn test_queue_drops_newest_on_overflow() {
        let mut q = PendingAudioQueue::new(2);
        assert!(q.push(frame(0)));
        assert!(q.push(frame(1)));
        assert!(!q.push(frame(2)));
        assert_eq!(q.drain(), vec![frame(0), frame(1)]);
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut q = PendingAudioQueue::new(10);
        for i in 0..5 {
            q.push(frame(i));
        }
        let drained = q.drain();
        assert_eq!(drained, (0..5).map(frame).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn test_single_commit_in_flight() {
        let mut t = CommitTracker::new();
        t.record_append();
        assert!(t.begin_commit());
        // Second commit refused until the ack clears the guard.
        t.record_append();
        assert!(!t.begin_commit());
        t.ack_commit();
        assert_eq!(t.sent_since_commit(), 0);
        t.record_append();
        assert!(t.begin_commit());
    }

    #[test]
    fn test_commit_requires_appended_audio() {
        let mut t = CommitTracker::new();
        assert!(!t.begin_commit());
    }

    #[test]
    fn test_batch_ready_threshold() {
        let mut t = CommitTracker::new();
        for _ in 0..9 {
            t.record_append();
        }
        assert!(!t.batch_ready(10));
        t.record_append();
        assert!(t.batch_ready(10));
        assert!(t.begin_commit());
        // In flight: batch no longer ready even though the counter grows.
        t.record_append();
        assert!(!t.batch_ready(10));
    }

    #[test]
    fn test_abort_keeps_counter() {
        let mut t = CommitTracker::new();
        for _ in 0..3 {
            t.record_append();
        }
        assert!(t.begin_commit());
        t.abort_commit();
        assert!(!t.commit_in_flight());
        assert_eq!(t.sent_since_commit(), 3);
    }
}
