//! Playback controller
//!
//! The single bit of truth for "assistant is speaking". Tracks a
//! monotonically increasing `played_until` timestamp used to attribute
//! interruptions, and discards chunks from cancelled syntheses by
//! generation check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use callweave_core::{AudioFrame, TtsChunk};

/// Per-session playback controller
pub struct PlaybackController {
    is_speaking: AtomicBool,
    /// Total audio handed to the bridge this response, ms
    played_until_ms: AtomicU64,
    /// Generation playback currently accepts
    accepted_generation: AtomicU64,
    /// Frames on their way to the bridge
    egress: mpsc::Sender<AudioFrame>,
}

impl PlaybackController {
    pub fn new(egress: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            is_speaking: AtomicBool::new(false),
            played_until_ms: AtomicU64::new(0),
            accepted_generation: AtomicU64::new(0),
            egress,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::Acquire)
    }

    pub fn played_until_ms(&self) -> u64 {
        self.played_until_ms.load(Ordering::Acquire)
    }

    /// Begin accepting chunks of `generation`; resets the position clock
    pub fn begin(&self, generation: u64) {
        self.accepted_generation.store(generation, Ordering::Release);
        self.played_until_ms.store(0, Ordering::Release);
    }

    /// Deliver one synthesized chunk to the bridge.
    ///
    /// Chunks from any other generation are discarded (out-of-order after
    /// cancellation). Returns whether the chunk was delivered.
    pub async fn push_chunk(&self, generation: u64, chunk: TtsChunk) -> bool {
        if self.accepted_generation.load(Ordering::Acquire) != generation {
            tracing::trace!(
                generation,
                seq = chunk.seq,
                "Discarding stale playback chunk"
            );
            return false;
        }

        let duration_ms = chunk.audio.duration_ms();
        if !chunk.audio.samples.is_empty() {
            self.is_speaking.store(true, Ordering::Release);
            if self.egress.send(chunk.audio).await.is_err() {
                // Bridge went away; nothing more to play
                self.is_speaking.store(false, Ordering::Release);
                return false;
            }
            self.played_until_ms.fetch_add(duration_ms, Ordering::AcqRel);
        }

        if chunk.is_final {
            self.is_speaking.store(false, Ordering::Release);
        }
        true
    }

    /// Atomic cancel: stop speaking, reject pending generations, and report
    /// how much audio had been played.
    pub fn cancel(&self) -> u64 {
        self.is_speaking.store(false, Ordering::Release);
        // Move to a generation no producer holds, discarding stragglers
        self.accepted_generation.fetch_add(1, Ordering::AcqRel);
        let played = self.played_until_ms.load(Ordering::Acquire);
        tracing::debug!(played_until_ms = played, "Playback cancelled");
        played
    }

    /// Mark the response finished without cancellation
    pub fn finish(&self) {
        self.is_speaking.store(false, Ordering::Release);
    }
}
