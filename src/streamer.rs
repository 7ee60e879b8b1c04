//! Outbound audio streaming
//!
//! Runs on the capture thread: every captured block is encoded and offered to
//! the session without waiting. Frames the session cannot take right now are
//! dropped and counted.

use crate::error::{LiveError, Result};
use crate::frame::{encode_frame, AudioFrame, WireFrame};
use crate::recorder::SessionRecorder;
use crate::session::DuplexSession;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Non-blocking destination for encoded frames.
pub trait FrameSink: Send + Sync {
    fn try_send_frame(&self, frame: WireFrame) -> Result<()>;
}

impl FrameSink for DuplexSession {
    fn try_send_frame(&self, frame: WireFrame) -> Result<()> {
        self.send(frame)
    }
}

/// Snapshot of streamer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub sent: u64,
    pub dropped: u64,
}

pub struct OutboundStreamer<S: FrameSink> {
    sink: S,
    sample_rate: u32,
    sent: AtomicU64,
    dropped: AtomicU64,
    recorder: Option<Arc<SessionRecorder>>,
}

impl<S: FrameSink> OutboundStreamer<S> {
    pub fn new(sink: S, sample_rate: u32, recorder: Option<Arc<SessionRecorder>>) -> Self {
        Self {
            sink,
            sample_rate,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            recorder,
        }
    }

    /// Encode and forward one captured block. Never blocks.
    pub fn push(&self, block: &[f32]) {
        if let Some(recorder) = &self.recorder {
            recorder.record_input(block);
        }

        let frame = encode_frame(AudioFrame {
            samples: block,
            sample_rate: self.sample_rate,
        });
        match self.sink.try_send_frame(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(LiveError::SendDropped) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Dropped outbound frame ({} so far)", dropped);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send audio frame: {}", e);
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "Outbound audio: {} frames sent, {} dropped",
            stats.sent, stats.dropped
        );
    }
}
