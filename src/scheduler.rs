//! Gapless playback scheduling
//!
//! Inbound chunks arrive with network jitter but must play back to back. The
//! scheduler keeps one cursor on the output device's clock: each chunk starts
//! at `max(now, cursor)` and pushes the cursor to its own end.

use crate::audio::{AudioOutput, PlaybackUnit};
use crate::error::{LiveError, Result};
use crate::frame::{decode_payload, InboundPayload};
use crate::recorder::SessionRecorder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Where the next chunk may start on the device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackCursor {
    next: Duration,
}

impl PlaybackCursor {
    pub fn new(at: Duration) -> Self {
        Self { next: at }
    }

    /// Start time for a chunk arriving at `now`.
    pub fn start_for(&self, now: Duration) -> Duration {
        now.max(self.next)
    }

    /// Place a chunk of `duration` arriving at `now`; returns its start.
    pub fn place(&mut self, now: Duration, duration: Duration) -> Duration {
        let start = self.start_for(now);
        self.next = start + duration;
        start
    }

    pub fn reset(&mut self, at: Duration) {
        self.next = at;
    }

    pub fn position(&self) -> Duration {
        self.next
    }
}

/// Placement of one scheduled chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start: Duration,
    pub duration: Duration,
}

struct SpeakingInner {
    tx: watch::Sender<bool>,
    /// Bumped on every mark/clear; a timer only clears its own generation
    generation: AtomicU64,
    timeout: Duration,
}

/// "Model is speaking" flag that clears itself after a quiet period.
#[derive(Clone)]
pub struct SpeakingIndicator {
    inner: Arc<SpeakingInner>,
}

impl SpeakingIndicator {
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SpeakingInner {
                tx,
                generation: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Set the flag and re-arm the quiet timer.
    pub fn mark(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.tx.send_if_modified(|speaking| !std::mem::replace(speaking, true));

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for the speaking timer, flag stays set until cleared");
            return;
        };
        let inner = self.inner.clone();
        runtime.spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.tx.send_if_modified(|speaking| std::mem::replace(speaking, false));
            }
        });
    }

    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.tx.send_if_modified(|speaking| std::mem::replace(speaking, false));
    }
}

struct SchedulerState {
    cursor: PlaybackCursor,
    /// No chunk is accepted once set
    closed: bool,
    output_released: bool,
}

/// Places inbound audio on the output device without gaps or overlap.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    default_rate: u32,
    state: Mutex<SchedulerState>,
    speaking: SpeakingIndicator,
    recorder: Option<Arc<SessionRecorder>>,
}

impl PlaybackScheduler {
    /// The cursor starts at the output's current time.
    pub fn new(
        output: Arc<dyn AudioOutput>,
        default_rate: u32,
        speaking: SpeakingIndicator,
        recorder: Option<Arc<SessionRecorder>>,
    ) -> Self {
        let cursor = PlaybackCursor::new(output.now());
        Self {
            output,
            default_rate,
            state: Mutex::new(SchedulerState {
                cursor,
                closed: false,
                output_released: false,
            }),
            speaking,
            recorder,
        }
    }

    /// Decode one payload and hand it to the device right after whatever is
    /// already queued. A payload that fails to decode leaves the cursor alone.
    pub fn schedule(&self, payload: &InboundPayload) -> Result<ScheduledChunk> {
        let chunk = match decode_payload(payload, self.default_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Dropping inbound audio chunk: {}", e);
                return Err(e);
            }
        };

        let mut state = self.state.lock().map_err(|_| LiveError::SessionClosed)?;
        if state.closed {
            return Err(LiveError::SessionClosed);
        }

        if let Some(recorder) = &self.recorder {
            recorder.record_output(&chunk);
        }

        let duration = chunk.duration();
        let start = state.cursor.start_for(self.output.now());
        self.output.play_at(
            PlaybackUnit {
                samples: chunk.samples,
                sample_rate: chunk.sample_rate,
            },
            start,
        )?;
        state.cursor.place(start, duration);
        drop(state);

        trace!("Scheduled {:?} of audio at {:?}", duration, start);
        self.speaking.mark();
        Ok(ScheduledChunk { start, duration })
    }

    /// Drop queued audio and restart the timeline at the current time.
    pub fn interrupt(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed {
                return;
            }
            self.output.halt();
            state.cursor.reset(self.output.now());
        }
        self.speaking.clear();
        debug!("Playback interrupted");
    }

    /// Stop accepting chunks without touching the device. Returns once no
    /// `schedule` call can reach the output anymore.
    pub fn seal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.speaking.clear();
    }

    /// Stop accepting chunks and release the output device. Idempotent.
    pub fn close(&self) {
        let first = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                !std::mem::replace(&mut state.output_released, true)
            }
            Err(_) => false,
        };
        if first {
            self.output.close();
            self.speaking.clear();
            debug!("Playback scheduler closed");
        }
    }

    pub fn cursor(&self) -> Duration {
        self.state
            .lock()
            .map(|state| state.cursor.position())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, AudioFrame};
    use crate::testing::FakeOutput;
    use rand::Rng;

    fn payload(samples: usize, rate: u32) -> InboundPayload {
        let wire = encode_frame(AudioFrame {
            samples: &vec![0.1; samples],
            sample_rate: rate,
        });
        InboundPayload {
            mime_type: Some(wire.mime_type),
            data: wire.data,
        }
    }

    fn scheduler(output: &Arc<FakeOutput>) -> PlaybackScheduler {
        PlaybackScheduler::new(
            output.clone(),
            24_000,
            SpeakingIndicator::new(Duration::from_secs(2)),
            None,
        )
    }

    #[test]
    fn test_cursor_rule() {
        let mut cursor = PlaybackCursor::new(Duration::ZERO);
        let ms = Duration::from_millis;
        assert_eq!(cursor.place(ms(0), ms(200)), ms(0));
        assert_eq!(cursor.place(ms(50), ms(150)), ms(200));
        assert_eq!(cursor.position(), ms(350));
        // Late arrival starts immediately
        assert_eq!(cursor.place(ms(1000), ms(10)), ms(1000));
    }

    #[tokio::test]
    async fn test_chunks_abut_under_jitter() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);

        let chunks = [(4800, 0), (3600, 50), (2400, 10), (4800, 400), (1200, 0)];
        for (samples, delay_ms) in chunks {
            output.advance(Duration::from_millis(delay_ms));
            scheduler.schedule(&payload(samples, 24_000)).unwrap();
        }

        let scheduled = output.scheduled();
        assert_eq!(scheduled.len(), 5);
        for pair in scheduled.windows(2) {
            assert!(pair[1].start >= pair[0].end(), "{:?} overlaps {:?}", pair[1], pair[0]);
        }
    }

    #[tokio::test]
    async fn test_no_overlap_random_arrivals() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let output = FakeOutput::new();
            let scheduler = scheduler(&output);
            let mut arrivals = Vec::new();

            for _ in 0..40 {
                output.advance(Duration::from_micros(rng.random_range(0..300_000)));
                arrivals.push(output.now());
                let samples = rng.random_range(1..9600);
                scheduler.schedule(&payload(samples, 24_000)).unwrap();
            }

            let scheduled = output.scheduled();
            for (i, chunk) in scheduled.iter().enumerate() {
                assert!(chunk.start >= arrivals[i], "chunk {} starts in the past", i);
                if i > 0 {
                    let prev_end = scheduled[i - 1].end();
                    assert_eq!(chunk.start, prev_end.max(arrivals[i]));
                }
            }
            assert_eq!(scheduler.cursor(), scheduled.last().unwrap().end());
        }
    }

    #[tokio::test]
    async fn test_immediate_start_after_gap() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);

        scheduler.schedule(&payload(2400, 24_000)).unwrap();
        output.advance(Duration::from_secs(5));
        let chunk = scheduler.schedule(&payload(2400, 24_000)).unwrap();
        assert_eq!(chunk.start, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_two_chunks_fifty_ms_apart() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);

        let first = scheduler.schedule(&payload(4800, 24_000)).unwrap();
        output.advance(Duration::from_millis(50));
        let second = scheduler.schedule(&payload(3600, 24_000)).unwrap();

        assert_eq!(first.start, Duration::ZERO);
        assert_eq!(first.duration, Duration::from_millis(200));
        assert_eq!(second.start, Duration::from_millis(200));
        assert_eq!(second.start + second.duration, Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_cursor_starts_at_device_time() {
        let output = FakeOutput::new();
        output.advance(Duration::from_secs(3));
        let scheduler = scheduler(&output);
        assert_eq!(scheduler.cursor(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_decode_error_keeps_cursor() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);
        scheduler.schedule(&payload(2400, 24_000)).unwrap();
        let before = scheduler.cursor();

        let bad = InboundPayload {
            mime_type: Some("audio/pcm;rate=24000".to_string()),
            data: "%%%".to_string(),
        };
        assert!(matches!(scheduler.schedule(&bad), Err(LiveError::Decode(_))));
        assert_eq!(scheduler.cursor(), before);
        assert_eq!(output.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_declared_rate_wins() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);
        let chunk = scheduler.schedule(&payload(1600, 16_000)).unwrap();
        assert_eq!(chunk.duration, Duration::from_millis(100));
        assert_eq!(output.scheduled()[0].sample_rate, 16_000);
    }

    #[tokio::test]
    async fn test_closed_rejects_chunks() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);
        scheduler.close();
        scheduler.close();

        assert!(output.is_closed());
        assert!(matches!(
            scheduler.schedule(&payload(240, 24_000)),
            Err(LiveError::SessionClosed)
        ));
        assert!(output.scheduled().is_empty());
    }

    #[tokio::test]
    async fn test_sealed_rejects_chunks_but_keeps_output() {
        let output = FakeOutput::new();
        let scheduler = scheduler(&output);
        scheduler.schedule(&payload(240, 24_000)).unwrap();

        scheduler.seal();
        assert!(matches!(
            scheduler.schedule(&payload(240, 24_000)),
            Err(LiveError::SessionClosed)
        ));
        assert!(!output.is_closed());
        assert_eq!(output.scheduled().len(), 1);

        scheduler.close();
        assert!(output.is_closed());
    }

    #[tokio::test]
    async fn test_interrupt_halts_and_resets() {
        let output = FakeOutput::new();
        let speaking = SpeakingIndicator::new(Duration::from_secs(2));
        let scheduler = PlaybackScheduler::new(output.clone(), 24_000, speaking.clone(), None);

        for _ in 0..3 {
            scheduler.schedule(&payload(4800, 24_000)).unwrap();
        }
        assert_eq!(scheduler.cursor(), Duration::from_millis(600));
        assert!(speaking.is_speaking());

        output.advance(Duration::from_millis(100));
        scheduler.interrupt();
        assert_eq!(output.halts(), 1);
        assert_eq!(scheduler.cursor(), Duration::from_millis(100));
        assert!(!speaking.is_speaking());

        let next = scheduler.schedule(&payload(240, 24_000)).unwrap();
        assert_eq!(next.start, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_timer_rearms() {
        let speaking = SpeakingIndicator::new(Duration::from_secs(2));
        let status = speaking.subscribe();

        speaking.mark();
        assert!(*status.borrow());

        tokio::time::sleep(Duration::from_secs(1)).await;
        speaking.mark();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(*status.borrow(), "second chunk should keep the flag set");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!*status.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_clear_cancels_timer() {
        let speaking = SpeakingIndicator::new(Duration::from_secs(2));
        speaking.mark();
        speaking.clear();
        assert!(!speaking.is_speaking());

        speaking.mark();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!speaking.is_speaking());
    }
}
