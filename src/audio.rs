//! Audio device boundary
//!
//! The pipeline talks to hardware through [`AudioBackend`]: one capture
//! stream delivering fixed-size f32 blocks to a callback, and one output
//! exposing its own monotonic clock and accepting `(unit, start)` requests.
//! [`PulseBackend`] implements both on PulseAudio's simple API, each stream on
//! a dedicated OS thread.

use crate::error::{LiveError, Result};
use crate::frame::{duration_to_samples, samples_to_duration};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::State as OperationState;
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Called on the capture thread with every captured block.
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Called at most once if a capture stream dies after it opened.
pub type ErrorCallback = Box<dyn FnOnce(LiveError) + Send + 'static>;

/// Parameters for opening a mono stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    /// Samples per capture block; ignored for output
    pub block_size: usize,
    /// Device name, default device when `None`
    pub device: Option<String>,
}

/// Samples handed to the output device for one scheduled chunk
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackUnit {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// An open capture stream. Closing (or dropping) releases the device.
pub trait CaptureHandle: Send {
    fn close(&mut self);
}

/// An open output stream with its own clock.
pub trait AudioOutput: Send + Sync {
    /// Current time on the device clock. Never decreases.
    fn now(&self) -> Duration;
    /// Queue `unit` to start at `start` on the device clock. Must not block.
    fn play_at(&self, unit: PlaybackUnit, start: Duration) -> Result<()>;
    /// Discard everything queued but not yet heard.
    fn halt(&self);
    /// Release the device. Idempotent.
    fn close(&self);
}

/// Factory for capture and output streams.
pub trait AudioBackend: Send + Sync {
    fn open_input(
        &self,
        spec: &StreamSpec,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn CaptureHandle>>;
    fn open_output(&self, spec: &StreamSpec) -> Result<Arc<dyn AudioOutput>>;
}

/// Kind of PulseAudio device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Microphone or other input
    Source,
    /// Monitor of a sink (what you hear)
    Monitor,
    /// Speaker or headphones
    Sink,
}

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// PulseAudio name, usable as `input_device` / `output_device`
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub kind: DeviceKind,
}

/// Backend on the local PulseAudio server.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(
        &self,
        spec: &StreamSpec,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn CaptureHandle>> {
        Ok(Box::new(PulseCapture::open(&self.app_name, spec, on_block, on_error)?))
    }

    fn open_output(&self, spec: &StreamSpec) -> Result<Arc<dyn AudioOutput>> {
        Ok(Arc::new(PulseOutput::open(&self.app_name, spec)?))
    }
}

fn open_simple(
    app_name: &str,
    direction: Direction,
    device: Option<&str>,
    stream_name: &str,
    rate: u32,
    attr: Option<&BufferAttr>,
) -> Result<Simple> {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    };
    if !spec.is_valid() {
        return Err(LiveError::DeviceUnavailable(format!("invalid sample spec at {} Hz", rate)));
    }

    Simple::new(
        None, // default server
        app_name,
        direction,
        device,
        stream_name,
        &spec,
        None, // default channel map
        attr,
    )
    .map_err(|e| LiveError::DeviceUnavailable(format!("{} stream: {}", stream_name, e)))
}

/// Microphone capture on a dedicated thread.
pub struct PulseCapture {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulseCapture {
    /// Open the capture stream. Returns only after PulseAudio accepted it.
    pub fn open(
        app_name: &str,
        spec: &StreamSpec,
        mut on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);

        let app_name = app_name.to_string();
        let spec = spec.clone();
        let stop = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("livetutor-capture".to_string())
            .spawn(move || {
                let block_bytes = spec.block_size * 4;
                let attr = BufferAttr {
                    maxlength: u32::MAX,
                    tlength: u32::MAX,
                    prebuf: u32::MAX,
                    minreq: u32::MAX,
                    fragsize: block_bytes as u32,
                };
                let simple = match open_simple(
                    &app_name,
                    Direction::Record,
                    spec.device.as_deref(),
                    "microphone",
                    spec.sample_rate,
                    Some(&attr),
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                info!(
                    "Microphone capture started at {} Hz, {} samples per block",
                    spec.sample_rate, spec.block_size
                );
                let mut bytes = vec![0u8; block_bytes];
                let mut block = vec![0f32; spec.block_size];
                while !stop.load(Ordering::Relaxed) {
                    if let Err(e) = simple.read(&mut bytes) {
                        if !stop.load(Ordering::Relaxed) {
                            error!("Audio read error: {}", e);
                            on_error(LiveError::DeviceUnavailable(format!("microphone read: {}", e)));
                        }
                        break;
                    }
                    for (sample, raw) in block.iter_mut().zip(bytes.chunks_exact(4)) {
                        *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    }
                    on_block(&block);
                }
                debug!("Microphone capture thread exiting");
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shutdown,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(LiveError::DeviceUnavailable(
                "capture thread exited during open".to_string(),
            )),
        }
    }
}

impl CaptureHandle for PulseCapture {
    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // The pending read returns within one block
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!("Microphone released");
        }
    }
}

impl Drop for PulseCapture {
    fn drop(&mut self) {
        self.close();
    }
}

enum PlayCommand {
    Play {
        unit: PlaybackUnit,
        start: Duration,
        generation: u64,
    },
    Halt,
}

/// Output clock: time since the stream opened minus the audio PulseAudio
/// still buffers ahead of the speaker, so it tracks what is being heard.
/// Never goes backwards when the reported latency grows.
struct DeviceClock {
    epoch: Instant,
    latency_us: AtomicU64,
    last_ns: AtomicU64,
}

impl DeviceClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            latency_us: AtomicU64::new(0),
            last_ns: AtomicU64::new(0),
        }
    }

    fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.store(micros, Ordering::SeqCst);
    }

    fn now(&self) -> Duration {
        self.at(self.epoch.elapsed())
    }

    fn at(&self, elapsed: Duration) -> Duration {
        let latency = Duration::from_micros(self.latency_us.load(Ordering::SeqCst));
        let heard = elapsed.saturating_sub(latency);
        let heard_ns = u64::try_from(heard.as_nanos()).unwrap_or(u64::MAX);
        let previous = self.last_ns.fetch_max(heard_ns, Ordering::SeqCst);
        Duration::from_nanos(previous.max(heard_ns))
    }
}

/// Speaker output on a dedicated thread.
///
/// The playback thread tracks where the audio already written to PulseAudio
/// runs out and pads silence up to each unit's start time, so units that abut
/// on the timeline abut in the output.
pub struct PulseOutput {
    clock: Arc<DeviceClock>,
    tx: Mutex<Option<std_mpsc::Sender<PlayCommand>>>,
    /// Bumped by `halt`; queued units from older generations are skipped
    generation: Arc<AtomicU64>,
    closing: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PulseOutput {
    pub fn open(app_name: &str, spec: &StreamSpec) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<PlayCommand>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let clock = Arc::new(DeviceClock::new());
        let generation = Arc::new(AtomicU64::new(0));
        let closing = Arc::new(AtomicBool::new(false));

        let thread = PlaybackThread {
            app_name: app_name.to_string(),
            device: spec.device.clone(),
            clock: clock.clone(),
            generation: generation.clone(),
            closing: closing.clone(),
        };
        let rate = spec.sample_rate;

        let handle = std::thread::Builder::new()
            .name("livetutor-playback".to_string())
            .spawn(move || {
                let simple = match thread.open(rate) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                thread.run(simple, rate, rx);
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Speaker output opened at {} Hz", rate);
                Ok(Self {
                    clock,
                    tx: Mutex::new(Some(tx)),
                    generation,
                    closing,
                    handle: Mutex::new(Some(handle)),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(LiveError::DeviceUnavailable(
                "playback thread exited during open".to_string(),
            )),
        }
    }

    fn send(&self, command: PlayCommand) -> Result<()> {
        let tx = self.tx.lock().map_err(|_| LiveError::SessionClosed)?;
        match tx.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| LiveError::SessionClosed),
            None => Err(LiveError::SessionClosed),
        }
    }
}

impl AudioOutput for PulseOutput {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn play_at(&self, unit: PlaybackUnit, start: Duration) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.send(PlayCommand::Play {
            unit,
            start,
            generation,
        })
    }

    fn halt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.send(PlayCommand::Halt);
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Playback thread panicked");
            }
            info!("Speaker output released");
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct PlaybackThread {
    app_name: String,
    device: Option<String>,
    clock: Arc<DeviceClock>,
    generation: Arc<AtomicU64>,
    closing: Arc<AtomicBool>,
}

impl PlaybackThread {
    fn open(&self, rate: u32) -> Result<Simple> {
        open_simple(
            &self.app_name,
            Direction::Playback,
            self.device.as_deref(),
            "speech",
            rate,
            None,
        )
    }

    fn run(&self, mut simple: Simple, mut rate: u32, rx: std_mpsc::Receiver<PlayCommand>) {
        // Device time at which audio already handed to PulseAudio runs out
        let mut written_until = Duration::ZERO;

        while let Ok(command) = rx.recv() {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            match command {
                PlayCommand::Halt => {
                    if let Err(e) = simple.flush() {
                        warn!("Failed to flush playback stream: {}", e);
                    }
                    written_until = self.clock.now();
                    debug!("Playback halted");
                }
                PlayCommand::Play {
                    unit,
                    start,
                    generation,
                } => {
                    if generation != self.generation.load(Ordering::SeqCst) {
                        continue;
                    }
                    if unit.sample_rate != rate {
                        info!("Reopening speaker output at {} Hz", unit.sample_rate);
                        let _ = simple.drain();
                        match self.open(unit.sample_rate) {
                            Ok(reopened) => {
                                simple = reopened;
                                rate = unit.sample_rate;
                                written_until = self.clock.now();
                            }
                            Err(e) => {
                                error!("Cannot play {} Hz audio: {}", unit.sample_rate, e);
                                continue;
                            }
                        }
                    }

                    let head = written_until.max(self.clock.now());
                    let silence = duration_to_samples(start.saturating_sub(head), rate);
                    let mut bytes = vec![0u8; silence * 4];
                    bytes.reserve(unit.samples.len() * 4);
                    for sample in &unit.samples {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }

                    if let Err(e) = simple.write(&bytes) {
                        error!("Audio write error: {}", e);
                        break;
                    }
                    written_until = head.max(start) + unit.duration();
                    if let Ok(latency) = simple.get_latency() {
                        self.clock.set_latency(Duration::from_micros(latency.0));
                    }
                }
            }
        }

        // Queued audio is cut off rather than drained
        let _ = simple.flush();
        debug!("Playback thread exiting");
    }
}

/// List PulseAudio sources and sinks
pub fn list_devices() -> Result<Vec<AudioDevice>> {
    let devices = Arc::new(Mutex::new(Vec::new()));

    let mut proplist =
        Proplist::new().ok_or_else(|| LiveError::DeviceUnavailable("failed to create proplist".into()))?;
    proplist
        .set_str(
            libpulse_binding::proplist::properties::APPLICATION_NAME,
            "livetutor-device-lister",
        )
        .map_err(|_| LiveError::DeviceUnavailable("failed to set proplist".into()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| LiveError::DeviceUnavailable("failed to create mainloop".into()))?;
    let mut context = Context::new_with_proplist(&mainloop, "livetutor-context", &proplist)
        .ok_or_else(|| LiveError::DeviceUnavailable("failed to create context".into()))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to connect context: {}", e)))?;

    // Wait for context to be ready
    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            libpulse_binding::context::State::Ready => break,
            libpulse_binding::context::State::Failed | libpulse_binding::context::State::Terminated => {
                return Err(LiveError::DeviceUnavailable("PulseAudio connection failed".into()));
            }
            _ => {}
        }
    }

    let introspector = context.introspect();

    let sources = devices.clone();
    let source_op = introspector.get_source_info_list(move |result| {
        if let ListResult::Item(info) = result {
            let name = info.name.as_ref().map(|s| s.to_string());
            let is_monitor = info.monitor_of_sink.is_some()
                || name.as_deref().map(|n| n.contains("monitor")).unwrap_or(false);
            if let (Some(name), Some(description)) = (name, info.description.as_ref()) {
                if let Ok(mut devices) = sources.lock() {
                    devices.push(AudioDevice {
                        name,
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        kind: if is_monitor {
                            DeviceKind::Monitor
                        } else {
                            DeviceKind::Source
                        },
                    });
                }
            }
        } else if let ListResult::Error = result {
            error!("Error listing audio sources");
        }
    });

    let sinks = devices.clone();
    let sink_op = introspector.get_sink_info_list(move |result| {
        if let ListResult::Item(info) = result {
            if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                if let Ok(mut devices) = sinks.lock() {
                    devices.push(AudioDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        kind: DeviceKind::Sink,
                    });
                }
            }
        } else if let ListResult::Error = result {
            error!("Error listing audio sinks");
        }
    });

    while source_op.get_state() == OperationState::Running || sink_op.get_state() == OperationState::Running {
        iterate(&mut mainloop)?;
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let result = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| LiveError::DeviceUnavailable("device list poisoned".into()));
    result
}

fn iterate(mainloop: &mut Mainloop) -> Result<()> {
    match mainloop.iterate(false) {
        IterateResult::Success(_) => Ok(()),
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(LiveError::DeviceUnavailable("mainloop iterate failed".into()))
        }
    }
}
