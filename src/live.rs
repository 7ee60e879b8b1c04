//! Live voice session lifecycle
//!
//! `LiveSession` owns one pipeline at a time: capture -> encoder -> streamer
//! -> duplex session -> scheduler -> output. Every state change goes through
//! [`transition`], and teardown is claimed under the state lock so exactly one
//! caller releases resources and reaches `Closed`.

use crate::audio::{AudioBackend, AudioOutput, CaptureHandle, PulseBackend, StreamSpec};
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::protocol::{Inbound, Speaker};
use crate::recorder::SessionRecorder;
use crate::scheduler::{PlaybackScheduler, SpeakingIndicator};
use crate::session::{Connector, DuplexSession, SessionEvent, WsConnector};
use crate::streamer::OutboundStreamer;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`LiveSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Errored,
    Closed,
}

/// What caused a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Opened,
    Stop,
    RemoteClosed,
    Failed,
    Cleanup,
}

impl Trigger {
    fn name(self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::Opened => "open",
            Trigger::Stop => "stop",
            Trigger::RemoteClosed => "remote close",
            Trigger::Failed => "error",
            Trigger::Cleanup => "cleanup",
        }
    }
}

/// The session state table.
pub fn transition(from: SessionState, trigger: Trigger) -> Result<SessionState> {
    use SessionState::*;

    match (from, trigger) {
        (Idle | Closed, Trigger::Start) => Ok(Connecting),
        (Connecting, Trigger::Opened) => Ok(Open),
        (Connecting | Open, Trigger::Stop) => Ok(Closing),
        (Open, Trigger::RemoteClosed) => Ok(Closing),
        (Connecting | Open, Trigger::Failed) => Ok(Errored),
        (Closing | Errored, Trigger::Cleanup) => Ok(Closed),
        (from, trigger) => Err(LiveError::InvalidTransition {
            from,
            trigger: trigger.name(),
        }),
    }
}

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    StateChanged(SessionState),
    /// The remote accepted the session and audio is flowing
    Started,
    Transcript { speaker: Speaker, text: String },
    ModelText(String),
    TurnComplete,
    /// The model stopped talking because the user spoke over it
    Interrupted,
    Error(String),
}

/// Everything acquired for one session
struct Resources {
    capture: Box<dyn CaptureHandle>,
    scheduler: Arc<PlaybackScheduler>,
    session: DuplexSession,
    streamer: Arc<OutboundStreamer<DuplexSession>>,
    recorder: Option<Arc<SessionRecorder>>,
}

impl Resources {
    async fn release(self) {
        let Resources {
            mut capture,
            scheduler,
            session,
            streamer,
            recorder,
        } = self;

        // Stop producing before the channel goes away
        let capture = tokio::task::spawn_blocking(move || {
            capture.close();
        });
        if capture.await.is_err() {
            warn!("Capture release task failed");
        }

        session.close().await;
        streamer.log_stats();

        let devices = tokio::task::spawn_blocking(move || {
            scheduler.close();
            if let Some(recorder) = recorder {
                if let Err(e) = recorder.finish() {
                    error!("Failed to finish recording: {}", e);
                }
            }
        });
        if devices.await.is_err() {
            warn!("Output release task failed");
        }
    }
}

struct Core {
    state: SessionState,
    /// Identifies the current session; tasks of older sessions are ignored
    generation: u64,
    resources: Option<Resources>,
}

impl Core {
    /// Hand the resources to the teardown owner. Playback is sealed here, under
    /// the state lock, so no inbound audio reaches the speaker once the state
    /// has left `Open`.
    fn take_claim(&mut self) -> Claim {
        let resources = self.resources.take();
        if let Some(resources) = &resources {
            resources.scheduler.seal();
        }
        Claim {
            generation: self.generation,
            resources,
        }
    }
}

/// Teardown rights taken by exactly one caller
struct Claim {
    generation: u64,
    resources: Option<Resources>,
}

struct Inner {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    core: Mutex<Core>,
    state_tx: watch::Sender<(u64, SessionState)>,
    connected: watch::Sender<bool>,
    speaking: SpeakingIndicator,
    events: broadcast::Sender<LiveEvent>,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        self.core.lock().map_err(|_| LiveError::SessionClosed)
    }

    fn publish(&self, event: LiveEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, core: &mut Core, next: SessionState) {
        debug!("Session state {:?} -> {:?}", core.state, next);
        core.state = next;
        self.state_tx.send_replace((core.generation, next));
        self.publish(LiveEvent::StateChanged(next));
    }

    /// Take teardown rights for `generation` via the first valid trigger.
    fn claim(&self, generation: u64, triggers: &[Trigger]) -> Option<Claim> {
        let mut core = self.lock().ok()?;
        if core.generation != generation {
            return None;
        }
        let next = triggers
            .iter()
            .find_map(|trigger| transition(core.state, *trigger).ok())?;
        self.set_state(&mut core, next);
        Some(core.take_claim())
    }

    async fn teardown(&self, claim: Claim) {
        self.connected.send_replace(false);
        self.speaking.clear();
        if let Some(resources) = claim.resources {
            resources.release().await;
        }

        if let Ok(mut core) = self.lock() {
            if core.generation == claim.generation {
                match transition(core.state, Trigger::Cleanup) {
                    Ok(next) => self.set_state(&mut core, next),
                    Err(e) => error!("Teardown ended in unexpected state: {}", e),
                }
            }
        }
        info!("Live session closed");
    }

    async fn fail(&self, generation: u64, err: &LiveError) {
        if let Some(claim) = self.claim(generation, &[Trigger::Failed]) {
            error!("Live session failed: {}", err);
            self.publish(LiveEvent::Error(err.to_string()));
            self.teardown(claim).await;
        }
    }

    /// Wait until `generation` reached `Closed` or was superseded.
    async fn wait_closed(&self, generation: u64) {
        let mut state = self.state_tx.subscribe();
        let _ = state
            .wait_for(|(g, s)| *g != generation || *s == SessionState::Closed)
            .await;
    }

    async fn remote_closed(&self, generation: u64) {
        // Before the open is processed a remote close counts as a failure
        if let Some(claim) = self.claim(generation, &[Trigger::RemoteClosed, Trigger::Failed]) {
            info!("Remote ended the session");
            self.teardown(claim).await;
        }
    }
}

/// A restartable realtime voice session.
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<Inner>,
}

impl LiveSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn AudioBackend>, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel((0, SessionState::Idle));
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let speaking = SpeakingIndicator::new(config.speaking_timeout);

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                connector,
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    generation: 0,
                    resources: None,
                }),
                state_tx,
                connected,
                speaking,
                events,
            }),
        }
    }

    /// Session on the local PulseAudio server and the public Live endpoint.
    pub fn with_pulse(config: SessionConfig) -> Self {
        Self::new(
            config,
            Arc::new(PulseBackend::new("livetutor")),
            Arc::new(WsConnector),
        )
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().1
    }

    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn speaking_status(&self) -> watch::Receiver<bool> {
        self.inner.speaking.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the session is `Closed`, at once if it already is.
    pub async fn closed(&self) {
        let mut state = self.inner.state_tx.subscribe();
        let _ = state.wait_for(|(_, state)| *state == SessionState::Closed).await;
    }

    /// Acquire the devices, then connect. Returns once the remote accepted
    /// the session.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.config.validate()?;

        let generation = {
            let mut core = inner.lock()?;
            let next = transition(core.state, Trigger::Start)?;
            core.generation += 1;
            self.inner.set_state(&mut core, next);
            core.generation
        };
        info!(
            "Starting live session #{} ({} Hz in, {} Hz out, {:?} blocks)",
            generation,
            inner.config.input_rate,
            inner.config.output_rate,
            inner.config.block_duration()
        );

        let recorder = match &inner.config.record_dir {
            Some(dir) => match SessionRecorder::create(dir, inner.config.input_rate, inner.config.output_rate) {
                Ok(recorder) => Some(Arc::new(recorder)),
                Err(e) => {
                    warn!("Recording disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(events_tx);
        let streamer = Arc::new(OutboundStreamer::new(
            session.clone(),
            inner.config.input_rate,
            recorder.clone(),
        ));

        // Devices before any network resource
        let (output, capture) = match self.open_devices(streamer.clone(), faults_tx).await {
            Ok(devices) => devices,
            Err(e) => {
                inner.fail(generation, &e).await;
                inner.wait_closed(generation).await;
                return Err(e);
            }
        };

        let scheduler = Arc::new(PlaybackScheduler::new(
            output,
            inner.config.output_rate,
            inner.speaking.clone(),
            recorder.clone(),
        ));
        let resources = Resources {
            capture,
            scheduler: scheduler.clone(),
            session: session.clone(),
            streamer,
            recorder,
        };

        let rejected = {
            let mut core = inner.lock()?;
            if core.generation == generation && core.state == SessionState::Connecting {
                core.resources = Some(resources);
                None
            } else {
                Some(resources)
            }
        };
        if let Some(resources) = rejected {
            info!("Session stopped while acquiring devices");
            resources.release().await;
            return Err(LiveError::Cancelled);
        }

        tokio::spawn(pump(inner.clone(), generation, scheduler, events_rx, faults_rx));

        match session.connect(inner.connector.as_ref(), &inner.config).await {
            Ok(()) => {
                let mut core = inner.lock()?;
                if core.generation != generation {
                    return Err(LiveError::Cancelled);
                }
                let next = transition(core.state, Trigger::Opened).map_err(|_| LiveError::Cancelled)?;
                inner.set_state(&mut core, next);
                inner.connected.send_replace(true);
                inner.publish(LiveEvent::Started);
                info!("Live session #{} open", generation);
                Ok(())
            }
            Err(LiveError::Cancelled) => Err(LiveError::Cancelled),
            Err(e) => {
                // The event pump may own the teardown
                inner.fail(generation, &e).await;
                inner.wait_closed(generation).await;
                Err(e)
            }
        }
    }

    async fn open_devices(
        &self,
        streamer: Arc<OutboundStreamer<DuplexSession>>,
        faults: mpsc::UnboundedSender<LiveError>,
    ) -> Result<(Arc<dyn AudioOutput>, Box<dyn CaptureHandle>)> {
        let backend = self.inner.backend.clone();
        let config = &self.inner.config;
        let output_spec = StreamSpec {
            sample_rate: config.output_rate,
            block_size: config.block_size,
            device: config.output_device.clone(),
        };
        let input_spec = StreamSpec {
            sample_rate: config.input_rate,
            block_size: config.block_size,
            device: config.input_device.clone(),
        };

        tokio::task::spawn_blocking(move || {
            let output = backend.open_output(&output_spec)?;
            let on_block = Box::new(move |block: &[f32]| streamer.push(block));
            let on_error = Box::new(move |err: LiveError| {
                // The pump is gone once the session is torn down
                let _ = faults.send(err);
            });
            match backend.open_input(&input_spec, on_block, on_error) {
                Ok(capture) => Ok((output, capture)),
                Err(e) => {
                    output.close();
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| LiveError::DeviceUnavailable(format!("device open task failed: {}", e)))?
    }

    /// Stop the session and wait until it is `Closed`. A no-op when nothing
    /// is running.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let (generation, claim) = {
            let mut core = inner.lock()?;
            match core.state {
                SessionState::Idle | SessionState::Closed => return Ok(()),
                SessionState::Closing | SessionState::Errored => (core.generation, None),
                SessionState::Connecting | SessionState::Open => {
                    let next = transition(core.state, Trigger::Stop)?;
                    inner.set_state(&mut core, next);
                    (core.generation, Some(core.take_claim()))
                }
            }
        };

        if let Some(claim) = claim {
            info!("Stopping live session #{}", generation);
            inner.teardown(claim).await;
        }

        // Another caller may own the teardown
        inner.wait_closed(generation).await;
        Ok(())
    }
}

async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    scheduler: Arc<PlaybackScheduler>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut faults: mpsc::UnboundedReceiver<LiveError>,
) {
    debug!("Event pump for session #{} started", generation);
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            Some(fault) = faults.recv() => {
                if fault.is_fatal() {
                    inner.fail(generation, &fault).await;
                } else {
                    warn!("Capture fault: {}", fault);
                }
                continue;
            }
        };
        let Some(event) = event else { break };
        match event {
            SessionEvent::Open => debug!("Channel open"),
            SessionEvent::Inbound(inbound) => match inbound {
                Inbound::Audio(payload) => match scheduler.schedule(&payload) {
                    Ok(_) | Err(LiveError::Decode(_)) => {}
                    Err(LiveError::SessionClosed) => debug!("Audio arrived after close"),
                    Err(e) => warn!("Failed to schedule audio: {}", e),
                },
                Inbound::Interrupted => {
                    info!("Model interrupted");
                    scheduler.interrupt();
                    inner.publish(LiveEvent::Interrupted);
                }
                Inbound::Transcript { speaker, text } => {
                    inner.publish(LiveEvent::Transcript { speaker, text });
                }
                Inbound::ModelText(text) => inner.publish(LiveEvent::ModelText(text)),
                Inbound::TurnComplete => inner.publish(LiveEvent::TurnComplete),
                Inbound::GoAway => {
                    info!("Server sent goAway");
                    inner.remote_closed(generation).await;
                }
                Inbound::SetupComplete => {}
            },
            SessionEvent::Error(message) => {
                inner.fail(generation, &LiveError::Connection(message)).await;
            }
            SessionEvent::Closed => inner.remote_closed(generation).await,
        }
    }
    debug!("Event pump for session #{} finished", generation);
}
