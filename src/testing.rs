//! Test doubles for the device and network boundaries

use crate::audio::{
    AudioBackend, AudioOutput, BlockCallback, CaptureHandle, ErrorCallback, PlaybackUnit, StreamSpec,
};
use crate::error::{LiveError, Result};
use crate::frame::{encode_frame, AudioFrame};
use crate::protocol::Blob;
use crate::session::{BoxedWs, Connector};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// One `play_at` call seen by [`FakeOutput`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Scheduled {
    pub start: Duration,
    pub duration: Duration,
    pub samples: usize,
    pub sample_rate: u32,
}

impl Scheduled {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

#[derive(Default)]
struct OutputState {
    now: Duration,
    scheduled: Vec<Scheduled>,
    halts: usize,
    closed: bool,
}

/// Output device with a manually driven clock.
#[derive(Default)]
pub(crate) struct FakeOutput {
    state: Mutex<OutputState>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().now += by;
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn halts(&self) -> usize {
        self.state.lock().unwrap().halts
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl AudioOutput for FakeOutput {
    fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn play_at(&self, unit: PlaybackUnit, start: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(LiveError::SessionClosed);
        }
        state.scheduled.push(Scheduled {
            start,
            duration: unit.duration(),
            samples: unit.samples.len(),
            sample_rate: unit.sample_rate,
        });
        Ok(())
    }

    fn halt(&self) {
        self.state.lock().unwrap().halts += 1;
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

type CallbackSlot = Arc<Mutex<Option<BlockCallback>>>;

type ErrorSlot = Arc<Mutex<Option<ErrorCallback>>>;

struct FakeCapture {
    slot: CallbackSlot,
    error_slot: ErrorSlot,
    open: Arc<AtomicUsize>,
    close_delay: Duration,
    closed: bool,
}

impl CaptureHandle for FakeCapture {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // Like a capture thread finishing its pending read
            std::thread::sleep(self.close_delay);
            self.slot.lock().unwrap().take();
            self.error_slot.lock().unwrap().take();
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend whose capture blocks are pushed by the test and whose outputs
/// are [`FakeOutput`]s.
#[derive(Default)]
pub(crate) struct FakeBackend {
    slot: CallbackSlot,
    error_slot: ErrorSlot,
    open_captures: Arc<AtomicUsize>,
    outputs: Mutex<Vec<Arc<FakeOutput>>>,
    fail_input: AtomicBool,
    fail_output: AtomicBool,
    capture_close_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_input(&self, fail: bool) {
        self.fail_input.store(fail, Ordering::SeqCst);
    }

    pub fn fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    /// Make closing the capture stream take `delay`.
    pub fn capture_close_delay(&self, delay: Duration) {
        *self.capture_close_delay.lock().unwrap() = delay;
    }

    /// Kill the open capture stream as if the device vanished. Returns
    /// whether a capture stream was open.
    pub fn fail_capture(&self) -> bool {
        let on_error = self.error_slot.lock().unwrap().take();
        match on_error {
            Some(on_error) => {
                self.slot.lock().unwrap().take();
                on_error(LiveError::DeviceUnavailable("microphone unplugged".to_string()));
                true
            }
            None => false,
        }
    }

    /// Deliver a block as if the capture thread read it. Returns whether a
    /// capture stream was open to receive it.
    pub fn push_block(&self, samples: &[f32]) -> bool {
        match self.slot.lock().unwrap().as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    pub fn open_captures(&self) -> usize {
        self.open_captures.load(Ordering::SeqCst)
    }

    pub fn outputs(&self) -> Vec<Arc<FakeOutput>> {
        self.outputs.lock().unwrap().clone()
    }

    pub fn last_output(&self) -> Arc<FakeOutput> {
        self.outputs().last().cloned().expect("no output opened")
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(
        &self,
        _spec: &StreamSpec,
        on_block: BlockCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn CaptureHandle>> {
        if self.fail_input.load(Ordering::SeqCst) {
            return Err(LiveError::DeviceUnavailable("no microphone".to_string()));
        }
        *self.slot.lock().unwrap() = Some(on_block);
        *self.error_slot.lock().unwrap() = Some(on_error);
        self.open_captures.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            slot: self.slot.clone(),
            error_slot: self.error_slot.clone(),
            open: self.open_captures.clone(),
            close_delay: *self.capture_close_delay.lock().unwrap(),
            closed: false,
        }))
    }

    fn open_output(&self, _spec: &StreamSpec) -> Result<Arc<dyn AudioOutput>> {
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(LiveError::DeviceUnavailable("no speaker".to_string()));
        }
        let output = FakeOutput::new();
        self.outputs.lock().unwrap().push(output.clone());
        Ok(output)
    }
}

/// Connector that hands the server end of an in-memory socket to the test.
pub(crate) struct MemoryConnector {
    peers: Option<mpsc::UnboundedSender<RemotePeer>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: Some(tx) }, rx)
    }

    /// A connector whose every open fails.
    pub fn refusing() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (Self { peers: None }, rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _url: &str) -> Result<BoxedWs> {
        let peers = self
            .peers
            .as_ref()
            .ok_or_else(|| LiveError::Connection("connection refused".to_string()))?;

        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        peers
            .send(RemotePeer { ws: server })
            .map_err(|_| LiveError::Connection("no remote listening".to_string()))?;
        Ok(Box::pin(client))
    }
}

/// The remote side of a [`MemoryConnector`] connection.
pub(crate) struct RemotePeer {
    ws: WebSocketStream<DuplexStream>,
}

impl RemotePeer {
    /// Read the setup message and acknowledge it.
    pub async fn accept_setup(&mut self) -> Value {
        let setup = self.next_json().await.expect("setup message");
        assert!(setup.get("setup").is_some(), "first message was {}", setup);
        self.send_json(json!({"setupComplete": {}})).await;
        setup
    }

    /// Next JSON message from the client, `None` once the client closed.
    pub async fn next_json(&mut self) -> Option<Value> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
                Ok(Message::Binary(bytes)) => return serde_json::from_slice(&bytes).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    /// Next realtime audio blob, skipping anything else.
    pub async fn next_audio(&mut self) -> Option<Blob> {
        loop {
            let message = self.next_json().await?;
            if let Some(audio) = message["realtimeInput"].get("audio") {
                return serde_json::from_value(audio.clone()).ok();
            }
        }
    }

    pub async fn send_json(&mut self, message: Value) {
        let _ = self.ws.send(Message::Text(message.to_string().into())).await;
    }

    /// Send model audio the way the live service does.
    pub async fn send_audio(&mut self, samples: &[f32], sample_rate: u32) {
        let wire = encode_frame(AudioFrame {
            samples,
            sample_rate,
        });
        self.send_json(json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"mimeType": wire.mime_type, "data": wire.data}}]
                }
            }
        }))
        .await;
    }

    /// Close from the server side and wait briefly for the client's reply.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}
