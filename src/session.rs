//! Duplex session with the Gemini Live endpoint
//!
//! The WebSocket is split into a sink owned by a writer task and a stream
//! owned by a reader task, so outbound audio never waits on inbound traffic.
//! Everything the owner needs to know is delivered as a [`SessionEvent`] on
//! an unbounded channel.

use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::frame::WireFrame;
use crate::protocol::{self, ClientMessage, Inbound, Setup};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

/// Time allowed for the writer to flush its goodbye before it is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Anything that carries WebSocket messages both ways.
pub trait WsDuplex:
    Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Send
{
}

impl<T> WsDuplex for T where
    T: Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Send
{
}

pub type BoxedWs = Pin<Box<dyn WsDuplex>>;

/// Opens the transport for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<BoxedWs>;
}

/// Connects over TLS with `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<BoxedWs> {
        // Never log the API key
        let shown = url.split_once("?key=").map(|(base, _)| base).unwrap_or(url);
        info!("Connecting to Gemini Live at {}", shown);

        let (ws, resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| LiveError::Connection(e.to_string()))?;
        debug!("WebSocket connection response: {}", resp.status());
        Ok(Box::pin(ws))
    }
}

/// Lifecycle and data events of a [`DuplexSession`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Open,
    Inbound(Inbound),
    Error(String),
    Closed,
}

type WsSink = SplitSink<BoxedWs, Message>;
type WsStream = SplitStream<BoxedWs>;

struct Shared {
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Flips to `true` once when the session begins closing
    shutdown: watch::Sender<bool>,
    closed_emitted: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // Owner may already be gone during teardown
        let _ = self.events.send(event);
    }

    fn emit_closed_once(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            info!("Duplex session closed");
            self.emit(SessionEvent::Closed);
        }
    }

    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
    }
}

/// Bidirectional channel to the remote inference service.
///
/// Cheap to clone; all clones control the same connection.
#[derive(Clone)]
pub struct DuplexSession {
    shared: Arc<Shared>,
}

impl DuplexSession {
    /// Create an unconnected session that reports to `events`.
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                events,
                shutdown,
                closed_emitted: AtomicBool::new(false),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the channel and complete the setup handshake.
    ///
    /// Suspends until the server acknowledges setup, the handshake fails, or
    /// [`close`](Self::close) is called.
    pub async fn connect(&self, connector: &dyn Connector, config: &SessionConfig) -> Result<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(LiveError::Cancelled);
        }

        let handshake = async {
            match tokio::time::timeout(config.setup_timeout, self.handshake(connector, config)).await {
                Ok(result) => result,
                Err(_) => Err(LiveError::Timeout("setup complete")),
            }
        };

        tokio::select! {
            result = handshake => match result {
                Ok(()) => {
                    info!("Duplex session open");
                    self.shared.emit(SessionEvent::Open);
                    Ok(())
                }
                Err(e) => {
                    error!("Failed to open duplex session: {}", e);
                    self.shared.emit(SessionEvent::Error(e.to_string()));
                    Err(e)
                }
            },
            _ = shutdown.wait_for(|closing| *closing) => {
                info!("Connect cancelled by close");
                Err(LiveError::Cancelled)
            }
        }
    }

    async fn handshake(&self, connector: &dyn Connector, config: &SessionConfig) -> Result<()> {
        let ws = connector.open(&config.url).await?;
        let (mut sink, mut stream) = ws.split();

        let setup = ClientMessage::Setup(Setup::for_config(config)).to_json()?;
        debug!("Sending setup message with model: {}", config.model);
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| LiveError::Connection(format!("failed to send setup: {}", e)))?;

        wait_for_setup_complete(&mut stream).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let writer = tokio::spawn(run_writer(
            sink,
            outbound_rx,
            self.shared.shutdown.subscribe(),
            self.shared.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            stream,
            self.shared.shutdown.subscribe(),
            self.shared.clone(),
        ));

        {
            let mut tasks = self.shared.tasks.lock().map_err(|_| LiveError::SessionClosed)?;
            tasks.push(writer);
            tasks.push(reader);
        }

        let mut outbound = self.shared.outbound.lock().map_err(|_| LiveError::SessionClosed)?;
        if *self.shared.shutdown.borrow() {
            // close() raced the last step of the handshake
            return Err(LiveError::Cancelled);
        }
        *outbound = Some(outbound_tx);
        Ok(())
    }

    /// Queue one frame for transmission without waiting.
    ///
    /// Fails with [`LiveError::SendDropped`] when the session is not open or
    /// the outbound queue is full.
    pub fn send(&self, frame: WireFrame) -> Result<()> {
        let outbound = self.shared.outbound.lock().map_err(|_| LiveError::SendDropped)?;
        match outbound.as_ref() {
            Some(tx) => tx
                .try_send(ClientMessage::audio(frame))
                .map_err(|_| LiveError::SendDropped),
            None => Err(LiveError::SendDropped),
        }
    }

    /// Whether frames are currently accepted.
    pub fn is_open(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .map(|o| o.is_some())
            .unwrap_or(false)
    }

    /// Request graceful termination. Safe to call any number of times;
    /// `Closed` is emitted exactly once.
    pub async fn close(&self) {
        self.shared.begin_shutdown();

        let tasks = match self.shared.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for mut task in tasks {
            match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Session task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Session task did not finish within {:?}, aborting", CLOSE_GRACE);
                    task.abort();
                }
            }
        }

        self.shared.emit_closed_once();
    }
}

async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<()> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => text.to_owned(),
                Err(_) => continue,
            },
            Message::Close(frame) => {
                return Err(LiveError::Connection(format!(
                    "closed during setup: {:?}",
                    frame
                )))
            }
            _ => continue,
        };

        match protocol::demux(&text) {
            Ok(events) if events.contains(&Inbound::SetupComplete) => return Ok(()),
            Ok(_) => debug!("Ignoring message before setup complete"),
            Err(e) => warn!("Unparseable message during setup: {}", e),
        }
    }
    Err(LiveError::Connection("stream ended during setup".to_string()))
}

async fn run_writer(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<ClientMessage>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    debug!("Outbound writer task started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closing| *closing) => break,
            next = outbound.recv() => next,
        };
        let Some(message) = next else { break };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };
        trace!("Sending {} bytes", json.len());
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            error!("Failed to send message: {}", e);
            shared.emit(SessionEvent::Error(e.to_string()));
            shared.begin_shutdown();
            break;
        }
    }

    if let Ok(json) = ClientMessage::audio_stream_end().to_json() {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!("Outbound writer task terminated");
}

async fn run_reader(mut stream: WsStream, mut shutdown: watch::Receiver<bool>, shared: Arc<Shared>) {
    debug!("Inbound reader task started");
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closing| *closing) => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed by server: {:?}", frame);
                shared.begin_shutdown();
                shared.emit_closed_once();
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                shared.emit(SessionEvent::Error(e.to_string()));
                shared.begin_shutdown();
                break;
            }
            None => {
                info!("WebSocket stream ended");
                shared.begin_shutdown();
                shared.emit_closed_once();
                break;
            }
        };

        match protocol::demux(&text) {
            Ok(events) => {
                for event in events {
                    shared.emit(SessionEvent::Inbound(event));
                }
            }
            Err(e) => warn!("Failed to parse server message: {}", e),
        }
    }
    debug!("Inbound reader task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, RemotePeer};

    fn test_config() -> SessionConfig {
        SessionConfig {
            url: "memory://live".to_string(),
            ..Default::default()
        }
    }

    fn frame(tag: &str) -> WireFrame {
        WireFrame {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: tag.to_string(),
        }
    }

    async fn open_session() -> (
        DuplexSession,
        mpsc::UnboundedReceiver<SessionEvent>,
        RemotePeer,
    ) {
        let (connector, mut peers) = MemoryConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);

        let remote = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            peer.accept_setup().await;
            peer
        });

        session.connect(&connector, &test_config()).await.unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Open));
        (session, rx, remote.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_sends_setup_and_opens() {
        let (connector, mut peers) = MemoryConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);

        let remote = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let setup = peer.accept_setup().await;
            assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        });

        session.connect(&connector, &test_config()).await.unwrap();
        remote.await.unwrap();
        assert!(session.is_open());
        assert_eq!(rx.recv().await, Some(SessionEvent::Open));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let (connector, _peers) = MemoryConnector::refusing();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);

        let err = session.connect(&connector, &test_config()).await.unwrap_err();
        assert!(matches!(err, LiveError::Connection(_)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Error(_))));

        session.close().await;
        session.close().await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_setup_timeout() {
        let (connector, mut peers) = MemoryConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);
        let mut config = test_config();
        config.setup_timeout = Duration::from_millis(50);

        // Peer never answers the setup message
        let _hold = tokio::spawn(async move {
            let peer = peers.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        let err = session.connect(&connector, &config).await.unwrap_err();
        assert!(matches!(err, LiveError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_close_cancels_inflight_connect() {
        let (connector, mut peers) = MemoryConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);

        let _hold = tokio::spawn(async move {
            let peer = peers.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        let closer = session.clone();
        let connect = tokio::spawn(async move { session.connect(&connector, &test_config()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close().await;

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(LiveError::Cancelled)));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (session, _rx, mut peer) = open_session().await;

        for tag in ["F1", "F2", "F3"] {
            session.send(frame(tag)).unwrap();
        }

        // Simulated network delay before the remote drains its socket
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let blob = peer.next_audio().await.unwrap();
            seen.push(blob.data);
        }
        assert_eq!(seen, vec!["F1", "F2", "F3"]);
        session.close().await;
    }

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = DuplexSession::new(tx);
        assert!(matches!(session.send(frame("x")), Err(LiveError::SendDropped)));
    }

    #[tokio::test]
    async fn test_inbound_payloads_forwarded() {
        let (session, mut rx, mut peer) = open_session().await;

        peer.send_audio(&[0.25; 240], 24_000).await;
        peer.send_json(serde_json::json!({"serverContent": {"turnComplete": true}})).await;

        match rx.recv().await {
            Some(SessionEvent::Inbound(Inbound::Audio(payload))) => {
                assert_eq!(payload.mime_type.as_deref(), Some("audio/pcm;rate=24000"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(rx.recv().await, Some(SessionEvent::Inbound(Inbound::TurnComplete)));
        session.close().await;
    }

    #[tokio::test]
    async fn test_remote_close_emits_closed_once() {
        let (session, mut rx, peer) = open_session().await;

        peer.close().await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(!session.is_open());

        session.close().await;
        session.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_sends_stream_end() {
        let (session, _rx, mut peer) = open_session().await;
        session.close().await;

        let end = peer.next_json().await.unwrap();
        assert_eq!(end["realtimeInput"]["audioStreamEnd"], true);
        assert!(matches!(session.send(frame("late")), Err(LiveError::SendDropped)));
    }
}
