//! LiveTutor - spoken tutoring session with Gemini Live
//!
//! Streams the default microphone to the model and plays its answers on the
//! default speaker until Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use livetutor::protocol::Speaker;
use livetutor::{LiveEvent, LiveSession, SessionConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livetutor");

    let config = SessionConfig::from_env().context("Failed to load configuration")?;
    let live = LiveSession::with_pulse(config);

    let mut events = live.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LiveEvent::Transcript { speaker, text }) => match speaker {
                    Speaker::User => println!("🎤 You: {}", text),
                    Speaker::Model => println!("🤖 Tutor: {}", text),
                },
                Ok(LiveEvent::ModelText(text)) => println!("🤖 {}", text),
                Ok(LiveEvent::Interrupted) => println!("✋ (interrupted)"),
                Ok(LiveEvent::StateChanged(state)) => info!("Session state: {:?}", state),
                Ok(LiveEvent::Error(e)) => error!("Session error: {}", e),
                Ok(LiveEvent::Started) | Ok(LiveEvent::TurnComplete) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut connected = live.connection_status();
    tokio::spawn(async move {
        while connected.changed().await.is_ok() {
            let up = *connected.borrow_and_update();
            println!("{}", if up { "🟢 Connected" } else { "🔴 Disconnected" });
        }
    });

    let mut speaking = live.speaking_status();
    tokio::spawn(async move {
        while speaking.changed().await.is_ok() {
            if *speaking.borrow_and_update() {
                println!("🔊 Tutor speaking");
            }
        }
    });

    live.start().await.context("Failed to start live session")?;
    println!("Talk to your tutor. Press Ctrl-C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
        }
        _ = live.closed() => {
            warn!("Session ended by the server");
        }
    }

    live.stop().await.context("Failed to stop live session")?;
    info!("Goodbye");
    Ok(())
}
