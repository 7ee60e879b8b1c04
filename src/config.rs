//! Session configuration
//!
//! Defaults match what the Gemini Live native-audio models expect: 16 kHz
//! mono PCM going up, 24 kHz mono PCM coming back.

use crate::error::{LiveError, Result};
use std::path::PathBuf;
use std::time::Duration;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

pub const DEFAULT_INSTRUCTION: &str = "You are a friendly Cambridge A-Level Computer Science Tutor. \
Keep answers concise and spoken naturally.";

/// Configuration for a live voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full WebSocket URL, API key included
    pub url: String,
    pub model: String,
    /// Persona / style directive sent in the setup message
    pub system_instruction: Option<String>,
    /// Prebuilt voice name, e.g. "Puck"
    pub voice: Option<String>,
    /// Ask the server for input and output transcriptions
    pub transcribe: bool,
    /// Capture rate in Hz
    pub input_rate: u32,
    /// Playback rate in Hz, also assumed for inbound audio without a rate tag
    pub output_rate: u32,
    /// Samples per captured block
    pub block_size: usize,
    /// Outbound frames allowed in flight before new ones are dropped
    pub outbound_queue: usize,
    pub setup_timeout: Duration,
    /// How long "speaking" stays set after the last scheduled chunk
    pub speaking_timeout: Duration,
    /// PulseAudio source name, default source when `None`
    pub input_device: Option<String>,
    /// PulseAudio sink name, default sink when `None`
    pub output_device: Option<String>,
    /// Write input/output WAV files under this directory
    pub record_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: Some(DEFAULT_INSTRUCTION.to_string()),
            voice: None,
            transcribe: false,
            input_rate: 16_000,
            output_rate: 24_000,
            block_size: 1600, // 100ms at 16 kHz
            outbound_queue: 8,
            setup_timeout: Duration::from_secs(10),
            speaking_timeout: Duration::from_secs(2),
            input_device: None,
            output_device: None,
            record_dir: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration pointing at the public Live endpoint.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            ..Default::default()
        }
    }

    /// Build a configuration from `GEMINI_API_KEY` and optional `LIVETUTOR_*`
    /// overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LiveError::Config("GEMINI_API_KEY is not set".to_string()))?;

        let mut config = Self::from_api_key(&api_key);
        if let Some(model) = lookup("LIVETUTOR_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(instruction) = lookup("LIVETUTOR_INSTRUCTION") {
            config.system_instruction = Some(instruction).filter(|s| !s.is_empty());
        }
        config.voice = lookup("LIVETUTOR_VOICE").filter(|v| !v.is_empty());
        config.transcribe = matches!(
            lookup("LIVETUTOR_TRANSCRIBE").as_deref(),
            Some("1") | Some("true") | Some("yes")
        );
        if let Some(block) = lookup("LIVETUTOR_BLOCK_SIZE") {
            config.block_size = block
                .parse()
                .map_err(|_| LiveError::Config(format!("invalid LIVETUTOR_BLOCK_SIZE: {}", block)))?;
        }
        config.input_device = lookup("LIVETUTOR_INPUT_DEVICE");
        config.output_device = lookup("LIVETUTOR_OUTPUT_DEVICE");
        config.record_dir = lookup("LIVETUTOR_RECORD_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(LiveError::Config("endpoint url is empty".to_string()));
        }
        if self.input_rate == 0 || self.output_rate == 0 {
            return Err(LiveError::Config("sample rates must be non-zero".to_string()));
        }
        if self.block_size == 0 {
            return Err(LiveError::Config("block size must be non-zero".to_string()));
        }
        if self.outbound_queue == 0 {
            return Err(LiveError::Config("outbound queue must hold at least one frame".to_string()));
        }
        Ok(())
    }

    /// Block duration implied by `block_size` and `input_rate`.
    pub fn block_duration(&self) -> Duration {
        Duration::from_nanos(self.block_size as u64 * 1_000_000_000 / self.input_rate as u64)
    }
}
