/// Gapless playback demo
/// Feeds a WAV file to the scheduler in randomly sized chunks with random
/// arrival delays; the result should sound exactly like the original file.
use anyhow::{bail, Context, Result};
use livetutor::audio::{AudioBackend, PulseBackend, StreamSpec};
use livetutor::frame::{encode_frame, i16_to_f32, AudioFrame, InboundPayload};
use livetutor::scheduler::{PlaybackScheduler, SpeakingIndicator};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Load the first channel of a WAV file as normalized samples
fn load_wav(path: &str) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("Failed to open {}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => reader
            .samples::<i16>()
            .step_by(channels)
            .map(|s| s.map(i16_to_f32))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .step_by(channels)
            .collect::<Result<_, _>>()?,
        _ => bail!("Unsupported WAV format: {:?}", spec),
    };
    Ok((samples, spec.sample_rate))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: playback_demo <file.wav>")?;
    let (samples, rate) = load_wav(&path)?;
    println!(
        "🎵 Playing {} ({:.2}s at {} Hz) in jittered chunks",
        path,
        samples.len() as f32 / rate as f32,
        rate
    );

    let backend = PulseBackend::new("livetutor-demo");
    let output = backend.open_output(&StreamSpec {
        sample_rate: rate,
        block_size: 0,
        device: None,
    })?;
    let speaking = SpeakingIndicator::new(Duration::from_millis(500));
    let mut status = speaking.subscribe();
    let scheduler = PlaybackScheduler::new(output, rate, speaking, None);

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let speaking = *status.borrow_and_update();
            println!("{}", if speaking { "🔊 speaking" } else { "🔇 quiet" });
        }
    });

    let started = Instant::now();
    let mut rng = rand::rng();
    let mut offset = 0;
    let mut end = Duration::ZERO;
    while offset < samples.len() {
        // 50-300ms chunks, arriving up to 250ms apart
        let len = rng.random_range(rate as usize / 20..=rate as usize * 3 / 10);
        let chunk = &samples[offset..(offset + len).min(samples.len())];
        offset += chunk.len();

        let wire = encode_frame(AudioFrame {
            samples: chunk,
            sample_rate: rate,
        });
        let placed = scheduler.schedule(&InboundPayload {
            mime_type: Some(wire.mime_type),
            data: wire.data,
        })?;
        info!(
            "Chunk of {:?} scheduled at {:?}",
            placed.duration, placed.start
        );
        end = placed.start + placed.duration;

        let delay = rng.random_range(0..250);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    println!("All chunks scheduled, playback ends at {:?}", end);
    // The device clock started just before `started`
    tokio::time::sleep(end.saturating_sub(started.elapsed()) + Duration::from_millis(700)).await;
    tokio::task::spawn_blocking(move || scheduler.close()).await?;
    Ok(())
}
