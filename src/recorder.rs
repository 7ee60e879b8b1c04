//! Session recorder - saves microphone and model audio as WAV files
//!
//! Samples are handed to a writer thread over a channel, so neither the
//! capture thread nor the playback scheduler ever touches the disk.

use crate::error::{LiveError, Result};
use crate::frame::{f32_to_i16, InboundChunk};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

enum Track {
    Input(Vec<f32>),
    Output(Vec<f32>),
}

type Writer = WavWriter<BufWriter<File>>;

pub struct SessionRecorder {
    dir: PathBuf,
    output_rate: u32,
    tx: Mutex<Option<std_mpsc::Sender<Track>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Fresh `<base>/<unix-seconds>` directory, suffixed if a session already
/// started in the same second.
fn session_dir(base: &Path) -> Result<PathBuf> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut dir = base.join(ts.to_string());
    let mut n = 1;
    while dir.exists() {
        dir = base.join(format!("{}-{}", ts, n));
        n += 1;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

impl SessionRecorder {
    /// Create `input.wav` and `output.wav` in a new directory under `base`.
    pub fn create(base: &Path, input_rate: u32, output_rate: u32) -> Result<Self> {
        let dir = session_dir(base)?;
        let input = WavWriter::create(dir.join("input.wav"), wav_spec(input_rate))?;
        let output = WavWriter::create(dir.join("output.wav"), wav_spec(output_rate))?;

        let (tx, rx) = std_mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("livetutor-recorder".to_string())
            .spawn(move || write_tracks(rx, input, output))?;

        info!("Recording session to {:?}", dir);
        Ok(Self {
            dir,
            output_rate,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a captured block to `input.wav`.
    pub fn record_input(&self, samples: &[f32]) {
        self.send(Track::Input(samples.to_vec()));
    }

    /// Append decoded model speech to `output.wav`.
    pub fn record_output(&self, chunk: &InboundChunk) {
        if chunk.sample_rate != self.output_rate {
            warn!(
                "Not recording {} Hz chunk into {} Hz output track",
                chunk.sample_rate, self.output_rate
            );
            return;
        }
        self.send(Track::Output(chunk.samples.clone()));
    }

    fn send(&self, track: Track) {
        if let Ok(tx) = self.tx.lock() {
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(track);
            }
        }
    }

    /// Flush both files. Further samples are ignored.
    pub fn finish(&self) -> Result<()> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LiveError::Recording(hound::Error::FormatError("recorder thread panicked")))?;
            info!("Recording saved to {:?}", self.dir);
        }
        Ok(())
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("Failed to finish recording: {}", e);
        }
    }
}

fn write_tracks(rx: std_mpsc::Receiver<Track>, mut input: Writer, mut output: Writer) {
    let mut failed = false;
    while let Ok(track) = rx.recv() {
        if failed {
            continue;
        }
        let (writer, samples) = match &track {
            Track::Input(samples) => (&mut input, samples),
            Track::Output(samples) => (&mut output, samples),
        };
        for &sample in samples {
            if let Err(e) = writer.write_sample(f32_to_i16(sample)) {
                error!("Failed to write recording: {}", e);
                failed = true;
                break;
            }
        }
    }

    for (name, writer) in [("input", input), ("output", output)] {
        match writer.finalize() {
            Ok(()) => debug!("Finalized {} track", name),
            Err(e) => error!("Failed to finalize {} track: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    fn temp_base(name: &str) -> PathBuf {
        let base = std::env::temp_dir().join(format!("livetutor-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&base);
        base
    }

    #[test]
    fn test_records_both_tracks() {
        let base = temp_base("record");
        let recorder = SessionRecorder::create(&base, 16_000, 24_000).unwrap();
        let dir = recorder.dir().to_path_buf();

        recorder.record_input(&[0.0, 0.5, -0.5]);
        recorder.record_input(&[1.0]);
        recorder.record_output(&InboundChunk {
            samples: vec![0.25; 10],
            sample_rate: 24_000,
        });
        // Wrong rate is skipped
        recorder.record_output(&InboundChunk {
            samples: vec![0.25; 10],
            sample_rate: 16_000,
        });
        recorder.finish().unwrap();

        let mut input = WavReader::open(dir.join("input.wav")).unwrap();
        assert_eq!(input.spec().sample_rate, 16_000);
        let samples: Vec<i16> = input.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16384, -16384, 32767]);

        let output = WavReader::open(dir.join("output.wav")).unwrap();
        assert_eq!(output.spec().sample_rate, 24_000);
        assert_eq!(output.len(), 10);

        // Late samples are ignored
        recorder.record_input(&[0.1]);
        recorder.finish().unwrap();
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_distinct_dirs_in_same_second() {
        let base = temp_base("dirs");
        let first = SessionRecorder::create(&base, 16_000, 24_000).unwrap();
        let second = SessionRecorder::create(&base, 16_000, 24_000).unwrap();
        assert_ne!(first.dir(), second.dir());
        drop(first);
        drop(second);
        let _ = fs::remove_dir_all(&base);
    }
}
