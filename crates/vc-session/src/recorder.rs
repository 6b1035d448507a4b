use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};
use vc_core::{Result, VcError};

pub const INPUT_FILE_NAME: &str = "in.wav";
pub const OUTPUT_FILE_NAME: &str = "out.wav";

type WavFile = WavWriter<BufWriter<File>>;

/// Writes the raw input and the final output of a stream to two mono
/// 16-bit WAV files, for debugging a session after the fact.
pub struct IoRecorder {
    dir: PathBuf,
    input: Option<WavFile>,
    output: Option<WavFile>,
}

impl IoRecorder {
    /// Creates a closed recorder targeting `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            input: None,
            output: None,
        }
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE_NAME)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE_NAME)
    }

    pub fn is_open(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }

    /// (Re)creates both files, discarding any earlier recording.
    pub fn open(&mut self, input_rate: u32, output_rate: u32) -> Result<()> {
        self.close();
        fs::create_dir_all(&self.dir)?;
        let input_path = self.input_path();
        let output_path = self.output_path();
        remove_stale(&input_path)?;
        remove_stale(&output_path)?;

        self.input = Some(create_wav(&input_path, input_rate)?);
        self.output = Some(create_wav(&output_path, output_rate)?);
        info!(
            input = %input_path.display(),
            output = %output_path.display(),
            "IO recorder opened"
        );
        Ok(())
    }

    pub fn write_input(&mut self, samples: &[f32]) -> Result<()> {
        write_pcm16(self.input.as_mut().ok_or(VcError::RecorderClosed)?, samples)
    }

    pub fn write_output(&mut self, samples: &[f32]) -> Result<()> {
        write_pcm16(self.output.as_mut().ok_or(VcError::RecorderClosed)?, samples)
    }

    /// Finalizes both files. Safe to call when already closed.
    pub fn close(&mut self) {
        for writer in [self.input.take(), self.output.take()].into_iter().flatten() {
            if let Err(err) = writer.finalize() {
                warn!("failed to finalize recording: {err}");
            }
        }
    }
}

impl Drop for IoRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    if path.exists() {
        info!(path = %path.display(), "removing old recording file");
        fs::remove_file(path)?;
    }
    Ok(())
}

fn create_wav(path: &Path, sample_rate: u32) -> Result<WavFile> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    WavWriter::create(path, spec).map_err(|e| VcError::Recorder(e.to_string()))
}

fn write_pcm16(writer: &mut WavFile, samples: &[f32]) -> Result<()> {
    for &s in samples {
        let value = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(value)
            .map_err(|e| VcError::Recorder(e.to_string()))?;
    }
    Ok(())
}
