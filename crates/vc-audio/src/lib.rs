use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info, warn};
use vc_core::{ChunkHandler, SessionSettings, VcError, SUPPORTED_SAMPLE_RATES};

pub mod network;

pub use network::{decode_pcm16, encode_pcm16, handle_request_message, NetworkReply};

/// Device callbacks queued between the audio threads and the worker.
const QUEUE_CAPACITY: usize = 256;

pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()?
        .map(|d| d.name().unwrap_or_else(|_| "unknown-input".to_string()))
        .collect();
    Ok(devices)
}

pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()?
        .map(|d| d.name().unwrap_or_else(|_| "unknown-output".to_string()))
        .collect();
    Ok(devices)
}

pub fn default_sample_rate() -> Result<u32> {
    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no default input device"))?;
    let config = input.default_input_config()?;
    Ok(config.sample_rate().0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamOptions {
    pub sample_rate: u32,
    pub input_device_name: Option<String>,
    pub output_device_name: Option<String>,
    /// Extra output that mirrors the converted audio, if any.
    pub monitor_device_name: Option<String>,
    pub input_gain: f32,
    pub output_gain: f32,
    pub monitor_gain: f32,
}

impl AudioStreamOptions {
    /// Both devices run at the session input rate; the session converts to
    /// its own output rate, which must match for direct playback.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            sample_rate: settings.input_sample_rate,
            input_device_name: settings.server_input_device_name.clone(),
            output_device_name: settings.server_output_device_name.clone(),
            monitor_device_name: settings
                .server_monitor_device_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            input_gain: settings.server_input_audio_gain,
            output_gain: settings.server_output_audio_gain,
            monitor_gain: settings.server_monitor_audio_gain,
        }
    }
}

pub struct RealtimeAudioEngine {
    running: Arc<AtomicBool>,
    meters: Arc<StreamMeters>,
    stream_thread: Option<thread::JoinHandle<()>>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

/// Counters shared between the worker and whoever holds the engine.
#[derive(Debug, Default)]
struct StreamMeters {
    input_rms: AtomicU32,
    input_peak: AtomicU32,
    output_volume: AtomicU32,
    chunks: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStats {
    pub volume: f32,
    pub chunks: u64,
    pub errors: u64,
}

impl RealtimeAudioEngine {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Smoothed input `(rms, peak)`.
    pub fn levels(&self) -> (f32, f32) {
        (
            f32::from_bits(self.meters.input_rms.load(Ordering::Relaxed)),
            f32::from_bits(self.meters.input_peak.load(Ordering::Relaxed)),
        )
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            volume: f32::from_bits(self.meters.output_volume.load(Ordering::Relaxed)),
            chunks: self.meters.chunks.load(Ordering::Relaxed),
            errors: self.meters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stop_and_abort(mut self) {
        self.stop();
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Opens a duplex device stream that feeds `handler` exact-size chunks.
///
/// Device callbacks only move samples; re-chunking and conversion happen on
/// a worker thread so the audio threads never wait on the session lock.
pub fn spawn_voice_changer_stream<H>(
    handler: Arc<H>,
    options: AudioStreamOptions,
) -> Result<RealtimeAudioEngine>
where
    H: ChunkHandler,
{
    let host = cpal::default_host();
    let sample_rate = options.sample_rate;

    let input_device = find_input_device(&host, options.input_device_name.as_deref())?;
    let output_device = find_output_device(&host, options.output_device_name.as_deref())?;

    let input_ranges: Vec<_> = input_device
        .supported_input_configs()
        .context("query input configs")?
        .filter(|r| r.sample_format() == cpal::SampleFormat::F32)
        .collect();
    let output_ranges = f32_output_ranges(&output_device)?;
    let monitor = match options.monitor_device_name.as_deref() {
        Some(name) => {
            let device = find_output_device(&host, Some(name))?;
            let ranges = f32_output_ranges(&device)?;
            Some((device, ranges))
        }
        None => None,
    };

    let mut devices = vec![input_ranges.as_slice(), output_ranges.as_slice()];
    if let Some((_, ranges)) = &monitor {
        devices.push(ranges.as_slice());
    }
    check_sample_rate(sample_rate, &devices)?;

    let input_config = pick_config(&input_ranges, sample_rate)
        .ok_or_else(|| anyhow!("input device has no f32 config at {sample_rate} Hz"))?;
    let output_config = pick_config(&output_ranges, sample_rate)
        .ok_or_else(|| anyhow!("output device has no f32 config at {sample_rate} Hz"))?;
    let input_channels = input_config.channels as usize;
    let output_channels = output_config.channels as usize;
    let monitor = match monitor {
        Some((device, ranges)) => {
            let config = pick_config(&ranges, sample_rate)
                .ok_or_else(|| anyhow!("monitor device has no f32 config at {sample_rate} Hz"))?;
            Some((device, config))
        }
        None => None,
    };

    info!(
        input_device = %input_device.name().unwrap_or_else(|_| "unknown-input".to_string()),
        output_device = %output_device.name().unwrap_or_else(|_| "unknown-output".to_string()),
        sample_rate,
        input_channels,
        output_channels,
        monitor = monitor.is_some(),
        block = handler.block_size(),
        "starting device stream"
    );

    let (input_tx, input_rx) = sync_channel::<Vec<f32>>(QUEUE_CAPACITY);
    let (output_tx, output_rx) = sync_channel::<Vec<f32>>(QUEUE_CAPACITY);

    let running = Arc::new(AtomicBool::new(true));
    let meters = Arc::new(StreamMeters::default());

    let input_data_fn = build_input_callback(Arc::clone(&running), input_channels, input_tx);
    let output_data_fn = build_output_callback(Arc::clone(&running), output_rx, None);

    let input_stream = input_device.build_input_stream(
        &input_config,
        input_data_fn,
        |err| error!("input stream error: {err}"),
        None,
    )?;
    let output_stream = output_device.build_output_stream(
        &output_config,
        output_data_fn,
        |err| error!("output stream error: {err}"),
        None,
    )?;

    let (monitor_stream, monitor_tap) = match monitor {
        Some((device, config)) => {
            let channels = config.channels as usize;
            let (tx, rx) = sync_channel::<Vec<f32>>(QUEUE_CAPACITY);
            // Two blocks of backlog at most; the monitor tracks the newest audio.
            let backlog = 2 * handler.block_size() * channels;
            let stream = device.build_output_stream(
                &config,
                build_output_callback(Arc::clone(&running), rx, Some(backlog)),
                |err| error!("monitor stream error: {err}"),
                None,
            )?;
            let tap = MonitorTap {
                tx,
                gain: options.monitor_gain,
                channels,
            };
            (Some(stream), Some(tap))
        }
        None => (None, None),
    };

    let worker = Worker {
        handler,
        input_gain: options.input_gain,
        output_gain: options.output_gain,
        output_channels,
        monitor: monitor_tap,
        running: Arc::clone(&running),
        meters: Arc::clone(&meters),
    };
    let worker_thread = thread::spawn(move || worker.run(input_rx, output_tx));

    let running_stream = Arc::clone(&running);
    let stream_thread = thread::spawn(move || {
        if input_stream.play().is_err() || output_stream.play().is_err() {
            error!("failed to start device streams");
            running_stream.store(false, Ordering::Relaxed);
            return;
        }
        if let Some(monitor) = &monitor_stream {
            if let Err(err) = monitor.play() {
                warn!("failed to start monitor stream: {err}");
            }
        }

        while running_stream.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(20));
        }

        drop(monitor_stream);
        drop(output_stream);
        drop(input_stream);
    });

    Ok(RealtimeAudioEngine {
        running,
        meters,
        stream_thread: Some(stream_thread),
        worker_thread: Some(worker_thread),
    })
}

fn f32_output_ranges(device: &cpal::Device) -> Result<Vec<cpal::SupportedStreamConfigRange>> {
    Ok(device
        .supported_output_configs()
        .context("query output configs")?
        .filter(|r| r.sample_format() == cpal::SampleFormat::F32)
        .collect())
}

/// Every opened device has to run at `requested`.
fn check_sample_rate(
    requested: u32,
    devices: &[&[cpal::SupportedStreamConfigRange]],
) -> std::result::Result<(), VcError> {
    let available: Vec<u32> = SUPPORTED_SAMPLE_RATES
        .into_iter()
        .filter(|&rate| devices.iter().all(|ranges| pick_config(ranges, rate).is_some()))
        .collect();
    if available.contains(&requested) {
        Ok(())
    } else {
        Err(VcError::UnsupportedSampleRate {
            requested,
            available,
        })
    }
}

fn pick_config(ranges: &[cpal::SupportedStreamConfigRange], rate: u32) -> Option<cpal::StreamConfig> {
    ranges
        .iter()
        .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .min_by_key(|r| r.channels())
        .map(|r| r.clone().with_sample_rate(cpal::SampleRate(rate)).config())
}

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    if let Some(name) = name.map(str::trim).filter(|s| !s.is_empty()) {
        let mut devices = host.input_devices()?;
        if let Some(dev) = devices.find(|d| {
            d.name()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        }) {
            return Ok(dev);
        }
        return Err(anyhow!("input device not found: '{name}'"));
    }
    host.default_input_device()
        .ok_or_else(|| anyhow!("default input device not found"))
}

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    if let Some(name) = name.map(str::trim).filter(|s| !s.is_empty()) {
        let mut devices = host.output_devices()?;
        if let Some(dev) = devices.find(|d| {
            d.name()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        }) {
            return Ok(dev);
        }
        return Err(anyhow!("output device not found: '{name}'"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("default output device not found"))
}

fn build_input_callback(
    running: Arc<AtomicBool>,
    input_channels: usize,
    input_tx: SyncSender<Vec<f32>>,
) -> impl FnMut(&[f32], &cpal::InputCallbackInfo) + Send + 'static {
    let mut dropped = 0usize;
    move |data: &[f32], _: &cpal::InputCallbackInfo| {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        let mono = downmix_to_mono(data, input_channels);
        match input_tx.try_send(mono) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 64 == 1 {
                    warn!(dropped, "input queue full, worker is falling behind");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("input queue disconnected");
                running.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// With `max_backlog` set, older queued samples are dropped beyond that
/// many so playback follows the newest audio.
fn build_output_callback(
    running: Arc<AtomicBool>,
    output_rx: Receiver<Vec<f32>>,
    max_backlog: Option<usize>,
) -> impl FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static {
    let mut pending = VecDeque::<f32>::new();
    let mut underruns = 0usize;
    let mut last_sample = 0.0_f32;
    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        if !running.load(Ordering::Relaxed) {
            data.fill(0.0);
            return;
        }

        while pending.len() < data.len() || max_backlog.is_some() {
            match output_rx.try_recv() {
                Ok(block) => pending.extend(block),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("output queue disconnected");
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
        if let Some(max) = max_backlog {
            let excess = pending.len().saturating_sub(max.max(data.len()));
            pending.drain(..excess);
        }

        let mut callback_underrun = false;
        for sample in data {
            if let Some(v) = pending.pop_front() {
                *sample = v;
                last_sample = v;
            } else {
                // Decay instead of dropping straight to zero to avoid a click.
                last_sample *= 0.995;
                if last_sample.abs() < 1.0e-5 {
                    last_sample = 0.0;
                }
                *sample = last_sample;
                callback_underrun = true;
            }
        }
        if callback_underrun {
            underruns += 1;
            if underruns % 64 == 1 {
                debug!(underruns, "output underrun");
            }
        }
    }
}

struct Worker<H> {
    handler: Arc<H>,
    input_gain: f32,
    output_gain: f32,
    output_channels: usize,
    monitor: Option<MonitorTap>,
    running: Arc<AtomicBool>,
    meters: Arc<StreamMeters>,
}

/// Feed for the monitor output stream.
struct MonitorTap {
    tx: SyncSender<Vec<f32>>,
    gain: f32,
    channels: usize,
}

impl MonitorTap {
    /// Never blocks; a lagging monitor only loses its own audio.
    fn send(&self, audio: &[f32]) {
        let mut mono = audio.to_vec();
        apply_gain(&mut mono, self.gain);
        let frames = upmix_from_mono(&mono, self.channels);
        if let Err(TrySendError::Full(_)) = self.tx.try_send(frames) {
            debug!("monitor queue full, dropping chunk");
        }
    }
}

impl<H: ChunkHandler> Worker<H> {
    fn run(self, input_rx: Receiver<Vec<f32>>, output_tx: SyncSender<Vec<f32>>) {
        let mut rechunker = Rechunker::default();
        let mut level_meter = LevelMeter::new(0.92);
        let mut last_heartbeat = Instant::now();

        // One block of silence so the first conversion does not start with an underrun.
        let prefill = self.handler.block_size() * self.output_channels;
        let _ = output_tx.try_send(vec![0.0; prefill]);

        while self.running.load(Ordering::Relaxed) {
            let mut mono = match input_rx.recv_timeout(Duration::from_millis(5)) {
                Ok(v) => v,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            };
            apply_gain(&mut mono, self.input_gain);
            level_meter.push_block(&mono);
            self.meters
                .input_rms
                .store(level_meter.rms().to_bits(), Ordering::Relaxed);
            self.meters
                .input_peak
                .store(level_meter.peak().to_bits(), Ordering::Relaxed);
            rechunker.push(&mono);

            // The block size is re-read so a reconfigured session takes effect
            // on the next chunk boundary.
            while let Some(chunk) = rechunker.next_chunk(self.handler.block_size()) {
                if !self.convert_chunk(&chunk, &output_tx) {
                    return;
                }
            }

            if last_heartbeat.elapsed() >= Duration::from_secs(1) {
                debug!(
                    chunks = self.meters.chunks.load(Ordering::Relaxed),
                    errors = self.meters.errors.load(Ordering::Relaxed),
                    queued = rechunker.len(),
                    rms = level_meter.rms(),
                    "stream heartbeat"
                );
                last_heartbeat = Instant::now();
            }
        }
        info!("device worker stopped");
    }

    /// Returns `false` once the output side is gone.
    fn convert_chunk(&self, chunk: &[f32], output_tx: &SyncSender<Vec<f32>>) -> bool {
        let response = self.handler.on_audio(chunk);
        self.meters.chunks.fetch_add(1, Ordering::Relaxed);
        self.meters
            .output_volume
            .store(response.volume.to_bits(), Ordering::Relaxed);
        if let Some(err) = &response.error {
            let errors = self.meters.errors.fetch_add(1, Ordering::Relaxed) + 1;
            if errors % 100 == 1 {
                warn!(code = err.code.as_str(), errors, "chunk failed: {}", err.message);
            }
        }

        let mut audio = response.audio;
        if let Some(monitor) = &self.monitor {
            monitor.send(&audio);
        }
        apply_gain(&mut audio, self.output_gain);
        match output_tx.try_send(upmix_from_mono(&audio, self.output_channels)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("output queue full, dropping chunk");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("output queue disconnected");
                self.running.store(false, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Regroups device callbacks of arbitrary length into fixed-size chunks,
/// in order, every sample exactly once.
#[derive(Debug, Default)]
pub struct Rechunker {
    pending: VecDeque<f32>,
}

impl Rechunker {
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend(samples.iter().copied());
    }

    pub fn next_chunk(&mut self, size: usize) -> Option<Vec<f32>> {
        if size == 0 || self.pending.len() < size {
            return None;
        }
        Some(self.pending.drain(..size).collect())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain != 1.0 {
        samples.iter_mut().for_each(|s| *s *= gain);
    }
}

fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn upmix_from_mono(mono: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return mono.to_vec();
    }
    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(channels))
        .collect()
}

#[derive(Debug, Clone)]
pub struct LevelMeter {
    smoothing: f32,
    rms: f32,
    peak: f32,
}

impl LevelMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.9999),
            rms: 0.0,
            peak: 0.0,
        }
    }

    pub fn push_block(&mut self, block: &[f32]) {
        if block.is_empty() {
            return;
        }

        let mut sum = 0.0_f32;
        let mut peak = 0.0_f32;
        for s in block {
            let x = s.abs();
            sum += x * x;
            peak = peak.max(x);
        }
        let rms_now = (sum / block.len() as f32).sqrt();
        self.rms = self.smoothing * self.rms + (1.0 - self.smoothing) * rms_now;
        self.peak = self.smoothing * self.peak + (1.0 - self.smoothing) * peak;
    }

    pub fn rms(&self) -> f32 {
        self.rms
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }
}
