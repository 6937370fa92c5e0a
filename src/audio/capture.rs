//! Audio capture from input devices
//!
//! The cpal stream runs on its own thread; its callback downmixes to mono
//! `i16` and hands chunks over a bounded channel. [`FrameSource`] regroups
//! those chunks into fixed-size frames on the consumer side.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::resolve_input;
use crate::audio::AudioFrame;
use crate::config::AudioConfig;
use crate::constants::*;
use crate::error::AudioError;
use crate::events::{Event, EventBus};

/// How often a blocked `next_frame` re-checks the stop flag
const STOP_POLL: Duration = Duration::from_millis(20);

/// Callback chunks buffered between the device and the consumer
const CHUNK_QUEUE: usize = 64;

/// Capture settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_samples: usize,
    /// Opaque identifier from device discovery
    pub device_id: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            device_id: None,
        }
    }
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bits_per_sample: config.bits_per_sample,
            frame_samples: config.frame_samples,
            device_id: config.input_device.clone(),
        }
    }
}

/// Signals a [`FrameSource`] to stop from any thread
#[derive(Clone, Debug)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

/// Finite, non-restartable sequence of fixed-size frames
pub struct FrameSource {
    chunks: Receiver<Vec<i16>>,
    errors: Option<Receiver<AudioError>>,
    pending: Vec<i16>,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    finished: bool,
    thread: Option<JoinHandle<()>>,
    events: Option<EventBus>,
    frames_produced: u64,
    overruns: Arc<AtomicU64>,
}

impl FrameSource {
    /// Open the selected input device (or the default one).
    ///
    /// The capture gate is checked before any device is touched.
    pub fn open(config: &CaptureConfig, capture_authorized: bool) -> Result<Self, AudioError> {
        if !capture_authorized {
            return Err(AudioError::PermissionDenied);
        }
        if config.channels != 1 || config.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels, {} bits",
                config.channels, config.bits_per_sample
            )));
        }
        check_frame_samples(config.frame_samples)?;

        let device = resolve_input(config.device_id.as_deref())?;
        let device_name = device.name.clone();
        let default_config = device.default_input_config()?;
        let sample_format = default_config.sample_format();
        let device_channels = default_config.channels();

        // Capture in the device's native channel layout, downmix in the callback
        let stream_config = StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (chunk_tx, chunk_rx) = bounded::<Vec<i16>>(CHUNK_QUEUE);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let overruns = Arc::new(AtomicU64::new(0));
        let overruns_for_callback = overruns.clone();

        let thread = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let device = device.into_inner();
                let stream = match build_input_stream(
                    &device,
                    &stream_config,
                    sample_format,
                    chunk_tx,
                    error_tx,
                    overruns_for_callback,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::DeviceUnavailable("capture thread exited".into()));
            }
        }

        tracing::info!(
            "Capturing from {} ({} Hz, {} device channels, {} samples/frame)",
            device_name,
            config.sample_rate,
            device_channels,
            config.frame_samples
        );

        Ok(Self {
            chunks: chunk_rx,
            errors: Some(error_rx),
            pending: Vec::with_capacity(config.frame_samples * 2),
            frame_samples: config.frame_samples,
            running,
            finished: false,
            thread: Some(thread),
            events: None,
            frames_produced: 0,
            overruns,
        })
    }

    /// Source fed by an external producer of mono samples.
    ///
    /// Dropping the sender without calling `stop` ends the sequence with a
    /// capture error, like a device that went away.
    pub fn from_chunks(chunks: Receiver<Vec<i16>>, frame_samples: usize) -> Result<Self, AudioError> {
        check_frame_samples(frame_samples)?;
        Ok(Self {
            chunks,
            errors: None,
            pending: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            running: Arc::new(AtomicBool::new(true)),
            finished: false,
            thread: None,
            events: None,
            frames_produced: 0,
            overruns: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Publish the level of every produced frame
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Block until a full frame is available.
    ///
    /// `Ok(None)` once stopped; a device error ends the sequence.
    pub fn next_frame(&mut self) -> Result<Option<AudioFrame>, AudioError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if !self.running.load(Ordering::SeqCst) {
                self.finish();
                return Ok(None);
            }

            if let Some(err) = self.errors.as_ref().and_then(|rx| rx.try_recv().ok()) {
                self.finish();
                return Err(err);
            }

            if self.pending.len() >= self.frame_samples {
                let rest = self.pending.split_off(self.frame_samples);
                let samples = std::mem::replace(&mut self.pending, rest);
                return Ok(Some(self.emit(AudioFrame::new(samples))));
            }

            match self.chunks.recv_timeout(STOP_POLL) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let stopped = !self.running.load(Ordering::SeqCst);
                    let short = self.pending.len();
                    self.finish();
                    if stopped {
                        return Ok(None);
                    }
                    return Err(AudioError::CaptureError(format!(
                        "capture stream ended with {} of {} samples pending",
                        short, self.frame_samples
                    )));
                }
            }
        }
    }

    fn emit(&mut self, frame: AudioFrame) -> AudioFrame {
        self.frames_produced += 1;
        if let Some(events) = &self.events {
            events.publish(Event::AudioLevel(frame.level()));
        }
        frame
    }

    /// Release the device; the source is exhausted afterwards
    fn finish(&mut self) {
        let first = !self.finished;
        self.finished = true;
        self.running.store(false, Ordering::SeqCst);
        self.pending.clear();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        let overruns = self.overruns.load(Ordering::Relaxed);
        if first && overruns > 0 {
            tracing::warn!("Capture dropped {} chunks while the consumer fell behind", overruns);
        }
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.finish();
    }

    pub fn is_running(&self) -> bool {
        !self.finished && self.running.load(Ordering::SeqCst)
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }
}

impl Iterator for FrameSource {
    type Item = Result<AudioFrame, AudioError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_frame_samples(frame_samples: usize) -> Result<(), AudioError> {
    if frame_samples == 0 {
        return Err(AudioError::UnsupportedFormat("frames of 0 samples".into()));
    }
    Ok(())
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: cpal::SampleFormat,
    chunk_tx: Sender<Vec<i16>>,
    error_tx: Sender<AudioError>,
    overruns: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        cpal::SampleFormat::I16 => build_typed::<i16>(device, config, chunk_tx, error_tx, overruns),
        cpal::SampleFormat::F32 => build_typed::<f32>(device, config, chunk_tx, error_tx, overruns),
        cpal::SampleFormat::U16 => build_typed::<u16>(device, config, chunk_tx, error_tx, overruns),
        cpal::SampleFormat::I32 => build_typed::<i32>(device, config, chunk_tx, error_tx, overruns),
        other => Err(AudioError::UnsupportedFormat(format!("input sample format {other:?}"))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunk_tx: Sender<Vec<i16>>,
    error_tx: Sender<AudioError>,
    overruns: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                if chunk_tx.try_send(mono).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::CaptureError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

/// Average interleaved channels into mono `i16`
fn downmix<T>(data: &[T], channels: usize) -> Vec<i16>
where
    T: Sample,
    i16: FromSample<T>,
{
    if channels == 1 {
        return data.iter().map(|&s| i16::from_sample(s)).collect();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i16::from_sample(s) as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_checked_first() {
        let result = FrameSource::open(&CaptureConfig::default(), false);
        assert!(matches!(result, Err(AudioError::PermissionDenied)));
    }

    #[test]
    fn test_rejects_empty_frames() {
        let (_tx, rx) = bounded::<Vec<i16>>(16);
        assert!(matches!(
            FrameSource::from_chunks(rx, 0),
            Err(AudioError::UnsupportedFormat(_))
        ));

        let config = CaptureConfig {
            frame_samples: 0,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            FrameSource::open(&config, true),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_regroups_chunks_into_frames() {
        let (tx, rx) = bounded(16);
        let mut source = FrameSource::from_chunks(rx, 4).unwrap();

        tx.send(vec![1, 2, 3]).unwrap();
        tx.send(vec![4, 5]).unwrap();
        tx.send(vec![6, 7, 8, 9]).unwrap();

        assert_eq!(source.next_frame().unwrap().unwrap().samples(), &[1, 2, 3, 4]);
        assert_eq!(source.next_frame().unwrap().unwrap().samples(), &[5, 6, 7, 8]);
        assert_eq!(source.frames_produced(), 2);
    }

    #[test]
    fn test_short_read_is_capture_error() {
        let (tx, rx) = bounded(16);
        let mut source = FrameSource::from_chunks(rx, 4).unwrap();

        tx.send(vec![1, 2, 3, 4, 5]).unwrap();
        drop(tx);

        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(source.next_frame(), Err(AudioError::CaptureError(_))));
        // the sequence is over
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_stop_ends_sequence() {
        let (tx, rx) = bounded(16);
        let mut source = FrameSource::from_chunks(rx, 4).unwrap();
        let stop = source.stop_handle();

        tx.send(vec![0; 4]).unwrap();
        assert!(source.next_frame().unwrap().is_some());

        stop.stop();
        tx.send(vec![0; 4]).unwrap();
        assert!(source.next_frame().unwrap().is_none());
        assert!(!source.is_running());
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_stop_unblocks_waiting_consumer() {
        let (_tx, rx) = bounded::<Vec<i16>>(16);
        let source = FrameSource::from_chunks(rx, 4).unwrap();
        let stop = source.stop_handle();

        let consumer = thread::spawn(move || source.count());
        thread::sleep(Duration::from_millis(50));
        stop.stop();

        assert_eq!(consumer.join().unwrap(), 0);
    }

    #[test]
    fn test_publishes_levels() {
        let events = EventBus::new();
        let levels = events.subscribe();
        let (tx, rx) = bounded(16);
        let mut source = FrameSource::from_chunks(rx, 2).unwrap().with_events(events);

        tx.send(vec![0, 0, i16::MAX, i16::MIN]).unwrap();
        source.next_frame().unwrap();
        source.next_frame().unwrap();

        assert_eq!(levels.try_recv().unwrap(), Event::AudioLevel(0.0));
        match levels.try_recv().unwrap() {
            Event::AudioLevel(level) => assert!((level - 1.0).abs() < 1e-4),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix(&[100i16, 300, -50, 50], 2), vec![200, 0]);
        let half = downmix(&[0.5f32], 1)[0];
        assert!((16383..=16384).contains(&half), "{half}");
    }
}
