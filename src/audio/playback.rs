//! Audio playout to output devices
//!
//! `write` hands a frame to the device through a bounded queue. When the
//! queue is full the caller blocks until the device callback catches up, so
//! backpressure travels upstream instead of frames being dropped here.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::resolve_output;
use crate::audio::dsp::PlayoutProcessor;
use crate::audio::AudioFrame;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Destination for received frames
pub trait PlayoutSink: Send {
    /// Push one frame; may block while the device buffer is full
    fn write(&mut self, frame: AudioFrame) -> Result<(), AudioError>;

    /// Flush and release the device. Idempotent.
    fn close(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

impl<S: PlayoutSink + ?Sized> PlayoutSink for Box<S> {
    fn write(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        (**self).write(frame)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        (**self).close()
    }
}

/// Sink that forwards frames to a channel, for embedders that play audio
/// themselves (virtual devices, recorders, tests)
pub struct ChannelSink {
    tx: Option<Sender<AudioFrame>>,
    write_timeout: Option<Duration>,
}

impl ChannelSink {
    /// A full channel blocks `write`, like a device buffer would.
    ///
    /// Without a write timeout a consumer that stops draining also blocks
    /// the receive loop, and with it `ServerHandle::stop`.
    pub fn new(capacity: usize) -> (Self, Receiver<AudioFrame>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx: Some(tx),
                write_timeout: None,
            },
            rx,
        )
    }

    /// Fail a write that stays blocked longer than `timeout`
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

impl PlayoutSink for ChannelSink {
    fn write(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AudioError::PlayoutError("sink closed".into()))?;
        match self.write_timeout {
            Some(timeout) => tx.send_timeout(frame, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    AudioError::PlayoutError(format!("frame consumer stalled for {:?}", timeout))
                }
                SendTimeoutError::Disconnected(_) => AudioError::PlayoutError("frame receiver dropped".into()),
            }),
            None => tx
                .send(frame)
                .map_err(|_| AudioError::PlayoutError("frame receiver dropped".into())),
        }
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.tx.take();
        Ok(())
    }
}

/// Output device settings
#[derive(Debug, Clone)]
pub struct PlayoutConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_samples: usize,
    pub device_id: Option<String>,
    pub gain: f32,
    pub lowpass_hz: Option<f32>,
    pub queue_frames: usize,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

impl From<&AudioConfig> for PlayoutConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bits_per_sample: config.bits_per_sample,
            frame_samples: config.frame_samples,
            device_id: config.output_device.clone(),
            gain: config.playout_gain,
            lowpass_hz: config.lowpass(),
            queue_frames: config.playout_queue_frames.max(1),
        }
    }
}

/// Playout through a cpal output stream
pub struct CpalPlayout {
    tx: Option<Sender<Vec<f32>>>,
    processor: PlayoutProcessor,
    running: Arc<AtomicBool>,
    drained: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    error_rx: Receiver<AudioError>,
    thread: Option<JoinHandle<()>>,
    drain_timeout: Duration,
    device_name: String,
}

impl CpalPlayout {
    /// Open the selected output device (or the default one)
    pub fn open(config: &PlayoutConfig) -> Result<Self, AudioError> {
        if config.channels != 1 || config.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels, {} bits",
                config.channels, config.bits_per_sample
            )));
        }

        let device = resolve_output(config.device_id.as_deref())?;
        let device_name = device.name.clone();
        let default_config = device.default_output_config()?;
        let sample_format = default_config.sample_format();
        let device_channels = default_config.channels();

        // Mono frames are duplicated across every device channel
        let stream_config = StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = bounded::<Vec<f32>>(config.queue_frames);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let drained = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));

        let feed = OutputFeed {
            rx,
            current: Vec::new(),
            position: 0,
            drained: drained.clone(),
            underruns: underruns.clone(),
        };

        let running_for_loop = running.clone();
        let thread = thread::Builder::new()
            .name("audio-playout".into())
            .spawn(move || {
                let device = device.into_inner();
                let stream = match build_output_stream(&device, &stream_config, sample_format, feed, error_tx) {
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

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, releasing the device
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
                return Err(AudioError::DeviceUnavailable("playout thread exited".into()));
            }
        }

        tracing::info!(
            "Playout on {} ({} Hz, {} device channels, gain {:.1})",
            device_name,
            config.sample_rate,
            device_channels,
            config.gain
        );

        let frame_time = Duration::from_micros(
            (config.frame_samples as u64 * 1_000_000) / config.sample_rate.max(1) as u64,
        );

        Ok(Self {
            tx: Some(tx),
            processor: PlayoutProcessor::new(config.gain, config.lowpass_hz, config.sample_rate),
            running,
            drained,
            underruns,
            error_rx,
            thread: Some(thread),
            drain_timeout: frame_time * (config.queue_frames as u32 + 2) + Duration::from_millis(100),
            device_name,
        })
    }
}

impl PlayoutSink for CpalPlayout {
    fn write(&mut self, frame: AudioFrame) -> Result<(), AudioError> {
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(AudioError::PlayoutError(err.to_string()));
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AudioError::PlayoutError("playout closed".into()))?;

        let samples = self.processor.process(frame.samples());
        tx.send(samples)
            .map_err(|_| AudioError::PlayoutError("output stream stopped".into()))
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        // Hang up the queue and let the callback play what is left
        self.tx.take();
        let deadline = Instant::now() + self.drain_timeout;
        while !self.drained.load(Ordering::Relaxed) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        self.running.store(false, Ordering::SeqCst);
        thread
            .join()
            .map_err(|_| AudioError::PlayoutError("playout thread panicked".into()))?;

        tracing::debug!(
            "Playout on {} closed ({} underruns)",
            self.device_name,
            self.underruns.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

impl Drop for CpalPlayout {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// State owned by the output callback
struct OutputFeed {
    rx: Receiver<Vec<f32>>,
    current: Vec<f32>,
    position: usize,
    drained: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

impl OutputFeed {
    /// Next mono sample, silence on underrun
    fn next_sample(&mut self) -> f32 {
        if self.position >= self.current.len() {
            match self.rx.try_recv() {
                Ok(samples) => {
                    self.current = samples;
                    self.position = 0;
                }
                Err(TryRecvError::Empty) => {
                    self.underruns.fetch_add(1, Ordering::Relaxed);
                    return 0.0;
                }
                Err(TryRecvError::Disconnected) => {
                    self.drained.store(true, Ordering::Relaxed);
                    return 0.0;
                }
            }
        }

        match self.current.get(self.position) {
            Some(&sample) => {
                self.position += 1;
                sample
            }
            None => 0.0,
        }
    }

    fn fill<T: Sample + FromSample<f32>>(&mut self, data: &mut [T], channels: usize) {
        for frame in data.chunks_mut(channels) {
            let value = T::from_sample(self.next_sample());
            for out in frame.iter_mut() {
                *out = value;
            }
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: cpal::SampleFormat,
    feed: OutputFeed,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        cpal::SampleFormat::F32 => build_typed::<f32>(device, config, feed, error_tx),
        cpal::SampleFormat::I16 => build_typed::<i16>(device, config, feed, error_tx),
        cpal::SampleFormat::U16 => build_typed::<u16>(device, config, feed, error_tx),
        cpal::SampleFormat::I32 => build_typed::<i32>(device, config, feed, error_tx),
        other => Err(AudioError::UnsupportedFormat(format!("output sample format {other:?}"))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut feed: OutputFeed,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| feed.fill(data, channels),
            move |err| {
                let _ = error_tx.try_send(AudioError::PlayoutError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_PLAYOUT_GAIN;

    fn feed(capacity: usize) -> (OutputFeed, Sender<Vec<f32>>) {
        let (tx, rx) = bounded(capacity);
        let feed = OutputFeed {
            rx,
            current: Vec::new(),
            position: 0,
            drained: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicU64::new(0)),
        };
        (feed, tx)
    }

    #[test]
    fn test_feed_duplicates_mono_to_stereo() {
        let (mut feed, tx) = feed(4);
        tx.send(vec![0.5, -0.5]).unwrap();

        let mut out = [0.0f32; 6];
        feed.fill(&mut out, 2);

        assert_eq!(out, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert_eq!(feed.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_feed_reports_drained() {
        let (mut feed, tx) = feed(4);
        tx.send(vec![0.25]).unwrap();
        drop(tx);

        let mut out = [0.0f32; 2];
        feed.fill(&mut out, 1);

        assert_eq!(out, [0.25, 0.0]);
        assert!(feed.drained.load(Ordering::Relaxed));
    }

    #[test]
    fn test_channel_sink() {
        let (mut sink, rx) = ChannelSink::new(2);
        sink.write(AudioFrame::silence(4)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), AudioFrame::silence(4));

        sink.close().unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.write(AudioFrame::silence(4)),
            Err(AudioError::PlayoutError(_))
        ));
    }

    #[test]
    fn test_channel_sink_write_timeout() {
        let (sink, rx) = ChannelSink::new(1);
        let mut sink = sink.with_write_timeout(Duration::from_millis(20));

        sink.write(AudioFrame::silence(4)).unwrap();
        assert!(matches!(
            sink.write(AudioFrame::silence(4)),
            Err(AudioError::PlayoutError(_))
        ));

        rx.recv().unwrap();
        sink.write(AudioFrame::silence(4)).unwrap();
    }

    #[test]
    fn test_config_from_audio_config() {
        let mut audio = AudioConfig::default();
        audio.lowpass_hz = 0.0;
        audio.output_device = Some("output:Speakers".into());

        let config = PlayoutConfig::from(&audio);
        assert_eq!(config.lowpass_hz, None);
        assert_eq!(config.device_id.as_deref(), Some("output:Speakers"));
        assert_eq!(config.gain, DEFAULT_PLAYOUT_GAIN);
    }

    #[test]
    fn test_rejects_stereo() {
        let config = PlayoutConfig {
            channels: 2,
            ..PlayoutConfig::default()
        };
        assert!(matches!(
            CpalPlayout::open(&config),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }
}
