//! Local loopback: microphone straight to an output device
//!
//! Same capture and playout stages as the network path, chained on one
//! thread without the transport in between.

use std::thread::{self, JoinHandle};

use crate::audio::{CaptureConfig, CpalPlayout, FrameSource, PlayoutConfig, PlayoutSink, StopHandle};
use crate::error::{AudioError, Result};
use crate::events::{Event, EventBus};

/// Running mic-to-speakers pipeline
pub struct Loopback {
    stop: StopHandle,
    thread: Option<JoinHandle<std::result::Result<u64, AudioError>>>,
}

impl Loopback {
    /// Open both devices and start routing.
    ///
    /// Local playback needs no capture consent beyond opening the device.
    pub fn start(capture: CaptureConfig, playout: PlayoutConfig, events: EventBus) -> Result<Self> {
        let source = FrameSource::open(&capture, true)?.with_events(events.clone());
        let sink = CpalPlayout::open(&playout)?;
        Self::with_parts(source, sink, events)
    }

    /// Route an already opened source into any sink
    pub fn with_parts<S: PlayoutSink + 'static>(source: FrameSource, sink: S, events: EventBus) -> Result<Self> {
        let stop = source.stop_handle();
        let thread = thread::Builder::new()
            .name("audio-loopback".into())
            .spawn(move || run(source, sink, events))?;

        tracing::info!("Loopback started");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop routing and release both devices. Idempotent; returns the
    /// number of frames played.
    pub fn stop(&mut self) -> Result<u64> {
        self.stop.stop();
        match self.thread.take() {
            Some(thread) => {
                let played = thread
                    .join()
                    .unwrap_or_else(|_| Err(AudioError::PlayoutError("loopback thread panicked".into())))?;
                tracing::info!("Loopback stopped after {} frames", played);
                Ok(played)
            }
            None => Ok(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run<S: PlayoutSink>(source: FrameSource, mut sink: S, events: EventBus) -> std::result::Result<u64, AudioError> {
    let mut played = 0u64;
    let mut outcome = Ok(());

    for frame in source {
        match frame.and_then(|frame| sink.write(frame)) {
            Ok(()) => played += 1,
            Err(e) => {
                tracing::error!("Loopback failed: {}", e);
                events.publish(Event::Error(e.to_string()));
                outcome = Err(e);
                break;
            }
        }
    }

    let closed = sink.close();
    events.publish(Event::AudioLevel(0.0));
    outcome?;
    closed?;
    Ok(played)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, ChannelSink};
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_routes_frames_until_stopped() {
        let (chunks_tx, chunks_rx) = bounded(8);
        let source = FrameSource::from_chunks(chunks_rx, 4).unwrap();
        let (sink, frames) = ChannelSink::new(8);
        let mut loopback = Loopback::with_parts(source, sink, EventBus::new()).unwrap();

        chunks_tx.send(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let timeout = Duration::from_secs(2);
        assert_eq!(frames.recv_timeout(timeout).unwrap(), AudioFrame::new(vec![1, 2, 3, 4]));
        assert_eq!(frames.recv_timeout(timeout).unwrap(), AudioFrame::new(vec![5, 6, 7, 8]));

        assert_eq!(loopback.stop().unwrap(), 2);
        assert_eq!(loopback.stop().unwrap(), 0);
        assert!(loopback.is_finished());
    }

    #[test]
    fn test_capture_error_is_published() {
        let events = EventBus::new();
        let rx = events.subscribe();
        let (chunks_tx, chunks_rx) = bounded::<Vec<i16>>(8);
        let source = FrameSource::from_chunks(chunks_rx, 4).unwrap();
        let (sink, _frames) = ChannelSink::new(8);
        let mut loopback = Loopback::with_parts(source, sink, events).unwrap();

        drop(chunks_tx);
        while !loopback.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(loopback.stop().is_err());
        assert!(rx.try_iter().any(|e| matches!(e, Event::Error(_))));
    }
}
