//! # PulseLink
//!
//! Low-latency mono microphone streaming from a capture device to a desktop
//! playback sink over LAN UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── SENDER ────────────────────────────┐
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐  │
//! │  │ Frame Source │───▶│   protocol   │───▶│ Transport Client │  │
//! │  │ (cpal input) │    │   encode()   │    │  probe + send    │  │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘  │
//! └───────────────────────────────────────────────────┼────────────┘
//!                                                     │ UDP [Seq BE|PCM LE]
//! ┌──────────────────────────── RECEIVER ─────────────┼────────────┐
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────▼─────────┐  │
//! │  │ Playout Sink │◀───│   protocol   │◀───│ Transport Server │  │
//! │  │(cpal output) │    │   decode()   │    │   recv loop      │  │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both halves are chained synchronously: capture blocks on send and the
//! receive loop blocks on playout. Observers subscribe to an [`events::EventBus`].

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate of the wire stream
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Bits per PCM sample
    pub const BITS_PER_SAMPLE: u16 = 16;

    /// Samples per frame (20 ms at 48 kHz)
    pub const DEFAULT_FRAME_SAMPLES: usize = 960;

    /// Default UDP port the receiver listens on
    pub const DEFAULT_UDP_PORT: u16 = 5555;

    /// Size of the big-endian sequence header
    pub const HEADER_LEN: usize = 4;

    /// Sequence number reserved for liveness probes
    pub const PROBE_SEQUENCE: u32 = u32::MAX;

    /// Bounded wait for the liveness probe send
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Socket timeout once connected
    pub const STEADY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Receive datagram buffer, larger than any valid packet
    pub const MAX_DATAGRAM_SIZE: usize = 2048;

    /// Kernel receive buffer requested by the server
    pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// Server read timeout used to poll the stop flag
    pub const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Silence after which the active sender is considered gone
    pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Packets between two packet-count events (one second of audio)
    pub const PACKET_COUNT_INTERVAL: u64 = 50;

    /// Frames queued towards the output device before `write` blocks
    pub const PLAYOUT_QUEUE_FRAMES: usize = 4;

    /// Playout gain applied on the desktop side
    pub const DEFAULT_PLAYOUT_GAIN: f32 = 4.0;

    /// Low-pass cutoff applied on the desktop side
    pub const DEFAULT_LOWPASS_HZ: f32 = 10_000.0;
}
