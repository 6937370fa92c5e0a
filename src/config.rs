//! Configuration
//!
//! Loaded from `config.toml` in the platform config directory; every field
//! has a default so a partial or missing file is fine.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
}

/// Transport settings shared by sender and receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Receiver host the sender connects to
    pub host: String,
    pub port: u16,
    /// Address the receiver binds
    pub bind_address: String,
    pub probe_timeout_ms: u64,
    pub steady_timeout_ms: u64,
    pub recv_buffer_size: usize,
    pub client_idle_timeout_ms: u64,
    pub packet_count_interval: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_UDP_PORT,
            bind_address: "0.0.0.0".to_string(),
            probe_timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            steady_timeout_ms: STEADY_TIMEOUT.as_millis() as u64,
            recv_buffer_size: RECV_BUFFER_SIZE,
            client_idle_timeout_ms: CLIENT_IDLE_TIMEOUT.as_millis() as u64,
            packet_count_interval: PACKET_COUNT_INTERVAL,
        }
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn steady_timeout(&self) -> Duration {
        Duration::from_millis(self.steady_timeout_ms)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.client_idle_timeout_ms)
    }
}

/// Audio format and device selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frame_samples: usize,
    /// Opaque identifier from device discovery (`input:<name>`)
    pub input_device: Option<String>,
    /// Opaque identifier from device discovery (`output:<name>`)
    pub output_device: Option<String>,
    /// Linear gain applied before the output device
    pub playout_gain: f32,
    /// Low-pass cutoff for playout, `0` disables the filter
    pub lowpass_hz: f32,
    pub playout_queue_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            input_device: None,
            output_device: None,
            playout_gain: DEFAULT_PLAYOUT_GAIN,
            lowpass_hz: DEFAULT_LOWPASS_HZ,
            playout_queue_frames: PLAYOUT_QUEUE_FRAMES,
        }
    }
}

impl AudioConfig {
    /// Low-pass cutoff, if the filter is enabled
    pub fn lowpass(&self) -> Option<f32> {
        (self.lowpass_hz > 0.0).then_some(self.lowpass_hz)
    }
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "pulselink", "pulselink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// The wire format is fixed to mono 16-bit
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.channels != 1 {
            return Err(Error::Config(format!(
                "only mono is supported, got {} channels",
                audio.channels
            )));
        }
        if audio.bits_per_sample != 16 {
            return Err(Error::Config(format!(
                "only 16-bit samples are supported, got {}",
                audio.bits_per_sample
            )));
        }
        if audio.frame_samples == 0 || HEADER_LEN + audio.frame_samples * 2 > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "frame of {} samples does not fit a datagram",
                audio.frame_samples
            )));
        }
        if audio.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".into()));
        }
        if audio.playout_queue_frames == 0 {
            return Err(Error::Config("playout queue needs at least one frame".into()));
        }
        let cutoff = audio.lowpass_hz;
        if cutoff < 0.0 || cutoff >= audio.sample_rate as f32 / 2.0 {
            return Err(Error::Config(format!(
                "low-pass cutoff {cutoff} Hz must be below Nyquist"
            )));
        }
        if self.network.packet_count_interval == 0 {
            return Err(Error::Config("packet count interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.port, 5555);
        assert_eq!(config.audio.frame_samples, 960);
        assert_eq!(config.network.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.network.steady_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [network]
            host = "10.0.0.5"

            [audio]
            playout_gain = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(config.network.host, "10.0.0.5");
        assert_eq!(config.network.port, 5555);
        assert_eq!(config.audio.playout_gain, 1.0);
        assert_eq!(config.audio.sample_rate, 48000);
    }

    #[test]
    fn test_rejects_stereo() {
        let err = AppConfig::from_toml("[audio]\nchannels = 2\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let err = AppConfig::from_toml("[audio]\nframe_samples = 4096\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.network.port = 6000;
        config.audio.lowpass_hz = 0.0;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }
}
