//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod dsp;
pub mod frame;
pub mod loopback;
pub mod playback;

pub use capture::{CaptureConfig, FrameSource, StopHandle};
pub use device::{list_devices, get_device_by_id, AudioDevice, AudioDeviceInfo};
pub use frame::{rms_level, AudioFrame};
pub use loopback::Loopback;
pub use playback::{ChannelSink, CpalPlayout, PlayoutConfig, PlayoutSink};
