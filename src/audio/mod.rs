//! Audio subsystem module

pub mod buffer;
pub mod capture;
#[cfg(feature = "devices")]
pub mod device;
pub mod mixer;
pub mod playback;

pub use buffer::{create_shared_queue, FrameQueue, SharedFrameQueue};
pub use capture::{CaptureSource, SilentSource};
pub use mixer::{mix_frames, MixingEngine};
pub use playback::{NullSink, PlaybackSink};

#[cfg(feature = "devices")]
pub use capture::DeviceCapture;
#[cfg(feature = "devices")]
pub use device::{list_devices, DeviceInfo};
#[cfg(feature = "devices")]
pub use playback::DevicePlayback;
