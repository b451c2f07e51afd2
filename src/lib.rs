//! RGB-D SLAM frame-pipeline driver
//!
//! Pulls synchronized infrared + depth frame sets from a depth camera,
//! converts them into an 8-bit intensity image and a depth map in meters,
//! and feeds them to a tracking engine under a wall-clock time budget.
//!
//! # Architecture
//!
//! - A fixed number of warm-up frames is discarded before anything is tracked.
//! - The time budget is checked before a frame reaches tracking; a frame that
//!   arrives at or after the deadline is never forwarded.
//! - The active stream profile is re-validated every iteration. When a stream
//!   disappears (device reconnect), depth scale and alignment target are
//!   recomputed in place and the loop continues.
//! - Frame waits are bounded; a device that stops delivering fails the run
//!   with `DriverError::DeviceStalled` instead of hanging it.
//!
//! # Module Structure
//!
//! - `device`: camera capability, stream profiles, synthetic and RealSense sources
//! - `frame`: raw frame sets and the converted `RgbdFrame`
//! - `convert`: raw buffers to intensity + meters, depth registration
//! - `driver`: the `PipelineDriver` state machine
//! - `slam`: tracking engine capability, stub engine, TUM trajectories
//! - `timing`: rolling frame rate and the run report
//! - `clock`: system and manual time sources
//! - `config`: file + environment configuration
//! - `error`: typed failures callers match on

pub mod clock;
pub mod config;
pub mod convert;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod slam;
pub mod timing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CliOverrides, DriverConfig};
pub use convert::FrameConverter;
pub use device::profile::{
    find_stream_to_align, profile_changed, Intrinsics, PixelFormat, StreamKind, StreamProfile,
};
pub use device::{
    Camera, DepthCamera, DeviceInfo, Pacing, PipelineProfile, SensorInfo, SensorKind,
    StreamRequest, StreamSpec, SyntheticCamera, SyntheticConfig,
};
pub use driver::{DriverSettings, DriverState, PipelineDriver};
pub use error::DriverError;
pub use frame::{DepthImage, FrameSet, IntensityImage, RawVideoFrame, RgbdFrame};
pub use slam::{Pose, StubEngine, TrackingEngine};
pub use timing::{RunReport, StopReason, TimingWindow};
