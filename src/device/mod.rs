//! Depth camera sources.
//!
//! This module provides the `DepthCamera` capability and its implementations:
//! - Synthetic camera (`stub://` URIs) for tests and dry runs
//! - Intel RealSense devices (feature: ingest-realsense)
//!
//! A camera is started with a `StreamRequest` and answers with the
//! `PipelineProfile` it actually configured. After that the driver pulls
//! synchronized `FrameSet`s with a bounded wait and polls the active profile
//! to notice reconnects.

pub mod profile;
#[cfg(feature = "ingest-realsense")]
pub mod realsense;
pub mod synthetic;

use anyhow::Result;
use std::time::Duration;

use crate::error::DriverError;
use crate::frame::FrameSet;
use profile::{PixelFormat, StreamKind, StreamProfile};

#[cfg(feature = "ingest-realsense")]
pub use realsense::RealSenseCamera;
pub use synthetic::{Pacing, SyntheticCamera, SyntheticConfig};

/// One stream the caller wants enabled.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSpec {
    pub kind: StreamKind,
    /// `None` lets the device choose.
    pub index: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamRequest {
    pub streams: Vec<StreamSpec>,
}

impl StreamRequest {
    /// Left infrared (Y8) plus depth (Z16) at the same geometry and rate.
    pub fn infrared_depth(width: u32, height: u32, fps: u32) -> Self {
        Self {
            streams: vec![
                StreamSpec {
                    kind: StreamKind::Infrared,
                    index: Some(1),
                    width,
                    height,
                    format: PixelFormat::Y8,
                    fps,
                },
                StreamSpec {
                    kind: StreamKind::Depth,
                    index: None,
                    width,
                    height,
                    format: PixelFormat::Z16,
                    fps,
                },
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorKind {
    /// Reports meters per raw depth unit.
    Depth { depth_scale: f32 },
    Color,
    Motion,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorInfo {
    pub name: String,
    pub kind: SensorKind,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub serial: String,
    pub sensors: Vec<SensorInfo>,
}

/// What the device is streaming right now.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineProfile {
    pub device: DeviceInfo,
    pub streams: Vec<StreamProfile>,
}

impl PipelineProfile {
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamProfile> {
        profile::stream_of_kind(&self.streams, kind)
    }
}

/// Depth units of the first depth sensor on the device.
pub fn depth_scale(device: &DeviceInfo) -> Result<f32> {
    device
        .sensors
        .iter()
        .find_map(|sensor| match sensor.kind {
            SensorKind::Depth { depth_scale } => Some(depth_scale),
            _ => None,
        })
        .ok_or_else(|| DriverError::NoDepthSensor.into())
}

/// Device stream source consumed by the pipeline driver.
pub trait DepthCamera {
    /// Configure and start streaming. Returns the profile actually selected.
    fn start(&mut self, request: &StreamRequest) -> Result<PipelineProfile>;

    /// Block until the next synchronized frame set, at most `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>>;

    /// Profile currently in use. May differ from the one `start` returned.
    fn active_profile(&self) -> Result<PipelineProfile>;

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: DepthCamera + ?Sized> DepthCamera for Box<T> {
    fn start(&mut self, request: &StreamRequest) -> Result<PipelineProfile> {
        (**self).start(request)
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>> {
        (**self).wait_for_frames(timeout)
    }

    fn active_profile(&self) -> Result<PipelineProfile> {
        (**self).active_profile()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }
}

/// Camera selected by URI.
///
/// `stub://name` gives a real-time paced `SyntheticCamera`; `realsense://` or
/// `realsense://<serial>` needs the ingest-realsense feature.
pub struct Camera {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-realsense")]
    RealSense(RealSenseCamera),
}

impl Camera {
    pub fn open(uri: &str) -> Result<Self> {
        if let Some(name) = uri.strip_prefix("stub://") {
            let config = SyntheticConfig {
                name: name.to_string(),
                ..SyntheticConfig::default()
            };
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCamera::new(config, Pacing::RealTime)),
            });
        }
        if let Some(serial) = uri.strip_prefix("realsense://") {
            #[cfg(feature = "ingest-realsense")]
            {
                let serial = (!serial.is_empty()).then(|| serial.to_string());
                return Ok(Self {
                    backend: CameraBackend::RealSense(RealSenseCamera::new(serial)?),
                });
            }
            #[cfg(not(feature = "ingest-realsense"))]
            {
                let _ = serial;
                anyhow::bail!("realsense devices require the ingest-realsense feature");
            }
        }
        anyhow::bail!("unsupported device uri {} (expected stub:// or realsense://)", uri)
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.backend, CameraBackend::Synthetic(_))
    }
}

impl DepthCamera for Camera {
    fn start(&mut self, request: &StreamRequest) -> Result<PipelineProfile> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.start(request),
            #[cfg(feature = "ingest-realsense")]
            CameraBackend::RealSense(camera) => camera.start(request),
        }
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.wait_for_frames(timeout),
            #[cfg(feature = "ingest-realsense")]
            CameraBackend::RealSense(camera) => camera.wait_for_frames(timeout),
        }
    }

    fn active_profile(&self) -> Result<PipelineProfile> {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.active_profile(),
            #[cfg(feature = "ingest-realsense")]
            CameraBackend::RealSense(camera) => camera.active_profile(),
        }
    }

    fn stop(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.stop(),
            #[cfg(feature = "ingest-realsense")]
            CameraBackend::RealSense(camera) => camera.stop(),
        }
    }
}
