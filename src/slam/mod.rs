//! Tracking engine boundary.
//!
//! Feature extraction, pose estimation, mapping and loop closure all live
//! behind `TrackingEngine`. The driver only hands over converted frames and,
//! at the end of a run, asks the engine to stop its workers and persist the
//! keyframe trajectory.

pub mod stub;
pub mod trajectory;

use anyhow::Result;
use std::path::Path;

use crate::frame::{DepthImage, IntensityImage};

pub use stub::StubEngine;

/// Camera pose: translation in meters and a unit quaternion `[qx, qy, qz, qw]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// RGB-D tracking engine.
///
/// Engines may run internal worker threads; every call here is synchronous
/// from the caller's point of view.
pub trait TrackingEngine {
    /// Engine identifier for logs.
    fn name(&self) -> &'static str;

    /// Track one frame. `timestamp` is seconds since the start of the run.
    fn track_rgbd(
        &mut self,
        intensity: &IntensityImage,
        depth: &DepthImage,
        timestamp: f64,
    ) -> Result<Pose>;

    /// Stop internal workers. Called once, before saving.
    fn shutdown(&mut self) -> Result<()>;

    /// Persist the keyframe trajectory. The format is the engine's business.
    fn save_keyframe_trajectory(&self, path: &Path) -> Result<()>;
}

impl<T: TrackingEngine + ?Sized> TrackingEngine for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn track_rgbd(
        &mut self,
        intensity: &IntensityImage,
        depth: &DepthImage,
        timestamp: f64,
    ) -> Result<Pose> {
        (**self).track_rgbd(intensity, depth, timestamp)
    }

    fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown()
    }

    fn save_keyframe_trajectory(&self, path: &Path) -> Result<()> {
        (**self).save_keyframe_trajectory(path)
    }
}
