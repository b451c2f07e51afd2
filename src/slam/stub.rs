use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

use super::trajectory::save_tum;
use super::{Pose, TrackingEngine};
use crate::frame::{DepthImage, IntensityImage};

/// Minimum tracked frames between two keyframes.
const KEYFRAME_INTERVAL: u64 = 5;

/// Stand-in engine for running the pipeline without a SLAM backend.
///
/// Reports the identity pose for every frame and records a keyframe whenever
/// the intensity image differs from the last keyframe's and at least
/// `KEYFRAME_INTERVAL` frames have passed.
#[derive(Debug, Default)]
pub struct StubEngine {
    keyframes: Vec<(f64, Pose)>,
    last_keyframe_hash: Option<[u8; 32]>,
    frames_since_keyframe: u64,
    frames_tracked: u64,
    shut_down: bool,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that the vocabulary and settings files a real engine would load are readable.
    pub fn load(vocabulary: &Path, settings: &Path) -> Result<Self> {
        for (what, path) in [("vocabulary", vocabulary), ("settings", settings)] {
            let meta = std::fs::metadata(path)
                .with_context(|| format!("read {} file {}", what, path.display()))?;
            if !meta.is_file() {
                bail!("{} path {} is not a file", what, path.display());
            }
            log::info!("StubEngine: {} {} ({} bytes)", what, path.display(), meta.len());
        }
        Ok(Self::new())
    }

    pub fn keyframes(&self) -> &[(f64, Pose)] {
        &self.keyframes
    }

    pub fn frames_tracked(&self) -> u64 {
        self.frames_tracked
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl TrackingEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn track_rgbd(
        &mut self,
        intensity: &IntensityImage,
        depth: &DepthImage,
        timestamp: f64,
    ) -> Result<Pose> {
        if self.shut_down {
            bail!("StubEngine: track after shutdown");
        }
        if intensity.dimensions() != depth.dimensions() {
            return Err(anyhow!(
                "StubEngine: intensity {:?} and depth {:?} differ in size",
                intensity.dimensions(),
                depth.dimensions()
            ));
        }

        self.frames_tracked += 1;
        self.frames_since_keyframe += 1;

        let hash: [u8; 32] = Sha256::digest(intensity.as_raw()).into();
        let due = match self.last_keyframe_hash {
            None => true,
            Some(prev) => prev != hash && self.frames_since_keyframe >= KEYFRAME_INTERVAL,
        };
        if due {
            self.keyframes.push((timestamp, Pose::identity()));
            self.last_keyframe_hash = Some(hash);
            self.frames_since_keyframe = 0;
        }
        Ok(Pose::identity())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.shut_down = true;
        log::info!(
            "StubEngine: shut down after {} frames, {} keyframes",
            self.frames_tracked,
            self.keyframes.len()
        );
        Ok(())
    }

    fn save_keyframe_trajectory(&self, path: &Path) -> Result<()> {
        save_tum(path, &self.keyframes)?;
        log::info!(
            "StubEngine: saved {} keyframes to {}",
            self.keyframes.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slam::trajectory::parse_tum;
    use image::{ImageBuffer, Luma};

    fn frame(value: u8) -> (IntensityImage, DepthImage) {
        (
            ImageBuffer::from_pixel(4, 4, Luma([value])),
            ImageBuffer::from_pixel(4, 4, Luma([1.0f32])),
        )
    }

    #[test]
    fn first_frame_is_a_keyframe() -> Result<()> {
        let mut engine = StubEngine::new();
        let (ir, depth) = frame(1);
        let pose = engine.track_rgbd(&ir, &depth, 0.0)?;
        assert_eq!(pose, Pose::identity());
        assert_eq!(engine.keyframes().len(), 1);
        Ok(())
    }

    #[test]
    fn static_scene_adds_no_keyframes() -> Result<()> {
        let mut engine = StubEngine::new();
        let (ir, depth) = frame(7);
        for i in 0..20 {
            engine.track_rgbd(&ir, &depth, i as f64 / 30.0)?;
        }
        assert_eq!(engine.frames_tracked(), 20);
        assert_eq!(engine.keyframes().len(), 1);
        Ok(())
    }

    #[test]
    fn changing_scene_adds_keyframes_at_interval() -> Result<()> {
        let mut engine = StubEngine::new();
        for i in 0..11u8 {
            let (ir, depth) = frame(i);
            engine.track_rgbd(&ir, &depth, i as f64)?;
        }
        let stamps: Vec<f64> = engine.keyframes().iter().map(|(t, _)| *t).collect();
        assert_eq!(stamps, vec![0.0, 5.0, 10.0]);
        Ok(())
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let mut engine = StubEngine::new();
        let ir: IntensityImage = ImageBuffer::new(4, 4);
        let depth: DepthImage = ImageBuffer::new(2, 2);
        assert!(engine.track_rgbd(&ir, &depth, 0.0).is_err());
    }

    #[test]
    fn tracking_after_shutdown_fails() -> Result<()> {
        let mut engine = StubEngine::new();
        engine.shutdown()?;
        let (ir, depth) = frame(1);
        assert!(engine.track_rgbd(&ir, &depth, 0.0).is_err());
        Ok(())
    }

    #[test]
    fn saves_keyframes_as_tum() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("KeyFrameTrajectory.txt");
        let mut engine = StubEngine::new();
        let (ir, depth) = frame(3);
        engine.track_rgbd(&ir, &depth, 0.25)?;
        engine.shutdown()?;
        engine.save_keyframe_trajectory(&path)?;

        let saved = parse_tum(&std::fs::read_to_string(&path)?)?;
        assert_eq!(saved, vec![(0.25, Pose::identity())]);
        Ok(())
    }

    #[test]
    fn load_requires_readable_files() -> Result<()> {
        let vocab = tempfile::NamedTempFile::new()?;
        let settings = tempfile::NamedTempFile::new()?;
        assert!(StubEngine::load(vocab.path(), settings.path()).is_ok());
        assert!(StubEngine::load(vocab.path(), Path::new("/nonexistent/settings.yaml")).is_err());
        let dir = tempfile::tempdir()?;
        assert!(StubEngine::load(dir.path(), settings.path()).is_err());
        Ok(())
    }
}
