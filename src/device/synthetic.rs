//! Synthetic depth camera (`stub://`).
//!
//! Produces an infrared gradient and a tilted depth plane with a little
//! sensor noise, at the requested geometry and rate. Frames are paced either
//! against the wall clock or against a shared `ManualClock`, which lets tests
//! reproduce exact frame timing.
//!
//! Two device faults can be scripted:
//! - `reconnect_after`: after N frame sets the device "reconnects" and every
//!   stream comes back under a new unique id (optionally with a new depth scale)
//! - `stall_after`: after N frame sets every wait times out

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use super::profile::{Intrinsics, PixelFormat, StreamKind, StreamProfile};
use super::{DepthCamera, DeviceInfo, PipelineProfile, SensorInfo, SensorKind, StreamRequest};
use crate::clock::ManualClock;
use crate::frame::{FrameSet, RawVideoFrame};

/// Raw depth units per meter at the default scale.
const UNITS_PER_METER: u16 = 1000;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    /// Meters per raw depth unit.
    pub depth_scale: f32,
    /// Also stream an RGB8 color sensor.
    pub with_color: bool,
    pub reconnect_after: Option<u64>,
    /// Depth scale reported after the reconnect; defaults to `depth_scale`.
    pub reconnect_depth_scale: Option<f32>,
    pub stall_after: Option<u64>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "rgbd".to_string(),
            depth_scale: 0.001,
            with_color: false,
            reconnect_after: None,
            reconnect_depth_scale: None,
            stall_after: None,
            seed: 0x5eed,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Pacing {
    /// Sleep until the next frame is due.
    RealTime,
    /// Advance the shared clock by one frame interval per frame set.
    Simulated(ManualClock),
}

pub struct SyntheticCamera {
    config: SyntheticConfig,
    pacing: Pacing,
    request: Option<StreamRequest>,
    profile: Option<PipelineProfile>,
    next_unique_id: u32,
    frames_delivered: u64,
    reconnected: bool,
    next_deadline: Option<Instant>,
    rng: StdRng,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig, pacing: Pacing) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            pacing,
            request: None,
            profile: None,
            next_unique_id: 1,
            frames_delivered: 0,
            reconnected: false,
            next_deadline: None,
            rng,
        }
    }

    /// Frame sets handed out since the last `start`.
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    fn build_profile(&mut self, request: &StreamRequest, depth_scale: f32) -> PipelineProfile {
        let mut streams = Vec::with_capacity(request.streams.len() + 1);
        for spec in &request.streams {
            streams.push(self.stream_profile(
                spec.kind,
                spec.index.unwrap_or(0),
                spec.format,
                spec.width,
                spec.height,
                spec.fps,
            ));
        }
        let has_color = request.streams.iter().any(|s| s.kind == StreamKind::Color);
        if self.config.with_color && !has_color {
            let (width, height, fps) = streams
                .first()
                .map(|s| (s.width, s.height, s.fps))
                .unwrap_or((640, 480, 30));
            streams.push(self.stream_profile(
                StreamKind::Color,
                0,
                PixelFormat::Rgb8,
                width,
                height,
                fps,
            ));
        }

        let mut sensors = vec![SensorInfo {
            name: "Stereo Module".to_string(),
            kind: SensorKind::Depth { depth_scale },
        }];
        if streams.iter().any(|s| s.kind == StreamKind::Color) {
            sensors.push(SensorInfo {
                name: "RGB Camera".to_string(),
                kind: SensorKind::Color,
            });
        }

        PipelineProfile {
            device: DeviceInfo {
                name: format!("Synthetic RGBD ({})", self.config.name),
                serial: format!("stub-{}", self.config.name),
                sensors,
            },
            streams,
        }
    }

    fn stream_profile(
        &mut self,
        kind: StreamKind,
        index: u32,
        format: PixelFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> StreamProfile {
        let unique_id = self.next_unique_id;
        self.next_unique_id += 1;
        StreamProfile {
            kind,
            index,
            unique_id,
            format,
            width,
            height,
            fps,
            intrinsics: Some(synthetic_intrinsics(width, height)),
        }
    }

    fn frame_interval(&self) -> Duration {
        let fps = self
            .profile
            .as_ref()
            .and_then(|p| p.streams.first())
            .map(|s| s.fps)
            .unwrap_or(30)
            .max(1);
        Duration::from_secs_f64(1.0 / fps as f64)
    }

    fn pace(&mut self) {
        let interval = self.frame_interval();
        match &self.pacing {
            Pacing::Simulated(clock) => clock.advance(interval),
            Pacing::RealTime => {
                let now = Instant::now();
                let due = match self.next_deadline {
                    Some(deadline) if deadline > now => deadline,
                    _ => now,
                };
                if due > now {
                    std::thread::sleep(due - now);
                }
                self.next_deadline = Some(due + interval);
            }
        }
    }

    fn simulate_timeout(&self, timeout: Duration) {
        match &self.pacing {
            Pacing::Simulated(clock) => clock.advance(timeout),
            Pacing::RealTime => std::thread::sleep(timeout),
        }
    }

    fn reconnect(&mut self) {
        let Some(request) = self.request.clone() else {
            return;
        };
        let depth_scale = self
            .config
            .reconnect_depth_scale
            .unwrap_or(self.config.depth_scale);
        let profile = self.build_profile(&request, depth_scale);
        log::warn!(
            "SyntheticCamera: {} reconnected (simulated), depth scale {}",
            self.config.name,
            depth_scale
        );
        self.profile = Some(profile);
        self.reconnected = true;
    }

    fn render(&mut self, stream: &StreamProfile) -> RawVideoFrame {
        let w = stream.width as usize;
        let h = stream.height as usize;
        let t = self.frames_delivered as usize;
        let data = match stream.format {
            PixelFormat::Y8 => {
                let mut pixels = vec![0u8; w * h];
                for (i, pixel) in pixels.iter_mut().enumerate() {
                    let (x, y) = (i % w, i / w);
                    *pixel = ((x + y + t) % 256) as u8;
                }
                pixels
            }
            PixelFormat::Z16 => {
                let mut bytes = Vec::with_capacity(w * h * 2);
                for y in 0..h {
                    for x in 0..w {
                        // Invalid band on the left edge, like a stereo shadow.
                        let raw = if x < 2 {
                            0u16
                        } else {
                            let ramp = (y * UNITS_PER_METER as usize / h.max(1)) as u16;
                            UNITS_PER_METER + ramp + self.rng.gen_range(0..4u16)
                        };
                        bytes.extend_from_slice(&raw.to_le_bytes());
                    }
                }
                bytes
            }
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                let mut pixels = vec![0u8; w * h * 3];
                for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
                    let (x, y) = (i % w, i / w);
                    px[0] = ((x + t) % 256) as u8;
                    px[1] = ((y + t) % 256) as u8;
                    px[2] = ((x + y) % 256) as u8;
                }
                pixels
            }
        };
        RawVideoFrame {
            kind: stream.kind,
            index: stream.index,
            profile_id: stream.unique_id,
            format: stream.format,
            width: stream.width,
            height: stream.height,
            data,
        }
    }
}

impl DepthCamera for SyntheticCamera {
    fn start(&mut self, request: &StreamRequest) -> Result<PipelineProfile> {
        if request.streams.is_empty() {
            bail!("SyntheticCamera: stream request is empty");
        }
        if let Some(spec) = request
            .streams
            .iter()
            .find(|s| s.width == 0 || s.height == 0 || s.fps == 0)
        {
            bail!(
                "SyntheticCamera: invalid {} stream {}x{}@{}",
                spec.kind,
                spec.width,
                spec.height,
                spec.fps
            );
        }
        let profile = self.build_profile(request, self.config.depth_scale);
        self.request = Some(request.clone());
        self.profile = Some(profile.clone());
        self.frames_delivered = 0;
        self.reconnected = false;
        self.next_deadline = None;
        log::info!(
            "SyntheticCamera: started {} ({} streams)",
            self.config.name,
            profile.streams.len()
        );
        Ok(profile)
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>> {
        if self.profile.is_none() {
            bail!("SyntheticCamera: wait_for_frames before start");
        }
        if let Some(limit) = self.config.stall_after {
            if self.frames_delivered >= limit {
                self.simulate_timeout(timeout);
                return Ok(None);
            }
        }
        if let Some(limit) = self.config.reconnect_after {
            if !self.reconnected && self.frames_delivered >= limit {
                self.reconnect();
            }
        }

        self.pace();

        let streams = match &self.profile {
            Some(profile) => profile.streams.clone(),
            None => bail!("SyntheticCamera: profile missing"),
        };
        let frames = streams.iter().map(|s| self.render(s)).collect();
        self.frames_delivered += 1;
        Ok(Some(FrameSet {
            frame_number: self.frames_delivered,
            frames,
        }))
    }

    fn active_profile(&self) -> Result<PipelineProfile> {
        match &self.profile {
            Some(profile) => Ok(profile.clone()),
            None => bail!("SyntheticCamera: not started"),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.profile = None;
        self.next_deadline = None;
        log::info!("SyntheticCamera: stopped {}", self.config.name);
        Ok(())
    }
}

/// Plausible intrinsics for a ~87 degree horizontal field of view.
fn synthetic_intrinsics(width: u32, height: u32) -> Intrinsics {
    let focal = width as f32 * 0.6;
    Intrinsics {
        width,
        height,
        ppx: width as f32 / 2.0,
        ppy: height as f32 / 2.0,
        fx: focal,
        fy: focal,
        coeffs: [0.0; 5],
    }
}
