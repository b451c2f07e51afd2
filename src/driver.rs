//! Pipeline driver: warm-up, time-budgeted tracking loop, shutdown.
//!
//! ```text
//! Idle --start--> WarmingUp --warm_up--> Running --track--> Stopped --finish--> report
//! ```
//!
//! The loop runs on the caller's thread. The only blocking point per
//! iteration is the bounded frame wait. Elapsed time is compared against the
//! budget before a frame is handed to tracking, so a frame that arrives at or
//! after the deadline is never forwarded.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::convert::FrameConverter;
use crate::device::profile::{profile_changed, StreamKind, StreamProfile};
use crate::device::{DepthCamera, PipelineProfile, StreamRequest};
use crate::error::DriverError;
use crate::frame::FrameSet;
use crate::slam::TrackingEngine;
use crate::timing::{RunReport, StopReason, TimingWindow};

pub const DEFAULT_WARMUP_FRAMES: u64 = 30;
pub const DEFAULT_TRAJECTORY_PATH: &str = "KeyFrameTrajectory.txt";

/// Frame intervals to wait before declaring the device stalled.
const STALL_INTERVALS: u32 = 4;
const MIN_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq)]
pub struct DriverSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub time_budget: Duration,
    pub warmup_frames: u64,
    pub frame_timeout: Duration,
    pub trajectory_path: PathBuf,
}

impl DriverSettings {
    pub fn new(width: u32, height: u32, fps: u32, time_budget: Duration) -> Self {
        Self {
            width,
            height,
            fps,
            time_budget,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            frame_timeout: default_frame_timeout(fps),
            trajectory_path: PathBuf::from(DEFAULT_TRAJECTORY_PATH),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::new(640, 480, 30, Duration::from_secs(30))
    }
}

/// Four frame intervals, never less than half a second.
pub fn default_frame_timeout(fps: u32) -> Duration {
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    (interval * STALL_INTERVALS).max(MIN_FRAME_TIMEOUT)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    WarmingUp,
    Running,
    Stopped,
}

pub struct PipelineDriver<C, E, K = SystemClock> {
    camera: C,
    engine: E,
    clock: K,
    settings: DriverSettings,
    state: DriverState,
    cancel: Option<Arc<AtomicBool>>,
    converter: Option<FrameConverter>,
    active_streams: Vec<StreamProfile>,
    window: TimingWindow,
    frames_forwarded: u64,
    frames_dropped: u64,
    warmup_discarded: u64,
    reconfigurations: u64,
    total_track_time: Duration,
    last_timestamp: Option<f64>,
    stop_reason: Option<StopReason>,
    engine_shut_down: bool,
}

impl<C: DepthCamera, E: TrackingEngine> PipelineDriver<C, E, SystemClock> {
    pub fn new(camera: C, engine: E, settings: DriverSettings) -> Self {
        Self::with_clock(camera, engine, SystemClock::new(), settings)
    }
}

impl<C: DepthCamera, E: TrackingEngine, K: Clock> PipelineDriver<C, E, K> {
    pub fn with_clock(camera: C, engine: E, clock: K, settings: DriverSettings) -> Self {
        Self {
            camera,
            engine,
            clock,
            settings,
            state: DriverState::Idle,
            cancel: None,
            converter: None,
            active_streams: Vec::new(),
            window: TimingWindow::new(),
            frames_forwarded: 0,
            frames_dropped: 0,
            warmup_discarded: 0,
            reconfigurations: 0,
            total_track_time: Duration::ZERO,
            last_timestamp: None,
            stop_reason: None,
            engine_shut_down: false,
        }
    }

    /// Stop the loop early once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn converter(&self) -> Option<&FrameConverter> {
        self.converter.as_ref()
    }

    /// Start, warm up, track until stopped, then shut down and save.
    pub fn run(&mut self) -> Result<RunReport> {
        self.start()?;
        self.warm_up()?;
        self.track()?;
        self.finish()
    }

    /// Start streaming and validate the device configuration.
    ///
    /// Configuration errors surface here, before any frame is read. The
    /// engine is shut down on failure.
    pub fn start(&mut self) -> Result<()> {
        if self.state != DriverState::Idle {
            bail!("start called in state {:?}", self.state);
        }
        let request =
            StreamRequest::infrared_depth(self.settings.width, self.settings.height, self.settings.fps);
        let started = self.camera.start(&request).and_then(|profile| {
            let converter = FrameConverter::for_profile(&profile)?;
            Ok((profile, converter))
        });
        let (profile, converter) = match started {
            Ok(started) => started,
            Err(e) => return Err(self.abort(e)),
        };
        log::info!(
            "driver: {} ({}) streaming {}x{}@{} to {} engine, depth scale {}, aligning to {}",
            profile.device.name,
            profile.device.serial,
            self.settings.width,
            self.settings.height,
            self.settings.fps,
            self.engine.name(),
            converter.depth_scale(),
            converter.target()
        );
        log_depth_intrinsics(&profile);

        self.converter = Some(converter);
        self.active_streams = profile.streams;
        self.state = DriverState::WarmingUp;
        Ok(())
    }

    /// Discard the first frames while auto-exposure settles.
    pub fn warm_up(&mut self) -> Result<()> {
        if self.state != DriverState::WarmingUp {
            bail!("warm_up called in state {:?}", self.state);
        }
        while self.warmup_discarded < self.settings.warmup_frames {
            if self.cancelled() {
                log::info!("driver: cancelled during warm-up");
                break;
            }
            if let Err(e) = self.next_frame_set() {
                return Err(self.abort(e));
            }
            self.warmup_discarded += 1;
        }
        log::debug!("driver: discarded {} warm-up frames", self.warmup_discarded);
        self.state = DriverState::Running;
        Ok(())
    }

    /// Forward frames to tracking until the budget runs out or the run is cancelled.
    pub fn track(&mut self) -> Result<StopReason> {
        if self.state != DriverState::Running {
            bail!("track called in state {:?}", self.state);
        }
        let t0 = self.clock.now();
        let reason = loop {
            match self.step(t0) {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(e) => return Err(self.abort(e)),
            }
        };
        log::info!(
            "driver: stopped after {} frames ({})",
            self.frames_forwarded,
            reason
        );
        self.stop_reason = Some(reason);
        self.state = DriverState::Stopped;
        Ok(reason)
    }

    /// Shut the engine down, persist its trajectory and report.
    pub fn finish(&mut self) -> Result<RunReport> {
        let Some(reason) = self.stop_reason else {
            bail!("finish called in state {:?}", self.state);
        };
        if self.engine_shut_down {
            bail!("engine already shut down");
        }
        self.stop_camera();
        self.engine_shut_down = true;
        self.engine.shutdown()?;
        self.engine
            .save_keyframe_trajectory(&self.settings.trajectory_path)?;
        let report = self.report(reason);
        log::info!("{}", report);
        Ok(report)
    }

    pub fn report(&self, stop_reason: StopReason) -> RunReport {
        RunReport {
            frames_forwarded: self.frames_forwarded,
            frames_dropped: self.frames_dropped,
            warmup_frames: self.warmup_discarded,
            reconfigurations: self.reconfigurations,
            total_track_time: self.total_track_time,
            time_budget: self.settings.time_budget,
            stop_reason,
            last_timestamp: self.last_timestamp,
            rolling_fps: self.window.rolling_fps(),
        }
    }

    /// One loop iteration. `Some` when the run should stop.
    fn step(&mut self, t0: Duration) -> Result<Option<StopReason>> {
        if self.cancelled() {
            return Ok(Some(StopReason::Cancelled));
        }
        let set = self.next_frame_set()?;
        self.revalidate_profile()?;

        // Every wait counts against the budget, including sets dropped below.
        let elapsed = self.clock.now().saturating_sub(t0);
        if elapsed >= self.settings.time_budget {
            return Ok(Some(StopReason::BudgetExhausted));
        }
        if self.cancelled() {
            return Ok(Some(StopReason::Cancelled));
        }

        let Some(converter) = self.converter.as_ref() else {
            bail!("driver has no frame converter");
        };
        let Some(frame) = converter.convert(&set)? else {
            self.frames_dropped += 1;
            log::debug!(
                "driver: dropped frame set {} ({} frames, missing {} or depth)",
                set.frame_number,
                set.len(),
                converter.target()
            );
            return Ok(None);
        };

        let timestamp = elapsed.as_secs_f64();
        let t1 = self.clock.now();
        self.engine
            .track_rgbd(&frame.intensity, &frame.depth, timestamp)?;
        let latency = self.clock.now().saturating_sub(t1);

        self.total_track_time += latency;
        self.frames_forwarded += 1;
        self.last_timestamp = Some(timestamp);
        self.window.push(timestamp);
        log::trace!(
            "driver: frame {} t={:.4}s track={:.4}s fps={:.2}",
            self.frames_forwarded,
            timestamp,
            latency.as_secs_f64(),
            self.window.rolling_fps().unwrap_or(0.0)
        );
        Ok(None)
    }

    fn next_frame_set(&mut self) -> Result<FrameSet> {
        let timeout = self.settings.frame_timeout;
        match self.camera.wait_for_frames(timeout)? {
            Some(set) => Ok(set),
            None => Err(DriverError::DeviceStalled { waited: timeout }.into()),
        }
    }

    /// Rebuild the converter when a previously active stream went away.
    fn revalidate_profile(&mut self) -> Result<()> {
        let current = self.camera.active_profile()?;
        if !profile_changed(&current.streams, &self.active_streams) {
            return Ok(());
        }
        let converter = FrameConverter::for_profile(&current)?;
        log::warn!(
            "driver: stream profile changed, reconfigured (depth scale {}, aligning to {})",
            converter.depth_scale(),
            converter.target()
        );
        log_depth_intrinsics(&current);
        self.converter = Some(converter);
        self.active_streams = current.streams;
        self.reconfigurations += 1;
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Leave the run after a fatal error. The engine is still shut down.
    fn abort(&mut self, err: anyhow::Error) -> anyhow::Error {
        log::error!("driver: {}", err);
        self.state = DriverState::Stopped;
        self.stop_camera();
        if !self.engine_shut_down {
            self.engine_shut_down = true;
            if let Err(e) = self.engine.shutdown() {
                log::warn!("driver: engine shutdown failed: {}", e);
            }
        }
        err
    }

    fn stop_camera(&mut self) {
        if let Err(e) = self.camera.stop() {
            log::warn!("driver: camera stop failed: {}", e);
        }
    }
}

fn log_depth_intrinsics(profile: &PipelineProfile) {
    let Some(depth) = profile.stream(StreamKind::Depth) else {
        return;
    };
    log::info!("driver: depth stream {}x{}", depth.width, depth.height);
    if let Some(i) = depth.intrinsics {
        let [k1, k2, p1, p2, k3] = i.coeffs;
        log::info!(
            "driver: depth intrinsics ppx={} ppy={} fx={} fy={} k1={} k2={} p1={} p2={} k3={}",
            i.ppx,
            i.ppy,
            i.fx,
            i.fy,
            k1,
            k2,
            p1,
            p2,
            k3
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::profile::PixelFormat;
    use crate::device::{DeviceInfo, SensorInfo, SensorKind};
    use crate::frame::{DepthImage, IntensityImage, RawVideoFrame};
    use crate::slam::Pose;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    const W: u32 = 4;
    const H: u32 = 3;

    fn stream(kind: StreamKind, unique_id: u32, format: PixelFormat) -> StreamProfile {
        StreamProfile {
            kind,
            index: if kind == StreamKind::Infrared { 1 } else { 0 },
            unique_id,
            format,
            width: W,
            height: H,
            fps: 30,
            intrinsics: None,
        }
    }

    fn profile(with_depth_sensor: bool) -> PipelineProfile {
        let mut sensors = Vec::new();
        if with_depth_sensor {
            sensors.push(SensorInfo {
                name: "Stereo Module".into(),
                kind: SensorKind::Depth { depth_scale: 0.001 },
            });
        }
        PipelineProfile {
            device: DeviceInfo {
                name: "mock".into(),
                serial: "0".into(),
                sensors,
            },
            streams: vec![
                stream(StreamKind::Depth, 1, PixelFormat::Z16),
                stream(StreamKind::Infrared, 2, PixelFormat::Y8),
            ],
        }
    }

    /// Delivers a frame set every 1/30 s of manual time.
    struct MockCamera {
        clock: ManualClock,
        profile: PipelineProfile,
        delivered: u64,
        drop_depth_every: Option<u64>,
        stall_after: Option<u64>,
        stopped: bool,
    }

    impl MockCamera {
        fn new(clock: ManualClock) -> Self {
            Self {
                clock,
                profile: profile(true),
                delivered: 0,
                drop_depth_every: None,
                stall_after: None,
                stopped: false,
            }
        }
    }

    impl DepthCamera for MockCamera {
        fn start(&mut self, _request: &StreamRequest) -> Result<PipelineProfile> {
            Ok(self.profile.clone())
        }

        fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>> {
            if self.stall_after.is_some_and(|n| self.delivered >= n) {
                self.clock.advance(timeout);
                return Ok(None);
            }
            self.clock.advance(Duration::from_secs_f64(1.0 / 30.0));
            self.delivered += 1;
            let mut frames = vec![RawVideoFrame {
                kind: StreamKind::Infrared,
                index: 1,
                profile_id: 2,
                format: PixelFormat::Y8,
                width: W,
                height: H,
                data: vec![self.delivered as u8; (W * H) as usize],
            }];
            let drop_depth = self
                .drop_depth_every
                .is_some_and(|n| self.delivered % n == 0);
            if !drop_depth {
                frames.push(RawVideoFrame {
                    kind: StreamKind::Depth,
                    index: 0,
                    profile_id: 1,
                    format: PixelFormat::Z16,
                    width: W,
                    height: H,
                    data: [0xe8u8, 0x03].repeat((W * H) as usize),
                });
            }
            Ok(Some(FrameSet {
                frame_number: self.delivered,
                frames,
            }))
        }

        fn active_profile(&self) -> Result<PipelineProfile> {
            Ok(self.profile.clone())
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Calls {
        tracked: Vec<f64>,
        depth_at_center: Vec<f32>,
        events: Vec<&'static str>,
        saved_to: Option<PathBuf>,
    }

    /// Records calls; each track call costs `cost` of manual time.
    struct MockEngine {
        calls: Rc<RefCell<Calls>>,
        clock: ManualClock,
        cost: Duration,
    }

    impl TrackingEngine for MockEngine {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn track_rgbd(
            &mut self,
            _intensity: &IntensityImage,
            depth: &DepthImage,
            timestamp: f64,
        ) -> Result<Pose> {
            self.clock.advance(self.cost);
            let mut calls = self.calls.borrow_mut();
            calls.tracked.push(timestamp);
            calls.depth_at_center.push(depth.get_pixel(1, 1)[0]);
            Ok(Pose::identity())
        }

        fn shutdown(&mut self) -> Result<()> {
            self.calls.borrow_mut().events.push("shutdown");
            Ok(())
        }

        fn save_keyframe_trajectory(&self, path: &Path) -> Result<()> {
            let mut calls = self.calls.borrow_mut();
            calls.events.push("save");
            calls.saved_to = Some(path.to_path_buf());
            Ok(())
        }
    }

    fn driver(
        budget: Duration,
        warmup: u64,
        tweak: impl FnOnce(&mut MockCamera),
    ) -> (
        PipelineDriver<MockCamera, MockEngine, ManualClock>,
        Rc<RefCell<Calls>>,
    ) {
        let clock = ManualClock::new();
        let mut camera = MockCamera::new(clock.clone());
        tweak(&mut camera);
        let calls = Rc::new(RefCell::new(Calls::default()));
        let engine = MockEngine {
            calls: calls.clone(),
            clock: clock.clone(),
            cost: Duration::from_millis(2),
        };
        let mut settings = DriverSettings::new(W, H, 30, budget);
        settings.warmup_frames = warmup;
        (
            PipelineDriver::with_clock(camera, engine, clock, settings),
            calls,
        )
    }

    #[test]
    fn default_timeout_is_bounded_below() {
        assert_eq!(default_frame_timeout(30), MIN_FRAME_TIMEOUT);
        assert_eq!(default_frame_timeout(1), Duration::from_secs(4));
    }

    #[test]
    fn run_forwards_frames_until_budget() -> Result<()> {
        let (mut driver, calls) = driver(Duration::from_millis(500), 5, |_| {});
        let report = driver.run()?;

        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(report.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(report.warmup_frames, 5);
        assert!(report.frames_forwarded > 0);
        let calls = calls.borrow();
        assert_eq!(calls.tracked.len() as u64, report.frames_forwarded);
        assert!(calls.tracked.iter().all(|t| *t < 0.5));
        assert!(calls.tracked.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(calls.events, vec!["shutdown", "save"]);
        assert_eq!(
            calls.saved_to.as_deref(),
            Some(Path::new(DEFAULT_TRAJECTORY_PATH))
        );
        assert_eq!(
            report.total_track_time,
            Duration::from_millis(2) * report.frames_forwarded as u32
        );
        assert!(driver.camera().stopped);
        Ok(())
    }

    #[test]
    fn depth_is_scaled_to_meters() -> Result<()> {
        let (mut driver, calls) = driver(Duration::from_millis(200), 0, |_| {});
        driver.run()?;
        // Raw 1000 at 0.001 m per unit.
        assert!(calls
            .borrow()
            .depth_at_center
            .iter()
            .all(|d| (*d - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn budget_below_one_interval_forwards_nothing() -> Result<()> {
        let (mut driver, calls) = driver(Duration::from_millis(10), 30, |_| {});
        let report = driver.run()?;
        assert_eq!(report.frames_forwarded, 0);
        assert_eq!(report.mean_fps(), None);
        assert_eq!(report.to_string(), "no frames processed (time budget exhausted)");
        assert!(calls.borrow().tracked.is_empty());
        assert_eq!(calls.borrow().events, vec!["shutdown", "save"]);
        Ok(())
    }

    #[test]
    fn frame_sets_without_depth_are_dropped() -> Result<()> {
        let (mut driver, calls) = driver(Duration::from_millis(500), 0, |camera| {
            camera.drop_depth_every = Some(3);
        });
        let report = driver.run()?;
        assert!(report.frames_dropped > 0);
        assert_eq!(calls.borrow().tracked.len() as u64, report.frames_forwarded);
        assert_eq!(
            report.frames_forwarded + report.frames_dropped,
            driver.camera().delivered - 1
        );
        Ok(())
    }

    #[test]
    fn budget_applies_when_every_set_is_dropped() -> Result<()> {
        let (mut driver, calls) = driver(Duration::from_secs(1), 0, |camera| {
            camera.drop_depth_every = Some(1);
        });
        let report = driver.run()?;
        assert_eq!(report.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(report.frames_forwarded, 0);
        assert!(report.frames_dropped >= 29, "dropped {}", report.frames_dropped);
        assert_eq!(report.frames_dropped, driver.camera().delivered - 1);
        assert!(calls.borrow().tracked.is_empty());
        assert_eq!(calls.borrow().events, vec!["shutdown", "save"]);
        Ok(())
    }

    #[test]
    fn missing_depth_sensor_fails_before_streaming() {
        let (mut driver, calls) = driver(Duration::from_secs(1), 30, |camera| {
            camera.profile = profile(false);
        });
        let err = driver.run().unwrap_err();
        assert_eq!(
            err.downcast_ref::<DriverError>(),
            Some(&DriverError::NoDepthSensor)
        );
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(driver.camera().delivered, 0);
        let calls = calls.borrow();
        assert!(calls.tracked.is_empty());
        assert_eq!(calls.events, vec!["shutdown"]);
    }

    #[test]
    fn stall_shuts_engine_down_and_reports_device_stalled() {
        let (mut driver, calls) = driver(Duration::from_secs(5), 2, |camera| {
            camera.stall_after = Some(6);
        });
        let err = driver.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::DeviceStalled { .. })
        ));
        assert_eq!(driver.state(), DriverState::Stopped);
        let calls = calls.borrow();
        assert_eq!(calls.tracked.len(), 4);
        assert_eq!(calls.events, vec!["shutdown"]);
    }

    #[test]
    fn preset_cancel_flag_stops_before_tracking() -> Result<()> {
        let (driver, calls) = driver(Duration::from_secs(5), 30, |_| {});
        let flag = Arc::new(AtomicBool::new(true));
        let mut driver = driver.with_cancel_flag(flag);
        let report = driver.run()?;
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.warmup_frames, 0);
        assert!(calls.borrow().tracked.is_empty());
        assert_eq!(calls.borrow().events, vec!["shutdown", "save"]);
        Ok(())
    }

    #[test]
    fn stages_must_run_in_order() -> Result<()> {
        let (mut driver, _calls) = driver(Duration::from_secs(1), 0, |_| {});
        assert!(driver.warm_up().is_err());
        assert!(driver.track().is_err());
        assert!(driver.finish().is_err());
        driver.start()?;
        assert!(driver.start().is_err());
        assert_eq!(driver.state(), DriverState::WarmingUp);
        Ok(())
    }
}
