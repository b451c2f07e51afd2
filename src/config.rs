use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::{
    default_frame_timeout, DriverSettings, DEFAULT_TRAJECTORY_PATH, DEFAULT_WARMUP_FRAMES,
};

const DEFAULT_DEVICE_URI: &str = "stub://rgbd";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_TIME_BUDGET_SECS: f64 = 30.0;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DriverConfigFile {
    device: Option<DeviceConfigFile>,
    stream: Option<StreamConfigFile>,
    run: Option<RunConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DeviceConfigFile {
    uri: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RunConfigFile {
    time_budget_secs: Option<f64>,
    warmup_frames: Option<u64>,
    frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    trajectory_path: Option<PathBuf>,
}

/// Runtime configuration for the `rgbd_slam` binary.
///
/// Sources, later wins: JSON file named by `RGBD_CONFIG`, `RGBD_*`
/// environment variables, then positional command-line values.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub device_uri: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub time_budget_secs: f64,
    pub warmup_frames: u64,
    /// `None` derives the wait from the frame rate.
    pub frame_timeout: Option<Duration>,
    pub trajectory_path: PathBuf,
    /// `plain`, `pretty` or unset for auto.
    pub ui_mode: Option<String>,
}

/// Values given on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CliOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub time_budget_secs: Option<f64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_uri: DEFAULT_DEVICE_URI.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            time_budget_secs: DEFAULT_TIME_BUDGET_SECS,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            frame_timeout: None,
            trajectory_path: PathBuf::from(DEFAULT_TRAJECTORY_PATH),
            ui_mode: None,
        }
    }
}

impl DriverConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RGBD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DriverConfigFile) -> Self {
        let defaults = Self::default();
        let stream = file.stream.unwrap_or_default();
        let run = file.run.unwrap_or_default();
        Self {
            device_uri: file
                .device
                .and_then(|device| device.uri)
                .unwrap_or(defaults.device_uri),
            width: stream.width.unwrap_or(defaults.width),
            height: stream.height.unwrap_or(defaults.height),
            fps: stream.fps.unwrap_or(defaults.fps),
            time_budget_secs: run.time_budget_secs.unwrap_or(defaults.time_budget_secs),
            warmup_frames: run.warmup_frames.unwrap_or(defaults.warmup_frames),
            frame_timeout: run.frame_timeout_ms.map(Duration::from_millis),
            trajectory_path: file
                .output
                .and_then(|output| output.trajectory_path)
                .unwrap_or(defaults.trajectory_path),
            ui_mode: None,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("RGBD_DEVICE_URI") {
            if !uri.trim().is_empty() {
                self.device_uri = uri.trim().to_string();
            }
        }
        if let Ok(frames) = std::env::var("RGBD_WARMUP_FRAMES") {
            self.warmup_frames = frames
                .trim()
                .parse()
                .map_err(|_| anyhow!("RGBD_WARMUP_FRAMES must be a non-negative integer"))?;
        }
        if let Ok(timeout) = std::env::var("RGBD_FRAME_TIMEOUT_MS") {
            let ms: u64 = timeout
                .trim()
                .parse()
                .map_err(|_| {
                    anyhow!("RGBD_FRAME_TIMEOUT_MS must be an integer number of milliseconds")
                })?;
            self.frame_timeout = Some(Duration::from_millis(ms));
        }
        if let Ok(path) = std::env::var("RGBD_TRAJECTORY_PATH") {
            if !path.trim().is_empty() {
                self.trajectory_path = PathBuf::from(path);
            }
        }
        if let Ok(mode) = std::env::var("RGBD_UI") {
            if !mode.trim().is_empty() {
                self.ui_mode = Some(mode.trim().to_lowercase());
            }
        }
        Ok(())
    }

    /// Apply command-line values and re-validate.
    pub fn apply_cli(&mut self, cli: CliOverrides) -> Result<()> {
        if let Some(width) = cli.width {
            self.width = width;
        }
        if let Some(height) = cli.height {
            self.height = height;
        }
        if let Some(fps) = cli.fps {
            self.fps = fps;
        }
        if let Some(secs) = cli.time_budget_secs {
            self.time_budget_secs = secs;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_uri.trim().is_empty() {
            return Err(anyhow!("device uri must not be empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "stream size must be positive, got {}x{}",
                self.width,
                self.height
            ));
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if !self.time_budget_secs.is_finite() || self.time_budget_secs <= 0.0 {
            return Err(anyhow!(
                "time budget must be a positive number of seconds, got {}",
                self.time_budget_secs
            ));
        }
        if self.frame_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        if self.trajectory_path.as_os_str().is_empty() {
            return Err(anyhow!("trajectory path must not be empty"));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs_f64(self.time_budget_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
            .unwrap_or_else(|| default_frame_timeout(self.fps))
    }

    pub fn driver_settings(&self) -> DriverSettings {
        let mut settings = DriverSettings::new(self.width, self.height, self.fps, self.time_budget());
        settings.warmup_frames = self.warmup_frames;
        settings.frame_timeout = self.frame_timeout();
        settings.trajectory_path = self.trajectory_path.clone();
        settings
    }
}

fn read_config_file(path: &Path) -> Result<DriverConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = DriverConfig::from_file(DriverConfigFile::default());
        assert_eq!(cfg, DriverConfig::default());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.frame_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn cli_overrides_are_validated() {
        let mut cfg = DriverConfig::default();
        cfg.apply_cli(CliOverrides {
            width: Some(1280),
            height: Some(720),
            fps: Some(15),
            time_budget_secs: Some(2.5),
        })
        .unwrap();
        let settings = cfg.driver_settings();
        assert_eq!((settings.width, settings.height, settings.fps), (1280, 720, 15));
        assert_eq!(settings.time_budget, Duration::from_millis(2500));

        assert!(cfg
            .apply_cli(CliOverrides {
                time_budget_secs: Some(-1.0),
                ..CliOverrides::default()
            })
            .is_err());
        let mut cfg = DriverConfig::default();
        assert!(cfg
            .apply_cli(CliOverrides {
                fps: Some(0),
                ..CliOverrides::default()
            })
            .is_err());
        let mut cfg = DriverConfig::default();
        assert!(cfg
            .apply_cli(CliOverrides {
                time_budget_secs: Some(f64::NAN),
                ..CliOverrides::default()
            })
            .is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<DriverConfigFile, _> =
            serde_json::from_str(r#"{"stream": {"widht": 640}}"#);
        assert!(parsed.is_err());
    }
}
