//! rgbd_slam - run RGB-D tracking on a depth camera for a fixed time budget
//!
//! Usage: rgbd_slam <vocabulary> <settings> [width] [height] [fps] [time]
//!
//! The device comes from `RGBD_DEVICE_URI` (or the `RGBD_CONFIG` file) and
//! defaults to the synthetic `stub://rgbd` camera. Ctrl-C stops the run early;
//! the keyframe trajectory is saved either way.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rgbd_slam_driver::config::{CliOverrides, DriverConfig};
use rgbd_slam_driver::device::Camera;
use rgbd_slam_driver::driver::PipelineDriver;
use rgbd_slam_driver::slam::StubEngine;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "rgbd_slam", about = "Track an RGB-D camera for a fixed time budget")]
struct Args {
    /// Vocabulary file for the tracking engine.
    vocabulary: PathBuf,

    /// Engine settings file.
    settings: PathBuf,

    /// Stream width in pixels (default 640).
    width: Option<u32>,

    /// Stream height in pixels (default 480).
    height: Option<u32>,

    /// Frame rate (default 30).
    fps: Option<u32>,

    /// Time budget in seconds (default 30.0).
    time: Option<f64>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            width: self.width,
            height: self.height,
            fps: self.fps,
            time_budget_secs: self.time,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => {
            // --help / --version
            let _ = e.print();
            return Ok(());
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let mut cfg = DriverConfig::load()?;
    if let Err(e) = cfg.apply_cli(args.overrides()) {
        eprintln!("error: {}\n\n{}", e, Args::command().render_usage());
        std::process::exit(1);
    }

    let ui = ui::Ui::from_mode(cfg.ui_mode.as_deref(), std::io::stderr().is_terminal());
    log::info!(
        "rgbd_slam: device {}, {}x{}@{}, budget {:.1}s",
        cfg.device_uri,
        cfg.width,
        cfg.height,
        cfg.fps,
        cfg.time_budget_secs
    );

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let engine = StubEngine::load(&args.vocabulary, &args.settings)?;
    let camera = Camera::open(&cfg.device_uri)?;
    let mut driver =
        PipelineDriver::new(camera, engine, cfg.driver_settings()).with_cancel_flag(cancel);

    staged(&ui, "Start camera", || driver.start())?;
    staged(&ui, "Warm up", || driver.warm_up())?;
    staged(&ui, "Track", || driver.track())?;
    let report = staged(&ui, "Save trajectory", || driver.finish())?;

    if report.reconfigurations > 0 || report.frames_dropped > 0 {
        log::warn!(
            "rgbd_slam: {} reconfigurations, {} frame sets dropped",
            report.reconfigurations,
            report.frames_dropped
        );
    }
    println!("{}", report);
    println!(
        "Trajectory saved to {}",
        driver.settings().trajectory_path.display()
    );
    Ok(())
}

fn staged<T>(ui: &ui::Ui, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let mut stage = ui.stage(name);
    let result = f();
    if result.is_err() {
        stage.fail();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_and_settings_are_required() {
        let err = Args::try_parse_from(["rgbd_slam", "ORBvoc.txt"]).unwrap_err();
        assert!(err.use_stderr());
        let err = Args::try_parse_from(["rgbd_slam"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn more_than_six_values_is_a_usage_error() {
        let err = Args::try_parse_from([
            "rgbd_slam", "ORBvoc.txt", "d435.yaml", "640", "480", "30", "10", "extra",
        ])
        .unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn two_values_keep_configured_stream() {
        let args = Args::try_parse_from(["rgbd_slam", "ORBvoc.txt", "d435.yaml"]).unwrap();
        assert_eq!(args.vocabulary, PathBuf::from("ORBvoc.txt"));
        assert_eq!(args.settings, PathBuf::from("d435.yaml"));
        assert_eq!(args.overrides(), CliOverrides::default());
    }

    #[test]
    fn all_six_values_override_the_stream() {
        let args = Args::try_parse_from([
            "rgbd_slam", "ORBvoc.txt", "d435.yaml", "848", "480", "15", "2.5",
        ])
        .unwrap();
        assert_eq!(
            args.overrides(),
            CliOverrides {
                width: Some(848),
                height: Some(480),
                fps: Some(15),
                time_budget_secs: Some(2.5),
            }
        );
    }

    #[test]
    fn non_numeric_stream_values_are_rejected() {
        let err = Args::try_parse_from(["rgbd_slam", "ORBvoc.txt", "d435.yaml", "wide"])
            .unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn help_is_not_an_error_exit() {
        let err = Args::try_parse_from(["rgbd_slam", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }
}
