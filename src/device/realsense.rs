//! Intel RealSense source (`realsense://[serial]`, feature: ingest-realsense).
//!
//! Streams go through a librealsense pipeline. Frames are copied out of the
//! librealsense buffers into `RawVideoFrame`s so nothing device-owned outlives
//! the wait call.
//!
//! librealsense restarts a pipeline on its own after a USB reconnect, and the
//! restarted streams come back with new unique ids. The cached pipeline
//! profile does not reflect that, so the profile reported here follows the
//! stream profiles attached to delivered frames.

use anyhow::{anyhow, bail, Context as _, Result};
use realsense_rust::{
    config::Config,
    context::Context,
    device::Device,
    frame::{ColorFrame, CompositeFrame, DepthFrame, FrameEx, InfraredFrame, PixelKind},
    kind::{Rs2CameraInfo, Rs2Format, Rs2Option, Rs2ProductLine, Rs2StreamKind},
    pipeline::{ActivePipeline, FrameWaitError, InactivePipeline},
    stream_profile::StreamProfile as Rs2StreamProfile,
};
use std::collections::HashSet;
use std::ffi::CString;
use std::time::Duration;

use super::profile::{Intrinsics, PixelFormat, StreamKind, StreamProfile};
use super::{DepthCamera, DeviceInfo, PipelineProfile, SensorInfo, SensorKind, StreamRequest};
use crate::frame::{FrameSet, RawVideoFrame};

pub struct RealSenseCamera {
    serial: Option<String>,
    context: Context,
    pipeline: Option<ActivePipeline>,
    profile: Option<PipelineProfile>,
}

impl RealSenseCamera {
    /// Bind to the device with `serial`, or to the first D400 device.
    pub fn new(serial: Option<String>) -> Result<Self> {
        let context = Context::new().map_err(|e| anyhow!("realsense context: {}", e))?;
        Ok(Self {
            serial,
            context,
            pipeline: None,
            profile: None,
        })
    }

    fn find_device(&self) -> Result<Device> {
        let mut product_lines = HashSet::new();
        product_lines.insert(Rs2ProductLine::D400);
        let devices = self.context.query_devices(product_lines);
        let device = match &self.serial {
            Some(serial) => devices
                .into_iter()
                .find(|d| info_string(d.info(Rs2CameraInfo::SerialNumber)) == *serial),
            None => devices.into_iter().next(),
        };
        device.ok_or_else(|| match &self.serial {
            Some(serial) => anyhow!("realsense device {} not found", serial),
            None => anyhow!("no realsense device found"),
        })
    }

    /// Replace stream profiles whose unique ids no longer match delivered frames.
    fn track_frame_profiles(&mut self, frames: &[RawVideoFrame], live: Vec<StreamProfile>) {
        let Some(profile) = self.profile.as_mut() else {
            return;
        };
        let stale = frames
            .iter()
            .any(|f| !profile.streams.iter().any(|s| s.unique_id == f.profile_id));
        if stale {
            log::warn!("RealSenseCamera: stream ids changed, device restarted");
            profile.streams = live;
            if let Ok(device) = self.find_device() {
                profile.device = device_info(&device);
            }
        }
    }
}

impl DepthCamera for RealSenseCamera {
    fn start(&mut self, request: &StreamRequest) -> Result<PipelineProfile> {
        if self.pipeline.is_some() {
            bail!("RealSenseCamera: already started");
        }
        let device = self.find_device()?;
        let serial = info_string(device.info(Rs2CameraInfo::SerialNumber));

        let mut config = Config::new();
        let serial_c = CString::new(serial.clone()).context("device serial")?;
        config
            .enable_device_from_serial(&serial_c)
            .map_err(|e| anyhow!("select device {}: {}", serial, e))?
            .disable_all_streams()
            .map_err(|e| anyhow!("reset streams: {}", e))?;
        for spec in &request.streams {
            config
                .enable_stream(
                    rs2_stream_kind(spec.kind)?,
                    spec.index.map(|i| i as usize),
                    spec.width as usize,
                    spec.height as usize,
                    rs2_format(spec.format),
                    spec.fps as usize,
                )
                .map_err(|e| anyhow!("enable {} stream: {}", spec.kind, e))?;
        }

        let pipeline = InactivePipeline::try_from(&self.context)
            .map_err(|e| anyhow!("realsense pipeline: {}", e))?;
        let pipeline = pipeline
            .start(Some(config))
            .map_err(|e| anyhow!("start realsense pipeline: {}", e))?;

        let streams = pipeline
            .profile()
            .streams()
            .iter()
            .filter_map(convert_stream_profile)
            .collect();
        let profile = PipelineProfile {
            device: device_info(pipeline.profile().device()),
            streams,
        };
        log::info!(
            "RealSenseCamera: started {} ({}), {} streams",
            profile.device.name,
            profile.device.serial,
            profile.streams.len()
        );
        self.pipeline = Some(pipeline);
        self.profile = Some(profile.clone());
        Ok(profile)
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>> {
        let Some(pipeline) = self.pipeline.as_mut() else {
            bail!("RealSenseCamera: wait_for_frames before start");
        };
        let composite = match pipeline.wait(Some(timeout)) {
            Ok(composite) => composite,
            Err(FrameWaitError::DidTimeoutBeforeFrameArrival) => return Ok(None),
            Err(e) => return Err(anyhow!("realsense wait: {}", e)),
        };
        let (set, live) = copy_frame_set(&composite)?;
        self.track_frame_profiles(&set.frames, live);
        Ok(Some(set))
    }

    fn active_profile(&self) -> Result<PipelineProfile> {
        self.profile
            .clone()
            .ok_or_else(|| anyhow!("RealSenseCamera: not started"))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
            log::info!("RealSenseCamera: stopped");
        }
        Ok(())
    }
}

fn copy_frame_set(composite: &CompositeFrame) -> Result<(FrameSet, Vec<StreamProfile>)> {
    let mut frames = Vec::new();
    let mut live = Vec::new();
    let mut frame_number = 0;

    for frame in composite.frames_of_type::<InfraredFrame>() {
        frame_number = frame.frame_number();
        let (raw, profile) = copy_pixels(&frame, StreamKind::Infrared, frame.width(), frame.height(), |x, y, out| {
            match frame.get(x, y) {
                Some(PixelKind::Y8 { y }) => {
                    out.push(*y);
                    Ok(())
                }
                _ => Err(anyhow!("infrared frame is not Y8")),
            }
        })?;
        frames.push(raw);
        live.extend(profile);
    }
    for frame in composite.frames_of_type::<DepthFrame>() {
        frame_number = frame.frame_number();
        let (raw, profile) = copy_pixels(&frame, StreamKind::Depth, frame.width(), frame.height(), |x, y, out| {
            match frame.get(x, y) {
                Some(PixelKind::Z16 { depth }) => {
                    out.extend_from_slice(&depth.to_le_bytes());
                    Ok(())
                }
                _ => Err(anyhow!("depth frame is not Z16")),
            }
        })?;
        frames.push(raw);
        live.extend(profile);
    }
    for frame in composite.frames_of_type::<ColorFrame>() {
        frame_number = frame.frame_number();
        let (raw, profile) = copy_pixels(&frame, StreamKind::Color, frame.width(), frame.height(), |x, y, out| {
            match frame.get(x, y) {
                Some(PixelKind::Rgb8 { r, g, b }) | Some(PixelKind::Bgr8 { b, g, r }) => {
                    out.extend_from_slice(&[*r, *g, *b]);
                    Ok(())
                }
                _ => Err(anyhow!("color frame is not RGB8/BGR8")),
            }
        })?;
        frames.push(raw);
        live.extend(profile);
    }

    Ok((
        FrameSet {
            frame_number: frame_number as u64,
            frames,
        },
        live,
    ))
}

fn copy_pixels<F: FrameEx>(
    frame: &F,
    kind: StreamKind,
    width: usize,
    height: usize,
    pixel: impl FnMut(usize, usize, &mut Vec<u8>) -> Result<()>,
) -> Result<(RawVideoFrame, Option<StreamProfile>)> {
    let rs_profile = frame.stream_profile();
    let format = match kind {
        // Color is always repacked as RGB.
        StreamKind::Color => PixelFormat::Rgb8,
        _ => pixel_format(rs_profile.format())
            .ok_or_else(|| anyhow!("unsupported {} format {:?}", kind, rs_profile.format()))?,
    };
    let data = fill_pixels(width, height, format.bytes_per_pixel(), pixel)?;
    let raw = RawVideoFrame {
        kind,
        index: rs_profile.index() as u32,
        profile_id: rs_profile.unique_id() as u32,
        format,
        width: width as u32,
        height: height as u32,
        data,
    };
    Ok((raw, convert_stream_profile(rs_profile)))
}

/// Packs pixels row by row into one buffer. Each call must append exactly
/// `bytes_per_pixel` bytes.
fn fill_pixels(
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
    mut pixel: impl FnMut(usize, usize, &mut Vec<u8>) -> Result<()>,
) -> Result<Vec<u8>> {
    let expected = width * height * bytes_per_pixel;
    let mut data = Vec::with_capacity(expected);
    for y in 0..height {
        for x in 0..width {
            pixel(x, y, &mut data)?;
        }
    }
    if data.len() != expected {
        bail!("copied {} bytes, expected {}", data.len(), expected);
    }
    Ok(data)
}

fn convert_stream_profile(sp: &Rs2StreamProfile) -> Option<StreamProfile> {
    let kind = match sp.kind() {
        Rs2StreamKind::Depth => StreamKind::Depth,
        Rs2StreamKind::Infrared => StreamKind::Infrared,
        Rs2StreamKind::Color => StreamKind::Color,
        _ => StreamKind::Other,
    };
    let format = match kind {
        StreamKind::Color => PixelFormat::Rgb8,
        _ => pixel_format(sp.format())?,
    };
    let intrinsics = sp.intrinsics().ok().map(|i| Intrinsics {
        width: i.width() as u32,
        height: i.height() as u32,
        ppx: i.ppx(),
        ppy: i.ppy(),
        fx: i.fx(),
        fy: i.fy(),
        coeffs: i.coeffs(),
    });
    let (width, height) = intrinsics.map(|i| (i.width, i.height)).unwrap_or((0, 0));
    Some(StreamProfile {
        kind,
        index: sp.index() as u32,
        unique_id: sp.unique_id() as u32,
        format,
        width,
        height,
        fps: sp.framerate().max(0) as u32,
        intrinsics,
    })
}

fn device_info(device: &Device) -> DeviceInfo {
    let sensors = device
        .sensors()
        .iter()
        .map(|sensor| {
            let name = info_string(sensor.info(Rs2CameraInfo::Name));
            let kind = match sensor.get_option(Rs2Option::DepthUnits) {
                Some(depth_scale) => SensorKind::Depth { depth_scale },
                None if name.contains("Motion") => SensorKind::Motion,
                None => SensorKind::Color,
            };
            SensorInfo { name, kind }
        })
        .collect();
    DeviceInfo {
        name: info_string(device.info(Rs2CameraInfo::Name)),
        serial: info_string(device.info(Rs2CameraInfo::SerialNumber)),
        sensors,
    }
}

fn info_string(value: Option<&std::ffi::CStr>) -> String {
    value
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn rs2_stream_kind(kind: StreamKind) -> Result<Rs2StreamKind> {
    match kind {
        StreamKind::Depth => Ok(Rs2StreamKind::Depth),
        StreamKind::Infrared => Ok(Rs2StreamKind::Infrared),
        StreamKind::Color => Ok(Rs2StreamKind::Color),
        StreamKind::Other => bail!("cannot request a stream of kind {}", kind),
    }
}

fn rs2_format(format: PixelFormat) -> Rs2Format {
    match format {
        PixelFormat::Y8 => Rs2Format::Y8,
        PixelFormat::Z16 => Rs2Format::Z16,
        PixelFormat::Rgb8 => Rs2Format::Rgb8,
        PixelFormat::Bgr8 => Rs2Format::Bgr8,
    }
}

fn pixel_format(format: Rs2Format) -> Option<PixelFormat> {
    match format {
        Rs2Format::Y8 => Some(PixelFormat::Y8),
        Rs2Format::Z16 => Some(PixelFormat::Z16),
        Rs2Format::Rgb8 => Some(PixelFormat::Rgb8),
        Rs2Format::Bgr8 => Some(PixelFormat::Bgr8),
        _ => None,
    }
}
