//! Frame conversion: raw device buffers to tracking input.
//!
//! Intensity comes from the alignment-target stream. `Y8` is copied as is,
//! `Rgb8`/`Bgr8` are reduced to BT.601 luma. Depth must be `Z16` and becomes
//! meters by multiplying every sample with the device depth scale.
//!
//! When the depth stream and the target stream disagree on geometry, depth is
//! registered onto the target pixel grid through both intrinsics. Sensors are
//! assumed co-located (identity extrinsics).

use anyhow::{anyhow, Result};
use image::{ImageBuffer, Luma};

use crate::device::profile::{find_stream_to_align, Intrinsics, PixelFormat, StreamKind};
use crate::device::{depth_scale, PipelineProfile};
use crate::frame::{DepthImage, FrameSet, IntensityImage, RawVideoFrame, RgbdFrame};

/// Stateless once built. A new converter is built whenever the profile changes.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameConverter {
    target: StreamKind,
    depth_scale: f32,
    depth_intrinsics: Option<Intrinsics>,
    target_intrinsics: Option<Intrinsics>,
}

impl FrameConverter {
    pub fn new(target: StreamKind, depth_scale: f32) -> Self {
        Self {
            target,
            depth_scale,
            depth_intrinsics: None,
            target_intrinsics: None,
        }
    }

    pub fn with_intrinsics(mut self, depth: Option<Intrinsics>, target: Option<Intrinsics>) -> Self {
        self.depth_intrinsics = depth;
        self.target_intrinsics = target;
        self
    }

    /// Validate a profile and derive the converter for it.
    ///
    /// Fails with a configuration error when the device has no depth sensor,
    /// no depth stream, or nothing to align depth against.
    pub fn for_profile(profile: &PipelineProfile) -> Result<Self> {
        let depth_scale = depth_scale(&profile.device)?;
        let target = find_stream_to_align(&profile.streams)?;
        let depth_intrinsics = profile.stream(StreamKind::Depth).and_then(|s| s.intrinsics);
        let target_intrinsics = profile.stream(target).and_then(|s| s.intrinsics);
        Ok(Self::new(target, depth_scale).with_intrinsics(depth_intrinsics, target_intrinsics))
    }

    pub fn target(&self) -> StreamKind {
        self.target
    }

    pub fn depth_scale(&self) -> f32 {
        self.depth_scale
    }

    /// Convert one frame set. `Ok(None)` when the target or depth frame is missing.
    pub fn convert(&self, set: &FrameSet) -> Result<Option<RgbdFrame>> {
        let (Some(target), Some(depth)) = (set.first(self.target), set.depth()) else {
            return Ok(None);
        };
        let intensity = to_intensity(target)?;
        let depth = depth_to_meters(depth, self.depth_scale)?;
        let depth = self.register(depth, intensity.width(), intensity.height())?;
        Ok(Some(RgbdFrame {
            intensity,
            depth,
            frame_number: set.frame_number,
        }))
    }

    fn register(&self, depth: DepthImage, width: u32, height: u32) -> Result<DepthImage> {
        let same_size = depth.dimensions() == (width, height);
        match (&self.depth_intrinsics, &self.target_intrinsics) {
            (Some(from), Some(to)) if !(same_size && from == to) => {
                Ok(align_depth(&depth, from, to, width, height))
            }
            _ if same_size => Ok(depth),
            _ => Err(anyhow!(
                "depth {}x{} does not match {} {}x{} and intrinsics are unavailable",
                depth.width(),
                depth.height(),
                self.target,
                width,
                height
            )),
        }
    }
}

/// 8-bit intensity from a single- or three-channel buffer.
pub fn to_intensity(frame: &RawVideoFrame) -> Result<IntensityImage> {
    validate_len(frame)?;
    let pixels = match frame.format {
        PixelFormat::Y8 => frame.data.clone(),
        PixelFormat::Rgb8 => frame
            .data
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect(),
        PixelFormat::Bgr8 => frame
            .data
            .chunks_exact(3)
            .map(|px| luma(px[2], px[1], px[0]))
            .collect(),
        PixelFormat::Z16 => {
            return Err(anyhow!(
                "{} frame has depth encoding, expected intensity",
                frame.kind
            ))
        }
    };
    ImageBuffer::from_raw(frame.width, frame.height, pixels)
        .ok_or_else(|| anyhow!("intensity buffer does not fit {}x{}", frame.width, frame.height))
}

/// Raw `Z16` depth to meters.
pub fn depth_to_meters(frame: &RawVideoFrame, depth_scale: f32) -> Result<DepthImage> {
    if frame.format != PixelFormat::Z16 {
        return Err(anyhow!(
            "depth frame must be Z16, got {:?}",
            frame.format
        ));
    }
    validate_len(frame)?;
    let meters: Vec<f32> = frame
        .data
        .chunks_exact(2)
        .map(|raw| u16::from_le_bytes([raw[0], raw[1]]) as f32 * depth_scale)
        .collect();
    ImageBuffer::from_raw(frame.width, frame.height, meters)
        .ok_or_else(|| anyhow!("depth buffer does not fit {}x{}", frame.width, frame.height))
}

/// Register depth onto another camera's pixel grid.
///
/// Each depth pixel footprint is mapped through `from` and `to`; every target
/// pixel whose center falls inside it takes that depth. Uncovered pixels and
/// pixels covered by an invalid (zero) sample stay 0.0.
pub fn align_depth(
    depth: &DepthImage,
    from: &Intrinsics,
    to: &Intrinsics,
    width: u32,
    height: u32,
) -> DepthImage {
    let mut out: DepthImage = ImageBuffer::from_pixel(width, height, Luma([0.0f32]));
    let map_x = |u: f32| (u - from.ppx) / from.fx * to.fx + to.ppx;
    let map_y = |v: f32| (v - from.ppy) / from.fy * to.fy + to.ppy;

    for (u, v, pixel) in depth.enumerate_pixels() {
        let z = pixel.0[0];
        if z <= 0.0 {
            continue;
        }
        let (x0, x1) = covered_centers(map_x(u as f32 - 0.5), map_x(u as f32 + 0.5), width);
        let (y0, y1) = covered_centers(map_y(v as f32 - 0.5), map_y(v as f32 + 0.5), height);
        for y in y0..y1 {
            for x in x0..x1 {
                out.put_pixel(x, y, Luma([z]));
            }
        }
    }
    out
}

/// Pixel indices k with `lo <= k < hi`, clipped to `0..len`.
fn covered_centers(lo: f32, hi: f32, len: u32) -> (u32, u32) {
    let clip = |value: f32| value.ceil().clamp(0.0, len as f32) as u32;
    (clip(lo), clip(hi))
}

fn validate_len(frame: &RawVideoFrame) -> Result<()> {
    let expected = frame
        .expected_len()
        .ok_or_else(|| anyhow!("{} frame dimensions overflow", frame.kind))?;
    if frame.data.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            frame.kind,
            expected,
            frame.data.len()
        ));
    }
    Ok(())
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    clamp_to_u8(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
