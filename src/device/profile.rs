//! Stream profiles and the profile monitor.
//!
//! A device declares each of its active streams as a `StreamProfile`. The set
//! can change underneath a running pipeline (reconnect, reconfiguration), so
//! the driver keeps the set it validated and compares it against the live one.
//!
//! Two rules live here:
//! - `profile_changed` compares by unique id only. A stream that disappears and
//!   an identical-looking one that comes back are different streams.
//! - `find_stream_to_align` picks the non-depth stream depth is registered
//!   against, preferring color.

use anyhow::Result;

use crate::error::DriverError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Depth,
    Infrared,
    Color,
    Other,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamKind::Depth => "depth",
            StreamKind::Infrared => "infrared",
            StreamKind::Color => "color",
            StreamKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Pixel encodings the converter understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit single channel (infrared).
    Y8,
    /// 16-bit little-endian raw depth units.
    Z16,
    Rgb8,
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Y8 => 1,
            PixelFormat::Z16 => 2,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }
}

/// Pinhole calibration with Brown-Conrady distortion `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub ppx: f32,
    pub ppy: f32,
    pub fx: f32,
    pub fy: f32,
    pub coeffs: [f32; 5],
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamProfile {
    pub kind: StreamKind,
    /// Sensor-local index (infrared 1 and 2 on stereo modules).
    pub index: u32,
    /// Unique for the lifetime of the device session.
    pub unique_id: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub intrinsics: Option<Intrinsics>,
}

/// Returns true when any stream in `prev` is missing from `current`.
///
/// Streams that only appear in `current` do not count as a change.
pub fn profile_changed(current: &[StreamProfile], prev: &[StreamProfile]) -> bool {
    prev.iter().any(|sp| {
        !current
            .iter()
            .any(|current_sp| current_sp.unique_id == sp.unique_id)
    })
}

/// Choose the stream kind depth should be aligned to.
///
/// Color wins over any other non-depth stream regardless of order.
pub fn find_stream_to_align(streams: &[StreamProfile]) -> Result<StreamKind> {
    let mut align_to = None;
    let mut depth_stream_found = false;
    let mut color_stream_found = false;

    for sp in streams {
        if sp.kind == StreamKind::Depth {
            depth_stream_found = true;
            continue;
        }
        if !color_stream_found {
            align_to = Some(sp.kind);
        }
        if sp.kind == StreamKind::Color {
            color_stream_found = true;
        }
    }

    if !depth_stream_found {
        return Err(DriverError::NoDepthStream.into());
    }
    align_to.ok_or_else(|| DriverError::NoAlignmentTarget.into())
}

/// First profile of the given kind, lowest index first.
pub fn stream_of_kind(streams: &[StreamProfile], kind: StreamKind) -> Option<&StreamProfile> {
    streams
        .iter()
        .filter(|sp| sp.kind == kind)
        .min_by_key(|sp| sp.index)
}
