//! Frame types.
//!
//! - `RawVideoFrame`: one device buffer, still in its wire encoding.
//! - `FrameSet`: the synchronized buffers returned by a single device wait.
//! - `RgbdFrame`: converted intensity + depth-in-meters pair handed to tracking.
//!
//! Conversion from the first two to the third lives in `convert`.

use image::{GrayImage, ImageBuffer, Luma};

use crate::device::profile::{PixelFormat, StreamKind};

/// Depth map in meters.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// 8-bit intensity image fed to tracking.
pub type IntensityImage = GrayImage;

/// Raw buffer from one stream. `data` is tightly packed rows.
#[derive(Clone, Debug)]
pub struct RawVideoFrame {
    pub kind: StreamKind,
    pub index: u32,
    /// Unique id of the profile that produced this buffer.
    pub profile_id: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawVideoFrame {
    /// Expected buffer length for the declared geometry, or `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(self.format.bytes_per_pixel()))
    }
}

/// Frames captured from the same acquisition instant.
#[derive(Clone, Debug, Default)]
pub struct FrameSet {
    /// Device-assigned sequence number.
    pub frame_number: u64,
    pub frames: Vec<RawVideoFrame>,
}

impl FrameSet {
    /// First frame of `kind`, lowest stream index first.
    pub fn first(&self, kind: StreamKind) -> Option<&RawVideoFrame> {
        self.frames
            .iter()
            .filter(|f| f.kind == kind)
            .min_by_key(|f| f.index)
    }

    pub fn depth(&self) -> Option<&RawVideoFrame> {
        self.first(StreamKind::Depth)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Converted pair. Both images share dimensions and come from the same `FrameSet`.
#[derive(Clone, Debug)]
pub struct RgbdFrame {
    pub intensity: IntensityImage,
    pub depth: DepthImage,
    pub frame_number: u64,
}
