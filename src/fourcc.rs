// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::fmt;

/// Four character code identifying a pixel or coding format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

/// NV12 4:2:0 YUV semi-planar format (native decoder output)
pub const NV12: FourCC = FourCC(*b"NV12");
/// NV21 4:2:0 YUV semi-planar format with swapped chroma
pub const NV21: FourCC = FourCC(*b"NV21");
/// I420 4:2:0 YUV fully planar format
pub const I420: FourCC = FourCC(*b"YU12");
/// P010 10-bit 4:2:0 semi-planar format
pub const P010: FourCC = FourCC(*b"P010");
/// YUYV 4:2:2 YUV packed format (common camera output format)
pub const YUYV: FourCC = FourCC(*b"YUYV");
/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");
/// RGBX 32-bit pixel format (8 bits per channel, unused alpha)
pub const RGBX: FourCC = FourCC(*b"RGBX");
/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

pub const H264: FourCC = FourCC(*b"H264");
pub const HEVC: FourCC = FourCC(*b"HEVC");
pub const VP80: FourCC = FourCC(*b"VP80");
pub const VP90: FourCC = FourCC(*b"VP90");
pub const AV1: FourCC = FourCC(*b"AV01");
pub const MJPG: FourCC = FourCC(*b"MJPG");
pub const JPEG: FourCC = FourCC(*b"JPEG");

impl FourCC {
    pub const fn from_u32(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Whether the format carries a bitstream rather than pixels.
    pub fn is_compressed(self) -> bool {
        matches!(self, H264 | HEVC | VP80 | VP90 | AV1 | MJPG | JPEG)
    }

    /// Per-plane `(stride, size)` for a contiguous frame of this format.
    ///
    /// Semi-planar and planar formats report each plane separately so callers
    /// can lay them out back to back or in separate allocations. Returns
    /// `None` for compressed or unknown formats.
    pub fn plane_layout(self, width: u32, height: u32) -> Option<Vec<(usize, usize)>> {
        let w = width as usize;
        let h = height as usize;
        let layout = match self {
            NV12 | NV21 => vec![(w, w * h), (w, w * h.div_ceil(2))],
            P010 => vec![(2 * w, 2 * w * h), (2 * w, 2 * w * h.div_ceil(2))],
            I420 => {
                let cw = w.div_ceil(2);
                let ch = h.div_ceil(2);
                vec![(w, w * h), (cw, cw * ch), (cw, cw * ch)]
            }
            YUYV => vec![(2 * w, 2 * w * h)],
            RGB3 => vec![(3 * w, 3 * w * h)],
            RGBX | RGBA => vec![(4 * w, 4 * w * h)],
            _ => return None,
        };
        Some(layout)
    }

    /// Total bytes of a contiguous frame, `None` for compressed formats.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        self.plane_layout(width, height)
            .map(|planes| planes.iter().map(|(_, size)| size).sum())
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC::from_u32(value)
    }
}

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        value.to_u32()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &c in &self.0 {
            let c = if c.is_ascii_graphic() || c == b' ' { c } else { b'?' };
            write!(f, "{}", c as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}
