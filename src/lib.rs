// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware video playback from a V4L2 stateful decoder to a DRM/KMS display.
//!
//! Compressed access units are written into the decoder's OUTPUT queue ([`decoder::OutputQueue`]),
//! decoded frames are pulled from its CAPTURE queue ([`decoder::CaptureQueue`]) and copied into one
//! of two dumb framebuffers ([`framebuffer::Framebuffer`]), which a [`swapchain::SwapChain`] flips
//! onto the video plane of the display selected by [`display::Display`]. [`pipeline::Pipeline`]
//! ties all of them together.
//!
//! The kernel interfaces are reached through backend traits so that every component can run
//! against in-memory backends. The actual hardware backends are behind the `v4l2` and `kms`
//! features.

pub mod backend;
pub mod decoder;
pub mod display;
pub mod framebuffer;
pub mod image_processing;
pub mod pipeline;
pub mod stream;
pub mod swapchain;
pub mod utils;

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can fit within `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// The largest resolution that fits within both `self` and `other`.
    pub fn intersect(&self, other: Self) -> Self {
        Self {
            width: std::cmp::min(self.width, other.width),
            height: std::cmp::min(self.height, other.height),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ERR: &str = "unrecognized resolution. Expected WIDTHxHEIGHT, e.g. 1280x720";

        let (width, height) = s.split_once(['x', 'X']).ok_or(ERR)?;
        Ok(Self {
            width: width.trim().parse().map_err(|_| ERR)?,
            height: height.trim().parse().map_err(|_| ERR)?,
        })
    }
}

/// A four-character code, as used by both V4L2 and DRM to name pixel and stream formats.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl Fourcc {
    pub const fn from_bytes(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_bytes(n)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        n.0.to_le_bytes()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c: [u8; 4] = (*self).into();

        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// H.264 byte stream, the only compressed format fed to the decoder.
pub const FOURCC_H264: Fourcc = Fourcc::from_bytes(b"H264");
/// Two-plane 4:2:0, luma followed by interleaved chroma in a single memory plane.
pub const FOURCC_NV12: Fourcc = Fourcc::from_bytes(b"NV12");
/// Two-plane 4:2:0 with luma and chroma in separate memory planes (V4L2 only).
pub const FOURCC_NM12: Fourcc = Fourcc::from_bytes(b"NM12");
/// Three-plane 4:2:0.
pub const FOURCC_YUV420: Fourcc = Fourcc::from_bytes(b"YU12");
/// 32-bit packed RGB with alpha, the OSD format.
pub const FOURCC_ARGB8888: Fourcc = Fourcc::from_bytes(b"AR24");

/// Pixel formats the decoder may hand out on its CAPTURE queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Luma and chroma share one memory plane.
    NV12,
    /// Luma and chroma each have their own memory plane.
    NM12,
}

impl DecodedFormat {
    /// Number of V4L2 memory planes a buffer of this format is split into.
    pub fn num_mem_planes(&self) -> usize {
        match self {
            DecodedFormat::NV12 => 1,
            DecodedFormat::NM12 => 2,
        }
    }
}

impl TryFrom<Fourcc> for DecodedFormat {
    type Error = String;

    fn try_from(fourcc: Fourcc) -> Result<Self, Self::Error> {
        match fourcc {
            FOURCC_NV12 => Ok(DecodedFormat::NV12),
            FOURCC_NM12 => Ok(DecodedFormat::NM12),
            _ => Err(format!("unsupported decoded format {}", fourcc)),
        }
    }
}

impl From<DecodedFormat> for Fourcc {
    fn from(format: DecodedFormat) -> Self {
        match format {
            DecodedFormat::NV12 => FOURCC_NV12,
            DecodedFormat::NM12 => FOURCC_NM12,
        }
    }
}
