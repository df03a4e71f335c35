// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU-writable framebuffers backed by dumb buffers.

use crate::decoder::FrameDst;
use crate::decoder::PlaneDst;
use crate::display::DumbBuffer;
use crate::display::FramebufferLayout;
use crate::display::KmsBackend;
use crate::display::KmsError;
use crate::display::Result;
use crate::utils::align_up;
use crate::Fourcc;
use crate::Resolution;
use crate::FOURCC_ARGB8888;
use crate::FOURCC_NV12;
use crate::FOURCC_YUV420;

pub const WIDTH_ALIGNMENT: u32 = 128;
pub const HEIGHT_ALIGNMENT: u32 = 64;

const DRM_FORMAT_MOD_VENDOR_SAMSUNG: u64 = 0x04;
/// Samsung 64x32 macroblock tiling.
pub const DRM_FORMAT_MOD_SAMSUNG_64_32_TILE: u64 = (DRM_FORMAT_MOD_VENDOR_SAMSUNG << 56) | 1;

const BLACK_LUMA: u8 = 0x10;
const BLACK_CHROMA: u8 = 0x80;

fn bits_per_pixel(format: Fourcc) -> Result<u32> {
    match format {
        FOURCC_ARGB8888 => Ok(32),
        FOURCC_NV12 | FOURCC_YUV420 => Ok(12),
        _ => Err(KmsError::UnsupportedFormat(format)),
    }
}

/// Computes the plane layout of a `format` buffer of `aligned` size.
fn plane_layout(format: Fourcc, aligned: Resolution, dumb: &DumbBuffer) -> FramebufferLayout {
    let (w, h) = (aligned.width, aligned.height);
    let luma = w * h;

    let (num_planes, pitches, offsets) = match format {
        FOURCC_NV12 => (2, [w, w, 0, 0], [0, luma, 0, 0]),
        FOURCC_YUV420 => (
            3,
            [w, w / 2, w / 2, 0],
            [0, luma, luma + (w / 2) * (h / 2), 0],
        ),
        _ => (1, [dumb.pitch, 0, 0, 0], [0; 4]),
    };

    let mut handles = [0; 4];
    handles[..num_planes].fill(dumb.handle);

    FramebufferLayout {
        size: aligned,
        format,
        num_planes,
        handles,
        pitches,
        offsets,
        modifier: DRM_FORMAT_MOD_SAMSUNG_64_32_TILE,
    }
}

/// A dumb buffer registered as a framebuffer.
///
/// The buffer is allocated and registered with its width aligned to [`WIDTH_ALIGNMENT`] and its
/// height to [`HEIGHT_ALIGNMENT`]. Only the requested size holds picture data, planes scan out of
/// it through their source rectangle. The buffer is mapped only while it is written. It must be
/// returned to the device with [`Framebuffer::destroy`].
pub struct Framebuffer<D> {
    id: u32,
    dumb: D,
    info: DumbBuffer,
    layout: FramebufferLayout,
    visible: Resolution,
}

impl<D> Framebuffer<D> {
    /// Allocates and registers a `format` framebuffer of `width`x`height`, painted with
    /// [`Framebuffer::fill_blank`].
    pub fn create<B>(backend: &B, width: u32, height: u32, format: Fourcc) -> Result<Self>
    where
        B: KmsBackend<Dumb = D>,
    {
        let bpp = bits_per_pixel(format)?;
        let aligned = Resolution::from((
            align_up(width, WIDTH_ALIGNMENT),
            align_up(height, HEIGHT_ALIGNMENT),
        ));

        let (dumb, info) = backend.create_dumb(aligned.width, aligned.height, format, bpp)?;
        let layout = plane_layout(format, aligned, &info);

        let id = match backend.add_framebuffer(&layout) {
            Ok(id) => id,
            Err(err) => {
                if let Err(err) = backend.destroy_dumb(dumb) {
                    log::warn!("Failed to destroy dumb buffer {}: {}", info.handle, err);
                }
                return Err(err);
            }
        };

        let mut fb = Self {
            id,
            dumb,
            info,
            layout,
            visible: Resolution::from((width, height)),
        };

        if let Err(err) = fb.fill_blank(backend) {
            if let Err(err) = fb.destroy(backend) {
                log::warn!("Failed to destroy framebuffer: {}", err);
            }
            return Err(err);
        }

        log::debug!(
            "Framebuffer {}: {} {}x{} (allocated {}), {} bytes",
            id,
            format,
            width,
            height,
            aligned,
            info.size
        );

        Ok(fb)
    }

    /// Removes the framebuffer, then frees the dumb buffer.
    ///
    /// Both steps are attempted. The first error is returned.
    pub fn destroy<B>(self, backend: &B) -> Result<()>
    where
        B: KmsBackend<Dumb = D>,
    {
        let removed = backend.remove_framebuffer(self.id);
        if let Err(err) = &removed {
            log::error!("Failed to remove framebuffer {}: {}", self.id, err);
        }
        let destroyed = backend.destroy_dumb(self.dumb);
        if let Err(err) = &destroyed {
            log::error!("Failed to destroy dumb buffer {}: {}", self.info.handle, err);
        }

        removed.and(destroyed)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> u32 {
        self.info.handle
    }

    pub fn format(&self) -> Fourcc {
        self.layout.format
    }

    /// Size requested at creation, the part of the buffer holding picture data.
    pub fn size(&self) -> Resolution {
        self.visible
    }

    /// Size the framebuffer was allocated and registered with.
    pub fn allocated_size(&self) -> Resolution {
        self.layout.size
    }

    pub fn pitches(&self) -> &[u32] {
        &self.layout.pitches[..self.layout.num_planes]
    }

    pub fn offsets(&self) -> &[u32] {
        &self.layout.offsets[..self.layout.num_planes]
    }

    pub fn modifier(&self) -> u64 {
        self.layout.modifier
    }

    /// Maps the buffer and hands `f` its NV12 planes as a frame destination.
    pub fn write_nv12<B, R, F>(&mut self, backend: &B, f: F) -> Result<R>
    where
        B: KmsBackend<Dumb = D>,
        F: FnOnce(&mut FrameDst) -> R,
    {
        if self.layout.format != FOURCC_NV12 {
            return Err(KmsError::UnsupportedFormat(self.layout.format));
        }

        let size = self.visible;
        let [luma_pitch, chroma_pitch, ..] = self.layout.pitches;
        let chroma_offset = self.layout.offsets[1] as usize;

        backend.with_dumb_mapping(&mut self.dumb, |data| {
            let split = chroma_offset.min(data.len());
            let (luma, chroma) = data.split_at_mut(split);

            f(&mut FrameDst {
                luma: PlaneDst {
                    data: luma,
                    pitch: luma_pitch as usize,
                },
                chroma: PlaneDst {
                    data: chroma,
                    pitch: chroma_pitch as usize,
                },
                size,
            })
        })
    }

    /// Paints the buffer black. ARGB buffers are cleared to transparent.
    pub fn fill_blank<B>(&mut self, backend: &B) -> Result<()>
    where
        B: KmsBackend<Dumb = D>,
    {
        let format = self.layout.format;
        let chroma_offset = self.layout.offsets[1] as usize;

        backend.with_dumb_mapping(&mut self.dumb, |data| {
            if format == FOURCC_ARGB8888 {
                data.fill(0);
                return;
            }

            let split = chroma_offset.min(data.len());
            let (luma, chroma) = data.split_at_mut(split);
            luma.fill(BLACK_LUMA);
            chroma.fill(BLACK_CHROMA);
        })
    }
}
