// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU copies between decoder buffers and display framebuffers, which rarely agree on stride.

/// Copies `rows` lines of `width` bytes from `src` to `dst`, stepping each buffer by its own
/// stride. Returns the number of lines actually copied, which is lower than `rows` if either
/// buffer ends early.
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    rows: usize,
) -> usize {
    if src_stride == 0 || dst_stride == 0 || width == 0 {
        return 0;
    }

    let width = width.min(src_stride).min(dst_stride);

    let src_lines = src
        .chunks(src_stride)
        .take_while(|line| line.len() >= width)
        .map(|line| &line[..width]);
    let dst_lines = dst
        .chunks_mut(dst_stride)
        .take_while(|line| line.len() >= width)
        .map(|line| &mut line[..width]);

    let mut copied = 0;
    for (src_line, dst_line) in src_lines.zip(dst_lines).take(rows) {
        dst_line.copy_from_slice(src_line);
        copied += 1;
    }

    copied
}

/// Copies a `width`x`height` NV12 image between two pitched layouts.
///
/// The luma and chroma planes are passed separately, so this works equally for buffers where
/// both planes live in one allocation and for buffers where each plane is its own allocation.
#[allow(clippy::too_many_arguments)]
pub fn nv12_copy(
    src_y: &[u8],
    src_y_stride: usize,
    dst_y: &mut [u8],
    dst_y_stride: usize,
    src_uv: &[u8],
    src_uv_stride: usize,
    dst_uv: &mut [u8],
    dst_uv_stride: usize,
    width: usize,
    height: usize,
) {
    copy_plane(src_y, src_y_stride, dst_y, dst_y_stride, width, height);

    // Align width and height to 2 for UV plane.
    // 1 sample per 4 pixels, but we have two components per line so width can remain as-is.
    let uv_width = if width % 2 == 1 { width + 1 } else { width };
    let uv_height = if height % 2 == 1 { height + 1 } else { height } / 2;

    copy_plane(src_uv, src_uv_stride, dst_uv, dst_uv_stride, uv_width, uv_height);
}
