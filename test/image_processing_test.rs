// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
mod tests {
    use vdec_kms::image_processing::copy_plane;
    use vdec_kms::image_processing::nv12_copy;

    /// A 2x2 NV12 picture stored with a stride of 4, with padding bytes set to 0xff.
    const SRC_Y: [u8; 8] = [1, 2, 0xff, 0xff, 3, 4, 0xff, 0xff];
    const SRC_UV: [u8; 4] = [5, 6, 0xff, 0xff];

    #[test]
    fn copy_into_wider_pitch() {
        let mut dst_y = [0u8; 16];
        let mut dst_uv = [0u8; 8];

        nv12_copy(&SRC_Y, 4, &mut dst_y, 8, &SRC_UV, 4, &mut dst_uv, 8, 2, 2);

        assert_eq!(dst_y, [1, 2, 0, 0, 0, 0, 0, 0, 3, 4, 0, 0, 0, 0, 0, 0]);
        assert_eq!(dst_uv, [5, 6, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn copy_into_tight_pitch() {
        let mut dst_y = [0u8; 4];
        let mut dst_uv = [0u8; 2];

        nv12_copy(&SRC_Y, 4, &mut dst_y, 2, &SRC_UV, 4, &mut dst_uv, 2, 2, 2);

        assert_eq!(dst_y, [1, 2, 3, 4]);
        assert_eq!(dst_uv, [5, 6]);
    }

    #[test]
    fn short_destination_is_not_overrun() {
        let mut dst = [0u8; 5];

        let rows = copy_plane(&SRC_Y, 4, &mut dst, 2, 2, 2);

        // The second row ends at byte 4, the last byte is left alone.
        assert_eq!(rows, 2);
        assert_eq!(dst, [1, 2, 3, 4, 0]);
    }

    #[test]
    fn short_source_stops_early() {
        let mut dst = [0u8; 8];

        let rows = copy_plane(&SRC_Y[..6], 4, &mut dst, 4, 2, 2);

        assert_eq!(rows, 2);
        assert_eq!(&dst[..6], &[1, 2, 0, 0, 3, 4]);
    }
}
