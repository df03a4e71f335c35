// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

use vdec_kms::display::ModeRequest;
use vdec_kms::pipeline::PipelineConfig;
use vdec_kms::Resolution;

/// Plays an H.264 stream through a V4L2 stateful decoder onto a DRM/KMS display
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file, either an Annex-B H.264 stream or a Matroska file
    #[argh(positional)]
    pub input: PathBuf,

    /// path to the V4L2 decoder device. Default: /dev/video0
    #[argh(option, default = "PathBuf::from(\"/dev/video0\")")]
    pub decoder: PathBuf,

    /// path to the DRM device. Default: /dev/dri/card0
    #[argh(option, default = "PathBuf::from(\"/dev/dri/card0\")")]
    pub card: PathBuf,

    /// number of bitstream buffers. Default: 6
    #[argh(option, default = "6")]
    pub output_buffers: usize,

    /// number of decoded frame buffers. Default: 6
    #[argh(option, default = "6")]
    pub capture_buffers: usize,

    /// stop after this many page flips
    #[argh(option)]
    pub max_flips: Option<u64>,

    /// display mode as WIDTHxHEIGHT@REFRESH. Default: 1920x1080@50
    #[argh(option, default = "ModeRequest::default()")]
    pub mode: ModeRequest,

    /// use the connector's preferred mode if the requested one is not available
    #[argh(switch)]
    pub fallback_mode: bool,

    /// size of the blanking buffer shown at mode set. Default: 1280x720
    #[argh(option, default = "Resolution::from((1280, 720))")]
    pub blank_size: Resolution,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            num_output_buffers: self.output_buffers,
            num_capture_buffers: self.capture_buffers,
            display_mode: self.mode,
            fallback_to_preferred_mode: self.fallback_mode,
            blank_size: self.blank_size,
            max_flips: self.max_flips,
            ..Default::default()
        }
    }
}
