// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vdec-kms-play, a minimal player decoding H.264 with a V4L2 stateful decoder and presenting
//! the frames with atomic page flips on the video plane of a DRM/KMS display.

use std::ffi::c_int;
use std::sync::OnceLock;

use anyhow::Context;
use nix::sys::signal::sigaction;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;

use vdec_kms::backend::kms::DrmBackend;
use vdec_kms::backend::v4l2::decoder as v4l2_decoder;
use vdec_kms::pipeline::Pipeline;
use vdec_kms::stream::open_source;
use vdec_kms::utils::StopToken;

use crate::util::Args;

mod util;

static STOP: OnceLock<StopToken> = OnceLock::new();

extern "C" fn handle_stop_signal(_: c_int) {
    if let Some(stop) = STOP.get() {
        stop.stop();
    }
}

fn install_signal_handlers(stop: StopToken) -> anyhow::Result<()> {
    STOP.set(stop)
        .map_err(|_| anyhow::anyhow!("signal handlers already installed"))?;

    let action = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("failed to install the {:?} handler", signal))?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let stop = StopToken::new();
    install_signal_handlers(stop.clone())?;

    let mut source = open_source(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;

    let (output, capture) = v4l2_decoder::open(&args.decoder)?;
    let kms = DrmBackend::open(&args.card)
        .with_context(|| format!("failed to open {}", args.card.display()))?;

    let mut pipeline = Pipeline::new(args.pipeline_config(), output, capture, kms, stop)
        .context("failed to find a display")?;

    let result = pipeline
        .setup(source.as_mut())
        .context("failed to set up playback")
        .and_then(|()| pipeline.run(source.as_mut()).context("playback failed"));

    // Teardown runs whatever happened before, its own error only matters if playback succeeded.
    let teardown = pipeline.teardown().context("failed to tear down");

    let summary = result?;
    teardown?;

    log::info!(
        "Stopped ({:?}) after {} frames, {} flips, {} units submitted, {} dropped",
        summary.reason,
        summary.frames,
        summary.flips,
        summary.submitted_units,
        summary.dropped_units
    );

    Ok(())
}
