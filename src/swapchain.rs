// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Double-buffered presentation of decoded frames on the video plane.
//!
//! The chain owns two NV12 framebuffers. One of them, the *front* slot, is on screen. Each time a
//! page flip completes, the next decoded frame is copied into the other slot and a flip to it is
//! committed. At most one flip is outstanding at any time.

use crate::decoder::DecoderError;
use crate::decoder::FrameInfo;
use crate::decoder::FrameSource;
use crate::display::CommitMode;
use crate::display::Display;
use crate::display::KmsBackend;
use crate::display::KmsError;
use crate::display::Result;
use crate::framebuffer::Framebuffer;
use crate::utils::StopToken;
use crate::FOURCC_NV12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapChainState {
    Idle,
    Presenting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlipOutcome {
    /// A flip to `slot` was committed.
    Presented { slot: usize, frame: FrameInfo },
    /// No frame was committed this cycle, the current one stays on screen.
    Skipped,
    /// The stop token was triggered.
    Stopped,
    /// The flip limit was reached.
    Finished,
    /// The decoder returned its last frame.
    EndOfStream,
}

pub struct SwapChain<D> {
    slots: [Framebuffer<D>; 2],
    front: usize,
    state: SwapChainState,
    flips: u64,
    pending: bool,
    max_flips: Option<u64>,
    stop: StopToken,
}

impl<D> SwapChain<D> {
    /// Creates a chain over two NV12 framebuffers. It stops after `max_flips` flips if set, or
    /// once `stop` is triggered.
    pub fn new(
        slots: [Framebuffer<D>; 2],
        max_flips: Option<u64>,
        stop: StopToken,
    ) -> Result<Self> {
        if let Some(fb) = slots.iter().find(|fb| fb.format() != FOURCC_NV12) {
            return Err(KmsError::UnsupportedFormat(fb.format()));
        }

        Ok(Self {
            slots,
            front: 0,
            state: SwapChainState::Idle,
            flips: 0,
            pending: false,
            max_flips,
            stop,
        })
    }

    /// Shows the first decoded frame from slot 0, programming the plane's source rectangle with
    /// the same commit.
    ///
    /// Returns [`FlipOutcome::Skipped`] and stays idle if no frame is ready yet.
    pub fn start<B, S>(&mut self, display: &Display<B>, source: &mut S) -> Result<FlipOutcome>
    where
        B: KmsBackend<Dumb = D>,
        S: FrameSource,
    {
        if self.state != SwapChainState::Idle {
            return self.present(display, source);
        }

        let slot = &mut self.slots[0];
        let frame = match take_frame(slot, display.backend(), source)? {
            Ok(frame) => frame,
            Err(outcome) => return Ok(outcome),
        };

        if let Err(err) = display.show(slot.id(), Some(slot.size()), CommitMode::PageFlip) {
            log::warn!("Swap chain: first flip failed: {}", err);
            return Ok(FlipOutcome::Skipped);
        }

        log::info!(
            "Swap chain: presenting, first frame {} from CAPTURE buffer {}",
            frame.sequence,
            frame.index
        );
        self.state = SwapChainState::Presenting;
        self.front = 0;
        self.pending = true;

        Ok(FlipOutcome::Presented { slot: 0, frame })
    }

    /// Handles the completion of the outstanding flip and commits the next one.
    pub fn on_flip_complete<B, S>(
        &mut self,
        display: &Display<B>,
        source: &mut S,
    ) -> Result<FlipOutcome>
    where
        B: KmsBackend<Dumb = D>,
        S: FrameSource,
    {
        self.pending = false;

        if self.stop.is_stopped() {
            log::debug!("Swap chain: stop requested after {} flips", self.flips);
            return Ok(FlipOutcome::Stopped);
        }
        if self.max_flips.is_some_and(|max| self.flips >= max) {
            log::debug!("Swap chain: flip limit of {} reached", self.flips);
            return Ok(FlipOutcome::Finished);
        }

        self.present(display, source)
    }

    /// Copies the next decoded frame into the back slot and flips to it.
    ///
    /// Used directly to re-arm the chain when the previous cycle was skipped and no flip is
    /// pending. A failed commit is treated like a skipped cycle.
    pub fn present<B, S>(&mut self, display: &Display<B>, source: &mut S) -> Result<FlipOutcome>
    where
        B: KmsBackend<Dumb = D>,
        S: FrameSource,
    {
        if self.pending {
            return Err(KmsError::FlipPending);
        }
        if self.state == SwapChainState::Idle {
            return self.start(display, source);
        }

        let back = 1 - self.front;
        let slot = &mut self.slots[back];
        let frame = match take_frame(slot, display.backend(), source)? {
            Ok(frame) => frame,
            Err(outcome) => return Ok(outcome),
        };

        if let Err(err) = display.show(slot.id(), None, CommitMode::PageFlip) {
            log::warn!("Swap chain: flip to slot {} failed: {}", back, err);
            return Ok(FlipOutcome::Skipped);
        }

        log::trace!(
            "Swap chain: flip {} to slot {} (frame {})",
            self.flips + 1,
            back,
            frame.sequence
        );
        self.front = back;
        self.flips += 1;
        self.pending = true;

        Ok(FlipOutcome::Presented { slot: back, frame })
    }

    pub fn state(&self) -> SwapChainState {
        self.state
    }

    /// The slot currently on screen, or about to be.
    pub fn front(&self) -> usize {
        self.front
    }

    /// Number of flips committed after the first frame.
    pub fn flips(&self) -> u64 {
        self.flips
    }

    pub fn has_pending_flip(&self) -> bool {
        self.pending
    }

    pub fn into_framebuffers(self) -> [Framebuffer<D>; 2] {
        self.slots
    }
}

/// Copies the next frame into `slot`. The inner `Err` is the outcome to report when there is no
/// frame to show.
fn take_frame<B, S>(
    slot: &mut Framebuffer<B::Dumb>,
    backend: &B,
    source: &mut S,
) -> Result<std::result::Result<FrameInfo, FlipOutcome>>
where
    B: KmsBackend,
    S: FrameSource,
{
    match slot.write_nv12(backend, |dst| source.take_frame(dst))? {
        Ok(frame) => Ok(Ok(frame)),
        Err(DecoderError::NotReady) => {
            log::trace!("Swap chain: no decoded frame ready, skipping flip");
            Ok(Err(FlipOutcome::Skipped))
        }
        Err(DecoderError::EndOfStream) => {
            log::debug!("Swap chain: end of stream");
            Ok(Err(FlipOutcome::EndOfStream))
        }
        Err(err) => Err(KmsError::Frame(err)),
    }
}
