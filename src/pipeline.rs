// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives the decoder queues and the swap chain from a single thread.
//!
//! The pipeline owns the whole chain: the display, both decoder queues and the framebuffers.
//! [`Pipeline::setup`] brings everything up in a fixed order, [`Pipeline::run`] keeps the decoder
//! fed and the display flipping, and [`Pipeline::teardown`] puts everything back, also after a
//! partial setup or a failed run.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::decoder::capture::CaptureQueue;
use crate::decoder::output::OutputQueue;
use crate::decoder::output::SubmitOutcome;
use crate::decoder::CaptureBackend;
use crate::decoder::DecoderError;
use crate::decoder::OutputBackend;
use crate::display::Display;
use crate::display::KmsBackend;
use crate::display::KmsError;
use crate::display::ModeRequest;
use crate::framebuffer::Framebuffer;
use crate::stream::UnitSource;
use crate::swapchain::FlipOutcome;
use crate::swapchain::SwapChain;
use crate::swapchain::SwapChainState;
use crate::utils::StopToken;
use crate::Resolution;
use crate::FOURCC_H264;
use crate::FOURCC_NV12;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("decoder: {0}")]
    Decoder(#[from] DecoderError),
    #[error("display: {0}")]
    Display(#[from] KmsError),
    #[error("source: {0:#}")]
    Source(anyhow::Error),
    #[error("the stream ended before the decoder started")]
    StreamTooShort,
    #[error("the pipeline has not been set up")]
    NotSetUp,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Number of bitstream buffers.
    pub num_output_buffers: usize,
    /// Number of decoded frame buffers.
    pub num_capture_buffers: usize,
    /// Size of each bitstream buffer.
    pub max_bitstream_bytes: u32,
    /// Wait after the bitstream queue starts streaming.
    pub settle_interval: Duration,
    pub display_mode: ModeRequest,
    /// Use the connector's preferred mode if `display_mode` is not available.
    pub fallback_to_preferred_mode: bool,
    /// Size of the black buffer shown until the first frame is decoded.
    pub blank_size: Resolution,
    /// How long to wait for a page flip event per cycle.
    pub event_timeout: Duration,
    /// Stop after that many flips.
    pub max_flips: Option<u64>,
    /// Cycles without a frame after the end of the stream before giving up on the decoder.
    pub eos_idle_cycles: usize,
    /// Consecutive event waits without the pending page flip completing before giving up on
    /// the display.
    pub flip_timeout_cycles: usize,
    /// Pause between cycles when no flip is pending and no frame was ready.
    pub retry_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_output_buffers: 6,
            num_capture_buffers: 6,
            max_bitstream_bytes: 512 * 1024,
            settle_interval: Duration::from_secs(1),
            display_mode: ModeRequest::default(),
            fallback_to_preferred_mode: false,
            blank_size: Resolution::from((1280, 720)),
            event_timeout: Duration::from_millis(100),
            max_flips: None,
            eos_idle_cycles: 50,
            flip_timeout_cycles: 100,
            retry_interval: Duration::from_millis(5),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The stop token was triggered.
    Stopped,
    /// `max_flips` flips were done.
    FlipLimit,
    EndOfStream,
    /// The pending page flip never completed.
    FlipTimeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: StopReason,
    /// Frames shown, including the first one.
    pub frames: u64,
    pub flips: u64,
    pub submitted_units: u64,
    pub dropped_units: u64,
}

pub struct Pipeline<O, C, K>
where
    O: OutputBackend,
    C: CaptureBackend,
    K: KmsBackend,
{
    config: PipelineConfig,
    display: Display<K>,
    output: OutputQueue<O>,
    capture: CaptureQueue<C>,
    blank: Option<Framebuffer<K::Dumb>>,
    chain: Option<SwapChain<K::Dumb>>,
    stop: StopToken,
    source_done: bool,
    submitted_units: u64,
    dropped_units: u64,
}

impl<O, C, K> Pipeline<O, C, K>
where
    O: OutputBackend,
    C: CaptureBackend,
    K: KmsBackend,
{
    /// Discovers the display. Nothing is changed on any device yet.
    pub fn new(
        config: PipelineConfig,
        output: O,
        capture: C,
        kms: K,
        stop: StopToken,
    ) -> Result<Self> {
        let display = Display::discover(kms)?;

        Ok(Self {
            output: OutputQueue::new(output, config.settle_interval),
            capture: CaptureQueue::new(capture),
            config,
            display,
            blank: None,
            chain: None,
            stop,
            source_done: false,
            submitted_units: 0,
            dropped_units: 0,
        })
    }

    /// Sets the display mode and starts decoding `source`, up to the point where frames can be
    /// presented.
    ///
    /// Any error is fatal, but [`Pipeline::teardown`] must still be called to release whatever
    /// was set up.
    pub fn setup<S: UnitSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        let config = &self.config;

        let blank = Framebuffer::create(
            self.display.backend(),
            config.blank_size.width,
            config.blank_size.height,
            FOURCC_NV12,
        )?;
        let blank = self.blank.insert(blank);

        let mode = match self.display.select_mode(&config.display_mode) {
            Some(mode) => Some(mode),
            None if config.fallback_to_preferred_mode => {
                log::warn!(
                    "Mode {} not available, using the preferred mode",
                    config.display_mode
                );
                self.display.preferred_mode()
            }
            None => return Err(KmsError::NoMode(config.display_mode).into()),
        };
        self.display.set_mode(mode, blank)?;

        self.output.configure(
            FOURCC_H264,
            config.max_bitstream_bytes,
            config.num_output_buffers,
        )?;

        // Fill the bitstream pool. The first queued unit starts the OUTPUT queue.
        while self.output.free_buffers() > 0 && !self.source_done {
            self.submit_next(source)?;
        }
        if !self.output.is_streaming() {
            return Err(PipelineError::StreamTooShort);
        }

        let visible_size = self
            .capture
            .configure(self.config.num_capture_buffers)?
            .visible_size;
        log::info!("Decoding {}", visible_size);

        let backend = self.display.backend();
        let first = Framebuffer::create(
            backend,
            visible_size.width,
            visible_size.height,
            FOURCC_NV12,
        )?;
        let second = match Framebuffer::create(
            backend,
            visible_size.width,
            visible_size.height,
            FOURCC_NV12,
        ) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = first.destroy(backend) {
                    log::warn!("Failed to destroy framebuffer: {}", err);
                }
                return Err(err.into());
            }
        };
        self.chain = Some(SwapChain::new(
            [first, second],
            self.config.max_flips,
            self.stop.clone(),
        )?);

        for _ in 0..self.config.num_capture_buffers {
            self.output.reclaim()?;
            if self.source_done {
                break;
            }
            self.submit_next(source)?;
        }

        log::debug!(
            "Pipeline set up: {} units submitted, {} dropped",
            self.submitted_units,
            self.dropped_units
        );

        Ok(())
    }

    /// Presents decoded frames until the stream ends, the flip limit is reached or the stop token
    /// is triggered.
    pub fn run<S: UnitSource + ?Sized>(&mut self, source: &mut S) -> Result<RunSummary> {
        if self.chain.is_none() {
            return Err(PipelineError::NotSetUp);
        }

        let mut frames = 0;
        let mut idle_cycles = 0;
        let mut missed_events = 0;

        let reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Stopped;
            }

            self.feed(source)?;

            let chain = self.chain.as_mut().ok_or(PipelineError::NotSetUp)?;
            let outcome = if chain.state() == SwapChainState::Idle {
                chain.start(&self.display, &mut self.capture)?
            } else if chain.has_pending_flip() {
                if self.display.wait_flips(self.config.event_timeout)?.is_empty() {
                    missed_events += 1;
                    if self.output.is_finished() {
                        idle_cycles += 1;
                        if idle_cycles >= self.config.eos_idle_cycles {
                            log::warn!(
                                "No page flip event for {} cycles after the end of the stream",
                                missed_events
                            );
                            break StopReason::EndOfStream;
                        }
                    }
                    if missed_events >= self.config.flip_timeout_cycles {
                        log::error!("Page flip not completed after {} waits", missed_events);
                        break StopReason::FlipTimeout;
                    }
                    continue;
                }
                missed_events = 0;
                chain.on_flip_complete(&self.display, &mut self.capture)?
            } else {
                chain.present(&self.display, &mut self.capture)?
            };

            match outcome {
                FlipOutcome::Presented { .. } => {
                    frames += 1;
                    idle_cycles = 0;
                }
                FlipOutcome::Skipped => {
                    if self.output.is_finished() {
                        idle_cycles += 1;
                        if idle_cycles >= self.config.eos_idle_cycles {
                            log::warn!(
                                "No frame for {} cycles after the end of the stream",
                                idle_cycles
                            );
                            break StopReason::EndOfStream;
                        }
                    }
                    if !chain.has_pending_flip() && !self.config.retry_interval.is_zero() {
                        thread::sleep(self.config.retry_interval);
                    }
                }
                FlipOutcome::Stopped => break StopReason::Stopped,
                FlipOutcome::Finished => break StopReason::FlipLimit,
                FlipOutcome::EndOfStream => break StopReason::EndOfStream,
            }
        };

        let summary = RunSummary {
            reason,
            frames,
            flips: self.chain.as_ref().map_or(0, |chain| chain.flips()),
            submitted_units: self.submitted_units,
            dropped_units: self.dropped_units,
        };
        log::info!("Playback done: {:?}", summary);

        Ok(summary)
    }

    /// Stops both queues, frees the framebuffers and restores the display.
    ///
    /// Every step runs even if an earlier one fails. The first error is returned.
    pub fn teardown(mut self) -> Result<()> {
        let mut result = Ok(());
        let mut keep_first = |step: Result<()>| {
            if let Err(err) = step {
                log::error!("Teardown: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        if self.chain.as_ref().is_some_and(|chain| chain.has_pending_flip()) {
            match self.display.wait_flips(self.config.event_timeout) {
                Ok(events) if events.is_empty() => log::warn!("Teardown: last flip never completed"),
                Ok(_) => (),
                Err(err) => keep_first(Err(err.into())),
            }
        }

        keep_first(self.output.stream_off().map_err(Into::into));
        keep_first(self.capture.stream_off().map_err(Into::into));
        self.output.release();
        self.capture.release();

        let backend = self.display.backend();
        let slots = self.chain.take().map(SwapChain::into_framebuffers);
        for fb in slots.into_iter().flatten().chain(self.blank.take()) {
            keep_first(fb.destroy(backend).map_err(Into::into));
        }

        keep_first(self.display.restore().map_err(Into::into));

        log::debug!("Teardown done");
        result
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn display(&self) -> &Display<K> {
        &self.display
    }

    pub fn output(&self) -> &OutputQueue<O> {
        &self.output
    }

    pub fn capture(&self) -> &CaptureQueue<C> {
        &self.capture
    }

    /// Reclaims consumed bitstream buffers and refills them from `source`.
    fn feed<S: UnitSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.output.reclaim()?;

        while self.output.free_buffers() > 0 && !self.source_done {
            self.submit_next(source)?;
        }

        if self.source_done && !self.output.is_finished() {
            log::info!(
                "End of stream after {} units ({} dropped)",
                self.submitted_units,
                self.dropped_units
            );
            self.output.finish()?;
        }

        Ok(())
    }

    fn submit_next<S: UnitSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        let Some(unit) = source.next_unit().map_err(PipelineError::Source)? else {
            self.source_done = true;
            return Ok(());
        };

        // Once frames can be presented a unit the decoder refuses only costs that unit.
        let outcome = match self.output.submit(&unit) {
            Ok(outcome) => outcome,
            Err(err) if self.chain.is_some() && is_droppable(&err) => {
                log::warn!("Dropping access unit of {} bytes: {}", unit.len(), err);
                SubmitOutcome::Dropped
            }
            Err(err) => return Err(err.into()),
        };

        match outcome {
            SubmitOutcome::Queued(index) => {
                log::trace!("Unit of {} bytes in OUTPUT buffer {}", unit.len(), index);
                self.submitted_units += 1;
            }
            SubmitOutcome::Dropped => self.dropped_units += 1,
        }

        Ok(())
    }
}

fn is_droppable(err: &DecoderError) -> bool {
    matches!(
        err,
        DecoderError::UnitTooLarge { .. } | DecoderError::BufferBusy(_) | DecoderError::Backend(_)
    )
}
