// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::thread;
use std::time::Duration;

use crate::decoder::BufferOwner;
use crate::decoder::DecoderError;
use crate::decoder::OutputBackend;
use crate::decoder::Result;
use crate::Fourcc;

/// What happened to an access unit passed to [`OutputQueue::submit`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The unit was copied into the buffer with this index and queued to the hardware.
    Queued(usize),
    /// Every buffer was owned by the hardware and none could be reclaimed, so the unit was
    /// discarded.
    Dropped,
}

/// Pool of memory-mapped bitstream buffers feeding the decoder.
pub struct OutputQueue<B: OutputBackend> {
    backend: B,
    owners: Vec<BufferOwner>,
    buffer_size: usize,
    /// Round-robin cursor, the first buffer considered by the next submission.
    next_index: usize,
    streaming: bool,
    finished: bool,
    settle_interval: Duration,
}

impl<B: OutputBackend> OutputQueue<B> {
    /// Creates an unconfigured queue. `settle_interval` is how long to wait after the queue
    /// starts streaming, before more units are submitted.
    pub fn new(backend: B, settle_interval: Duration) -> Self {
        Self {
            backend,
            owners: Vec::new(),
            buffer_size: 0,
            next_index: 0,
            streaming: false,
            finished: false,
            settle_interval,
        }
    }

    /// Negotiates `format` and allocates `num_buffers` buffers of `max_buffer_bytes` each.
    pub fn configure(
        &mut self,
        format: Fourcc,
        max_buffer_bytes: u32,
        num_buffers: usize,
    ) -> Result<()> {
        if !self.owners.is_empty() {
            return Err(DecoderError::AlreadyConfigured);
        }

        let layout = self
            .backend
            .configure(format, max_buffer_bytes, num_buffers)?;
        if layout.num_buffers == 0 {
            return Err(anyhow::anyhow!("device allocated no OUTPUT buffers").into());
        }

        log::debug!(
            "OUTPUT: configured format={} num_buffers={} buffer_size={}",
            format,
            layout.num_buffers,
            layout.buffer_size
        );

        self.owners = vec![BufferOwner::Software; layout.num_buffers];
        self.buffer_size = layout.buffer_size;
        self.next_index = 0;

        Ok(())
    }

    /// Copies `unit` into the next free buffer and queues it.
    ///
    /// If all buffers are owned by the hardware, one attempt is made at dequeuing a consumed
    /// buffer. If that fails too the unit is dropped, which is reported as
    /// [`SubmitOutcome::Dropped`] rather than as an error.
    ///
    /// The first successful submission also starts streaming on the queue.
    pub fn submit(&mut self, unit: &[u8]) -> Result<SubmitOutcome> {
        if self.owners.is_empty() {
            return Err(DecoderError::NotConfigured);
        }

        if unit.is_empty() {
            log::warn!("OUTPUT: ignoring empty access unit");
            return Ok(SubmitOutcome::Dropped);
        }

        if unit.len() > self.buffer_size {
            return Err(DecoderError::UnitTooLarge {
                size: unit.len(),
                capacity: self.buffer_size,
            });
        }

        let Some(index) = self.acquire()? else {
            log::warn!(
                "OUTPUT: no free buffer, dropping access unit of {} bytes",
                unit.len()
            );
            return Ok(SubmitOutcome::Dropped);
        };

        let buffer = self.backend.buffer_mut(index)?;
        if buffer.len() < unit.len() {
            return Err(DecoderError::UnitTooLarge {
                size: unit.len(),
                capacity: buffer.len(),
            });
        }
        buffer[..unit.len()].copy_from_slice(unit);

        self.queue(index, unit.len(), false)?;

        if !self.streaming {
            self.backend.stream_on()?;
            self.streaming = true;
            log::debug!("OUTPUT: state: Init -> Streaming");

            if !self.settle_interval.is_zero() {
                thread::sleep(self.settle_interval);
            }
        }

        Ok(SubmitOutcome::Queued(index))
    }

    /// Signals the end of the stream to the decoder.
    ///
    /// An empty buffer carrying the LAST flag is queued if one can be obtained, then the decoder
    /// is asked to stop. Calling this more than once has no effect.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.owners.is_empty() {
            return Err(DecoderError::NotConfigured);
        }

        self.finished = true;

        if !self.streaming {
            log::debug!("OUTPUT: end of stream before streaming started");
            return Ok(());
        }

        match self.acquire()? {
            Some(index) => {
                self.queue(index, 0, true)?;
                log::debug!("OUTPUT: queued LAST buffer index={}", index);
            }
            None => log::warn!("OUTPUT: no free buffer to carry the LAST flag"),
        }

        // Not every driver implements the stop command, the LAST buffer may be enough.
        if let Err(err) = self.backend.stop() {
            log::warn!("OUTPUT: failed to send stop command: {}", err);
        }

        Ok(())
    }

    /// Takes back every buffer the hardware has finished consuming. Returns how many buffers
    /// became free.
    pub fn reclaim(&mut self) -> Result<usize> {
        let mut reclaimed = 0;

        while self.hardware_owned() > 0 {
            match self.dequeue() {
                Ok(_) => reclaimed += 1,
                Err(DecoderError::NotReady) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(reclaimed)
    }

    /// Stops the queue, which returns every buffer to the software.
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }

        self.backend.stream_off()?;
        self.streaming = false;
        self.owners.fill(BufferOwner::Software);
        log::debug!("OUTPUT: state: Streaming -> Stopped");

        Ok(())
    }

    /// Unmaps and frees all buffers. The queue must be configured again before further use.
    pub fn release(&mut self) {
        self.backend.release();
        self.owners.clear();
        self.buffer_size = 0;
    }

    pub fn num_buffers(&self) -> usize {
        self.owners.len()
    }

    pub fn free_buffers(&self) -> usize {
        self.owners
            .iter()
            .filter(|owner| **owner == BufferOwner::Software)
            .count()
    }

    pub fn hardware_owned(&self) -> usize {
        self.num_buffers() - self.free_buffers()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Returns a software-owned buffer, dequeuing one from the hardware if none is free.
    fn acquire(&mut self) -> Result<Option<usize>> {
        if let Some(index) = self.next_free() {
            return Ok(Some(index));
        }

        match self.dequeue() {
            Ok(_) => Ok(self.next_free()),
            Err(DecoderError::NotReady) | Err(DecoderError::EndOfStream) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn next_free(&self) -> Option<usize> {
        let num_buffers = self.owners.len();

        (0..num_buffers)
            .map(|offset| (self.next_index + offset) % num_buffers)
            .find(|index| self.owners[*index] == BufferOwner::Software)
    }

    fn queue(&mut self, index: usize, bytes_used: usize, last: bool) -> Result<()> {
        self.backend.queue(index, bytes_used, last)?;
        self.owners[index] = BufferOwner::Hardware;
        self.next_index = (index + 1) % self.owners.len();

        log::trace!(
            "OUTPUT: queued buffer index={} bytes_used={} last={}",
            index,
            bytes_used,
            last
        );

        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize> {
        let index = self.backend.dequeue()?;

        match self.owners.get_mut(index) {
            Some(owner @ BufferOwner::Hardware) => *owner = BufferOwner::Software,
            Some(BufferOwner::Software) => {
                log::warn!("OUTPUT: dequeued buffer {} was not queued", index)
            }
            None => return Err(DecoderError::InvalidIndex(index)),
        }

        log::trace!("OUTPUT: dequeued buffer index={}", index);

        Ok(index)
    }
}
