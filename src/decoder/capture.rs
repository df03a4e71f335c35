// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoder::BufferOwner;
use crate::decoder::CaptureBackend;
use crate::decoder::CaptureFormat;
use crate::decoder::DecoderError;
use crate::decoder::DequeuedBuffer;
use crate::decoder::FrameDst;
use crate::decoder::FrameInfo;
use crate::decoder::FrameSource;
use crate::decoder::Result;
use crate::image_processing::nv12_copy;
use crate::DecodedFormat;

/// Pool of memory-mapped decoded frame buffers.
///
/// All buffers are handed to the hardware at configuration time. A buffer only comes back to the
/// software for the duration of a [`CaptureQueue::take_frame`] call, which queues it again before
/// returning, so the number of buffers available to the decoder never shrinks.
pub struct CaptureQueue<B: CaptureBackend> {
    backend: B,
    format: Option<CaptureFormat>,
    owners: Vec<BufferOwner>,
    streaming: bool,
}

impl<B: CaptureBackend> CaptureQueue<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            format: None,
            owners: Vec::new(),
            streaming: false,
        }
    }

    /// Allocates `num_buffers` buffers in the format chosen by the decoder, queues all of them
    /// and starts streaming.
    ///
    /// The decoder can only report its format once it has parsed the beginning of the stream,
    /// i.e. after the OUTPUT queue has started streaming.
    pub fn configure(&mut self, num_buffers: usize) -> Result<&CaptureFormat> {
        if self.format.is_some() {
            return Err(DecoderError::AlreadyConfigured);
        }

        let format = self.backend.configure(num_buffers)?;
        if format.planes.len() != format.format.num_mem_planes() {
            return Err(anyhow::anyhow!(
                "{:?} capture format reports {} memory planes",
                format.format,
                format.planes.len()
            )
            .into());
        }
        if format.num_buffers == 0 {
            return Err(anyhow::anyhow!("device allocated no CAPTURE buffers").into());
        }

        log::debug!("CAPTURE: format {:?}", format);

        self.owners = vec![BufferOwner::Software; format.num_buffers];
        for index in 0..format.num_buffers {
            self.queue(index)?;
        }

        self.backend.stream_on()?;
        self.streaming = true;
        log::debug!("CAPTURE: state: Init -> Streaming");

        Ok(self.format.insert(format))
    }

    /// Dequeues the next decoded frame, copies it into `dst` and queues the buffer again.
    ///
    /// Returns [`DecoderError::NotReady`] if the hardware has not finished any frame yet, and
    /// [`DecoderError::EndOfStream`] once the decoder returns its empty last buffer.
    pub fn take_frame(&mut self, dst: &mut FrameDst) -> Result<FrameInfo> {
        let format = self.format.as_ref().ok_or(DecoderError::NotConfigured)?;

        let buffer = self.backend.dequeue()?;
        match self.owners.get_mut(buffer.index) {
            Some(owner) => *owner = BufferOwner::Software,
            None => return Err(DecoderError::InvalidIndex(buffer.index)),
        }

        log::trace!(
            "CAPTURE: dequeued buffer index={} sequence={} last={} planes={:?}",
            buffer.index,
            buffer.sequence,
            buffer.last,
            buffer.planes
        );

        let copied = copy_frame(&self.backend, format, &buffer, dst);

        // The buffer goes back to the hardware whatever happened to its content.
        self.queue(buffer.index)?;

        copied
    }

    /// Stops the queue, which returns every buffer to the software.
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }

        self.backend.stream_off()?;
        self.streaming = false;
        self.owners.fill(BufferOwner::Software);
        log::debug!("CAPTURE: state: Streaming -> Stopped");

        Ok(())
    }

    /// Unmaps and frees all buffers.
    pub fn release(&mut self) {
        self.backend.release();
        self.owners.clear();
        self.format = None;
    }

    pub fn format(&self) -> Option<&CaptureFormat> {
        self.format.as_ref()
    }

    pub fn num_buffers(&self) -> usize {
        self.owners.len()
    }

    pub fn hardware_owned(&self) -> usize {
        self.owners
            .iter()
            .filter(|owner| **owner == BufferOwner::Hardware)
            .count()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        self.backend.queue(index)?;
        self.owners[index] = BufferOwner::Hardware;
        log::trace!("CAPTURE: queued buffer index={}", index);

        Ok(())
    }
}

impl<B: CaptureBackend> FrameSource for CaptureQueue<B> {
    fn take_frame(&mut self, dst: &mut FrameDst) -> Result<FrameInfo> {
        CaptureQueue::take_frame(self, dst)
    }
}

/// Returns the payload of memory plane `plane` of `buffer`.
fn payload<'a, B: CaptureBackend>(
    backend: &'a B,
    buffer: &DequeuedBuffer,
    plane: usize,
) -> Result<&'a [u8]> {
    let data = buffer
        .planes
        .get(plane)
        .ok_or_else(|| anyhow::anyhow!("buffer {} has no plane {}", buffer.index, plane))?;
    let mapping = backend.plane(buffer.index, plane)?;

    let end = data.bytes_used.min(mapping.len());
    let start = data.data_offset.min(end);

    Ok(&mapping[start..end])
}

fn copy_frame<B: CaptureBackend>(
    backend: &B,
    format: &CaptureFormat,
    buffer: &DequeuedBuffer,
    dst: &mut FrameDst,
) -> Result<FrameInfo> {
    let luma_plane = payload(backend, buffer, 0)?;
    if luma_plane.is_empty() {
        return Err(if buffer.last {
            DecoderError::EndOfStream
        } else {
            log::warn!("CAPTURE: dequeued empty buffer {}", buffer.index);
            DecoderError::NotReady
        });
    }

    let luma_stride = format.planes[0].stride;
    let (luma, chroma, chroma_stride) = match format.format {
        DecodedFormat::NV12 => {
            let luma_size = luma_stride * format.coded_size.height as usize;
            let split = luma_size.min(luma_plane.len());
            let (luma, chroma) = luma_plane.split_at(split);
            (luma, chroma, luma_stride)
        }
        DecodedFormat::NM12 => (
            luma_plane,
            payload(backend, buffer, 1)?,
            format.planes[1].stride,
        ),
    };

    let size = format.visible_size.intersect(dst.size);

    nv12_copy(
        luma,
        luma_stride,
        dst.luma.data,
        dst.luma.pitch,
        chroma,
        chroma_stride,
        dst.chroma.data,
        dst.chroma.pitch,
        size.width as usize,
        size.height as usize,
    );

    Ok(FrameInfo {
        index: buffer.index,
        sequence: buffer.sequence,
        size,
        last: buffer.last,
    })
}
