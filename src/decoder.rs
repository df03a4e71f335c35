// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer queues of a stateful (memory-to-memory) decoder.
//!
//! A stateful decoder exposes two queues. The OUTPUT queue receives compressed access units and
//! is managed by [`output::OutputQueue`]. The CAPTURE queue hands back decoded frames and is
//! managed by [`capture::CaptureQueue`]. Both queues are generic over a backend that performs
//! the actual device operations, so the ownership bookkeeping in this module can be exercised
//! without hardware.
//!
//! Every buffer of either queue is at any time owned by exactly one side: the hardware, between
//! the moment it is queued and the moment it is dequeued, or the software otherwise. Software
//! must never touch the memory of a buffer owned by the hardware.

pub mod capture;
pub mod output;

use thiserror::Error;

use crate::DecodedFormat;
use crate::Fourcc;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum DecoderError {
    /// The hardware has no buffer to give back yet. Never fatal.
    #[error("no buffer is ready to be dequeued")]
    NotReady,
    #[error("the decoder has signalled the end of the stream")]
    EndOfStream,
    #[error("the queue has not been configured")]
    NotConfigured,
    #[error("the queue has already been configured")]
    AlreadyConfigured,
    #[error("access unit of {size} bytes does not fit in a {capacity} bytes buffer")]
    UnitTooLarge { size: usize, capacity: usize },
    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("buffer {0} is owned by the hardware")]
    BufferBusy(usize),
    #[error("unsupported decoded format {0}")]
    UnsupportedFormat(Fourcc),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;

/// Which side currently owns a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferOwner {
    #[default]
    Software,
    Hardware,
}

/// Layout of the OUTPUT queue after its buffers have been allocated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    /// Number of buffers the device actually allocated.
    pub num_buffers: usize,
    /// Usable size of each buffer in bytes.
    pub buffer_size: usize,
}

/// Device side of the bitstream queue.
pub trait OutputBackend {
    /// Sets the compressed `format` and the per-buffer size, then allocates and maps
    /// `num_buffers` buffers.
    fn configure(
        &mut self,
        format: Fourcc,
        max_buffer_bytes: u32,
        num_buffers: usize,
    ) -> Result<OutputLayout>;
    /// Mapped memory of buffer `index`.
    fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]>;
    /// Hands buffer `index` to the hardware with `bytes_used` valid bytes. `last` marks the final
    /// buffer of the stream.
    fn queue(&mut self, index: usize, bytes_used: usize, last: bool) -> Result<()>;
    /// Takes back a buffer the hardware is done with. Must not block.
    fn dequeue(&mut self) -> Result<usize>;
    fn stream_on(&mut self) -> Result<()>;
    fn stream_off(&mut self) -> Result<()>;
    /// Asks the decoder to drain and signal the end of the stream on its CAPTURE queue.
    fn stop(&mut self) -> Result<()>;
    /// Unmaps and frees all buffers.
    fn release(&mut self);
}

impl<B: OutputBackend + ?Sized> OutputBackend for &mut B {
    fn configure(
        &mut self,
        format: Fourcc,
        max_buffer_bytes: u32,
        num_buffers: usize,
    ) -> Result<OutputLayout> {
        (**self).configure(format, max_buffer_bytes, num_buffers)
    }

    fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        (**self).buffer_mut(index)
    }

    fn queue(&mut self, index: usize, bytes_used: usize, last: bool) -> Result<()> {
        (**self).queue(index, bytes_used, last)
    }

    fn dequeue(&mut self) -> Result<usize> {
        (**self).dequeue()
    }

    fn stream_on(&mut self) -> Result<()> {
        (**self).stream_on()
    }

    fn stream_off(&mut self) -> Result<()> {
        (**self).stream_off()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Memory layout of one plane of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bytes per line.
    pub stride: usize,
    /// Size of the plane's memory in bytes.
    pub size: usize,
}

/// Format of the CAPTURE queue, as picked by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub format: DecodedFormat,
    /// Size of the decoded buffers, including alignment padding.
    pub coded_size: Resolution,
    /// Part of `coded_size` that contains the picture.
    pub visible_size: Resolution,
    /// One entry per memory plane.
    pub planes: Vec<PlaneLayout>,
    /// Number of buffers the device actually allocated.
    pub num_buffers: usize,
}

/// Per-plane payload of a dequeued CAPTURE buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneData {
    pub bytes_used: usize,
    pub data_offset: usize,
}

/// A CAPTURE buffer the hardware has just given back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: usize,
    pub sequence: u32,
    /// The decoder flagged this buffer as the last of the stream.
    pub last: bool,
    pub planes: Vec<PlaneData>,
}

/// Device side of the decoded frames queue.
pub trait CaptureBackend {
    /// Reads the format the decoder selected, then allocates and maps `num_buffers` buffers.
    fn configure(&mut self, num_buffers: usize) -> Result<CaptureFormat>;
    /// Hands the empty buffer `index` to the hardware.
    fn queue(&mut self, index: usize) -> Result<()>;
    /// Takes back a filled buffer. Must not block.
    fn dequeue(&mut self) -> Result<DequeuedBuffer>;
    /// Mapped memory of memory plane `plane` of buffer `index`.
    fn plane(&self, index: usize, plane: usize) -> Result<&[u8]>;
    fn stream_on(&mut self) -> Result<()>;
    fn stream_off(&mut self) -> Result<()>;
    /// Unmaps and frees all buffers.
    fn release(&mut self);
}

impl<B: CaptureBackend + ?Sized> CaptureBackend for &mut B {
    fn configure(&mut self, num_buffers: usize) -> Result<CaptureFormat> {
        (**self).configure(num_buffers)
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        (**self).queue(index)
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        (**self).dequeue()
    }

    fn plane(&self, index: usize, plane: usize) -> Result<&[u8]> {
        (**self).plane(index, plane)
    }

    fn stream_on(&mut self) -> Result<()> {
        (**self).stream_on()
    }

    fn stream_off(&mut self) -> Result<()> {
        (**self).stream_off()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Writable plane of a frame, with its own pitch.
pub struct PlaneDst<'a> {
    pub data: &'a mut [u8],
    pub pitch: usize,
}

/// Where [`FrameSource::take_frame`] writes a decoded frame.
pub struct FrameDst<'a> {
    pub luma: PlaneDst<'a>,
    pub chroma: PlaneDst<'a>,
    /// Size of the destination picture. Anything beyond it is cropped.
    pub size: Resolution,
}

/// Information about a frame returned by [`FrameSource::take_frame`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Index of the CAPTURE buffer the frame came from.
    pub index: usize,
    pub sequence: u32,
    /// Size of the picture that was copied.
    pub size: Resolution,
    /// This frame is the last one of the stream.
    pub last: bool,
}

/// Something that can produce decoded NV12 frames into caller memory.
pub trait FrameSource {
    /// Copies the next decoded frame into `dst`. Returns [`DecoderError::NotReady`] when no frame
    /// is available yet.
    fn take_frame(&mut self, dst: &mut FrameDst) -> Result<FrameInfo>;
}
