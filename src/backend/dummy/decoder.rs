// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder queues backed by plain vectors. The "hardware" only does what the test tells it to.

use std::collections::VecDeque;

use crate::decoder::CaptureBackend;
use crate::decoder::CaptureFormat;
use crate::decoder::DecoderError;
use crate::decoder::DequeuedBuffer;
use crate::decoder::OutputBackend;
use crate::decoder::OutputLayout;
use crate::decoder::PlaneData;
use crate::decoder::PlaneLayout;
use crate::decoder::Result;
use crate::DecodedFormat;
use crate::Fourcc;
use crate::Resolution;

/// A buffer as it was handed to the OUTPUT queue.
#[derive(Clone, Debug)]
pub struct QueuedUnit {
    pub index: usize,
    pub data: Vec<u8>,
    pub last: bool,
}

#[derive(Default)]
pub struct DummyOutput {
    buffers: Vec<Vec<u8>>,
    /// Buffers owned by the hardware, in queue order.
    pub queued: VecDeque<usize>,
    /// Number of queued buffers the hardware has consumed and will give back on dequeue.
    pub consumed: usize,
    pub history: Vec<QueuedUnit>,
    pub format: Option<Fourcc>,
    pub stream_on_count: usize,
    pub stop_count: usize,
    pub streaming: bool,
    pub released: bool,
    /// Allocate fewer buffers than requested, like a device with a smaller limit.
    pub max_buffers: Option<usize>,
    /// Consume every queued buffer as soon as a dequeue is attempted.
    pub auto_consume: bool,
    /// Reject the queue call with this position, counting from zero.
    pub fail_queue_call: Option<usize>,
    queue_calls: usize,
}

impl DummyOutput {
    pub fn new() -> Self {
        Default::default()
    }

    /// A decoder that consumes bitstream buffers as fast as they are queued.
    pub fn auto_consuming() -> Self {
        Self {
            auto_consume: true,
            ..Default::default()
        }
    }

    /// Lets the hardware finish `count` more of the queued buffers.
    pub fn consume(&mut self, count: usize) {
        self.consumed += count;
    }

    /// Lets the hardware finish everything it currently holds.
    pub fn consume_all(&mut self) {
        self.consumed = self.queued.len();
    }
}

impl OutputBackend for DummyOutput {
    fn configure(
        &mut self,
        format: Fourcc,
        max_buffer_bytes: u32,
        num_buffers: usize,
    ) -> Result<OutputLayout> {
        let num_buffers = self.max_buffers.map_or(num_buffers, |max| num_buffers.min(max));

        self.format = Some(format);
        self.buffers = vec![vec![0; max_buffer_bytes as usize]; num_buffers];

        Ok(OutputLayout {
            num_buffers,
            buffer_size: max_buffer_bytes as usize,
        })
    }

    fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        self.buffers
            .get_mut(index)
            .map(Vec::as_mut_slice)
            .ok_or(DecoderError::InvalidIndex(index))
    }

    fn queue(&mut self, index: usize, bytes_used: usize, last: bool) -> Result<()> {
        let call = self.queue_calls;
        self.queue_calls += 1;
        if self.fail_queue_call == Some(call) {
            return Err(anyhow::anyhow!("VIDIOC_QBUF failed on buffer {}", index).into());
        }
        if self.queued.contains(&index) {
            return Err(DecoderError::BufferBusy(index));
        }
        let buffer = self
            .buffers
            .get(index)
            .ok_or(DecoderError::InvalidIndex(index))?;

        self.history.push(QueuedUnit {
            index,
            data: buffer[..bytes_used].to_vec(),
            last,
        });
        self.queued.push_back(index);

        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize> {
        if self.auto_consume {
            self.consume_all();
        }
        if self.consumed == 0 {
            return Err(DecoderError::NotReady);
        }

        let index = self.queued.pop_front().ok_or(DecoderError::NotReady)?;
        self.consumed -= 1;

        Ok(index)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.stream_on_count += 1;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued.clear();
        self.consumed = 0;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_count += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.buffers.clear();
        self.released = true;
    }
}

pub struct DummyCapture {
    format: DecodedFormat,
    size: Resolution,
    /// `[buffer][plane]`
    buffers: Vec<Vec<Vec<u8>>>,
    /// Empty buffers owned by the hardware, in queue order.
    pub queued: VecDeque<usize>,
    /// Filled buffers waiting to be dequeued.
    pub ready: VecDeque<DequeuedBuffer>,
    sequence: u32,
    /// Frames left to decode on demand, see [`DummyCapture::decode_on_demand`].
    auto_frames: Option<usize>,
    eos_sent: bool,
    pub streaming: bool,
    pub released: bool,
}

impl DummyCapture {
    pub fn new(format: DecodedFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            size: Resolution::from((width, height)),
            buffers: Vec::new(),
            queued: Default::default(),
            ready: Default::default(),
            sequence: 0,
            auto_frames: None,
            eos_sent: false,
            streaming: false,
            released: false,
        }
    }

    pub fn nv12(width: u32, height: u32) -> Self {
        Self::new(DecodedFormat::NV12, width, height)
    }

    pub fn nm12(width: u32, height: u32) -> Self {
        Self::new(DecodedFormat::NM12, width, height)
    }

    fn luma_size(&self) -> usize {
        self.size.get_area()
    }

    fn plane_layouts(&self) -> Vec<PlaneLayout> {
        let stride = self.size.width as usize;
        let luma = self.luma_size();

        match self.format {
            DecodedFormat::NV12 => vec![PlaneLayout {
                stride,
                size: luma * 3 / 2,
            }],
            DecodedFormat::NM12 => vec![
                PlaneLayout { stride, size: luma },
                PlaneLayout {
                    stride,
                    size: luma / 2,
                },
            ],
        }
    }

    /// Decodes a frame into the oldest queued buffer: luma bytes are set to `value` and chroma
    /// bytes to `value + 1`. Returns the index of the filled buffer.
    pub fn produce(&mut self, value: u8) -> Option<usize> {
        let index = self.queued.pop_front()?;
        let luma_size = self.luma_size();

        let mut planes = Vec::new();
        for (plane, memory) in self.buffers[index].iter_mut().enumerate() {
            for (offset, byte) in memory.iter_mut().enumerate() {
                let is_luma = plane == 0 && offset < luma_size;
                *byte = if is_luma { value } else { value.wrapping_add(1) };
            }
            planes.push(PlaneData {
                bytes_used: memory.len(),
                data_offset: 0,
            });
        }

        self.ready.push_back(DequeuedBuffer {
            index,
            sequence: self.sequence,
            last: false,
            planes,
        });
        self.sequence += 1;

        Some(index)
    }

    /// Makes dequeue produce a frame whenever none is ready, `frames` times, then the empty last
    /// buffer.
    pub fn decode_on_demand(&mut self, frames: usize) {
        self.auto_frames = Some(frames);
        self.eos_sent = false;
    }

    /// Returns the oldest queued buffer empty and flagged as the last one.
    pub fn produce_last_empty(&mut self) -> Option<usize> {
        let index = self.queued.pop_front()?;

        self.ready.push_back(DequeuedBuffer {
            index,
            sequence: self.sequence,
            last: true,
            planes: vec![PlaneData::default(); self.format.num_mem_planes()],
        });

        Some(index)
    }
}

impl CaptureBackend for DummyCapture {
    fn configure(&mut self, num_buffers: usize) -> Result<CaptureFormat> {
        let planes = self.plane_layouts();

        self.buffers = (0..num_buffers)
            .map(|_| planes.iter().map(|plane| vec![0; plane.size]).collect())
            .collect();

        Ok(CaptureFormat {
            format: self.format,
            coded_size: self.size,
            visible_size: self.size,
            planes,
            num_buffers,
        })
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        if index >= self.buffers.len() {
            return Err(DecoderError::InvalidIndex(index));
        }
        if self.queued.contains(&index) || self.ready.iter().any(|b| b.index == index) {
            return Err(DecoderError::BufferBusy(index));
        }

        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        if self.ready.is_empty() {
            match self.auto_frames {
                Some(0) if !self.eos_sent => {
                    self.eos_sent = self.produce_last_empty().is_some();
                }
                Some(frames) if frames > 0 => {
                    if self.produce(frames as u8).is_some() {
                        self.auto_frames = Some(frames - 1);
                    }
                }
                _ => (),
            }
        }

        self.ready.pop_front().ok_or(DecoderError::NotReady)
    }

    fn plane(&self, index: usize, plane: usize) -> Result<&[u8]> {
        self.buffers
            .get(index)
            .and_then(|planes| planes.get(plane))
            .map(Vec::as_slice)
            .ok_or(DecoderError::InvalidIndex(index))
    }

    fn stream_on(&mut self) -> Result<()> {
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued.clear();
        self.ready.clear();
        Ok(())
    }

    fn release(&mut self) {
        self.buffers.clear();
        self.released = true;
    }
}
