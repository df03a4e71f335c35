// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Queue backends of a V4L2 stateful decoder.
//!
//! Both queues share one [`Device`]. Every buffer is memory-mapped once when the queue is
//! configured and stays mapped until [`OutputBackend::release`] or [`CaptureBackend::release`],
//! so the queue managers can read and write buffer memory by index.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use thiserror::Error;
use v4l2r::bindings::v4l2_decoder_cmd;
use v4l2r::bindings::V4L2_DEC_CMD_STOP;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::qbuf::get_indexed::GetCaptureBufferByIndex;
use v4l2r::device::queue::qbuf::get_indexed::GetOutputBufferByIndex;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::CreateQueueError;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::queue::RequestBuffersError;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::ioctl::PlaneMapping;
use v4l2r::ioctl::StreamOnError;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::ioctl::V4l2BufferFromError;
use v4l2r::memory::MemoryType;
use v4l2r::memory::MmapHandle;
use v4l2r::Format;
use v4l2r::PlaneLayout as V4l2PlaneLayout;
use v4l2r::QueueType;

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

/// How many times the CAPTURE format is read before giving up on the decoder reporting one.
const FORMAT_RETRIES: usize = 100;
const FORMAT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Trailing zero bytes carried by the empty buffer that closes the stream. The kernel reads
/// `bytesused == 0` on an OUTPUT buffer as "the whole buffer".
const END_OF_STREAM_PADDING: usize = 4;

const VIDIOC_DECODER_CMD: u8 = 96;
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', VIDIOC_DECODER_CMD, v4l2_decoder_cmd);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to create queue: {0:?}")]
    CreateQueue(#[from] CreateQueueError),

    #[error("failed to set format: {0:?}")]
    SetFormat(#[from] ioctl::SFmtError),

    #[error("failed to get format: {0:?}")]
    GetFormat(#[from] ioctl::GFmtError),

    #[error("failed to request buffers: {0:?}")]
    RequestBuffers(#[from] RequestBuffersError),

    #[error("failed to map buffer {0}: {1}")]
    MapBuffer(usize, anyhow::Error),

    #[error("failed to queue buffer {0}: {1}")]
    QueueBuffer(usize, anyhow::Error),

    #[error(transparent)]
    DequeueBuffer(ioctl::DqBufError<V4l2BufferFromError>),

    #[error("failed to stream on: {0:?}")]
    StreamOn(#[from] StreamOnError),

    #[error("failed to stream off: {0}")]
    StreamOff(anyhow::Error),

    #[error("failed to send decoder command: {0}")]
    DecoderCommand(#[from] nix::Error),

    #[error("the decoder did not report a CAPTURE format")]
    NoCaptureFormat,

    #[error("the queue is not allocated")]
    NotAllocated,
}

impl From<BackendError> for DecoderError {
    fn from(value: BackendError) -> Self {
        DecoderError::Backend(anyhow!(value))
    }
}

/// Maps the transient outcomes of `VIDIOC_DQBUF` to their [`DecoderError`] counterparts.
impl From<ioctl::DqBufError<V4l2BufferFromError>> for DecoderError {
    fn from(value: ioctl::DqBufError<V4l2BufferFromError>) -> Self {
        match value {
            ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady) => {
                DecoderError::NotReady
            }
            ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::Eos) => {
                DecoderError::EndOfStream
            }
            err => BackendError::DequeueBuffer(err).into(),
        }
    }
}

/// Opens the decoder node at `path` and returns both of its queues.
pub fn open(path: &Path) -> anyhow::Result<(V4l2OutputBackend, V4l2CaptureBackend)> {
    let config = DeviceConfig::new().non_blocking_dqbuf();
    let device = Arc::new(
        Device::open(path, config)
            .with_context(|| format!("failed to open decoder {}", path.display()))?,
    );

    let caps = device.caps();
    log::info!(
        "Using decoder {} (driver {}, bus {})",
        caps.card,
        caps.driver,
        caps.bus_info
    );

    let output = V4l2OutputBackend::new(device.clone())
        .with_context(|| format!("{} has no multi-planar OUTPUT queue", path.display()))?;
    let capture = V4l2CaptureBackend::new(device)
        .with_context(|| format!("{} has no multi-planar CAPTURE queue", path.display()))?;

    Ok((output, capture))
}

/// Maps every plane of the first `num_buffers` buffers of `queue`.
fn map_buffers(
    device: &Device,
    queue: QueueType,
    num_buffers: usize,
) -> std::result::Result<Vec<Vec<PlaneMapping>>, BackendError> {
    (0..num_buffers)
        .map(|index| {
            let buffer: V4l2Buffer = ioctl::querybuf(device, queue, index)
                .map_err(|err| BackendError::MapBuffer(index, anyhow!("{err}")))?;

            buffer
                .as_v4l2_planes()
                .iter()
                // SAFETY: the offset and length were just returned by QUERYBUF for an MMAP
                // buffer of this device, and the plane union holds `mem_offset` for MMAP memory.
                .map(|plane| unsafe { ioctl::mmap(device, plane.m.mem_offset, plane.length) })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| BackendError::MapBuffer(index, anyhow!("{err}")))
        })
        .collect()
}

#[derive(Default)]
enum OutputQueueHandle {
    Init(Queue<Output, QueueInit>),
    Allocated(Queue<Output, BuffersAllocated<Vec<MmapHandle>>>),
    #[default]
    Unknown,
}

/// Bitstream queue of a V4L2 stateful decoder.
pub struct V4l2OutputBackend {
    device: Arc<Device>,
    handle: OutputQueueHandle,
    mappings: Vec<Vec<PlaneMapping>>,
}

impl V4l2OutputBackend {
    pub fn new(device: Arc<Device>) -> std::result::Result<Self, BackendError> {
        let queue = Queue::get_output_mplane_queue(device.clone())?;
        log::debug!("OUTPUT queue: state: None -> Init");

        Ok(Self {
            device,
            handle: OutputQueueHandle::Init(queue),
            mappings: Vec::new(),
        })
    }

    fn allocated(
        &self,
    ) -> std::result::Result<&Queue<Output, BuffersAllocated<Vec<MmapHandle>>>, BackendError> {
        match &self.handle {
            OutputQueueHandle::Allocated(queue) => Ok(queue),
            _ => Err(BackendError::NotAllocated),
        }
    }
}

impl OutputBackend for V4l2OutputBackend {
    fn configure(
        &mut self,
        format: Fourcc,
        max_buffer_bytes: u32,
        num_buffers: usize,
    ) -> Result<OutputLayout> {
        let mut queue = match std::mem::take(&mut self.handle) {
            OutputQueueHandle::Init(queue) => queue,
            handle => {
                self.handle = handle;
                return Err(DecoderError::AlreadyConfigured);
            }
        };

        let format = queue
            .set_format(Format {
                width: 0,
                height: 0,
                pixelformat: format.into(),
                plane_fmt: vec![V4l2PlaneLayout {
                    sizeimage: max_buffer_bytes,
                    bytesperline: 0,
                }],
            })
            .map_err(BackendError::from)?;
        log::debug!("OUTPUT queue format = {:?}", format);

        let queue = queue
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, num_buffers as u32)
            .map_err(BackendError::from)?;
        let num_buffers = queue.num_buffers();

        self.mappings = map_buffers(&self.device, QueueType::VideoOutputMplane, num_buffers)?;
        self.handle = OutputQueueHandle::Allocated(queue);
        log::debug!("OUTPUT queue: state: Init -> Allocated, {} buffers", num_buffers);

        let buffer_size = self
            .mappings
            .iter()
            .filter_map(|planes| planes.first().map(|plane| plane.len()))
            .min()
            .unwrap_or(0)
            .min(max_buffer_bytes as usize);

        Ok(OutputLayout {
            num_buffers,
            buffer_size,
        })
    }

    fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let mapping = self
            .mappings
            .get_mut(index)
            .and_then(|planes| planes.first_mut())
            .ok_or(DecoderError::InvalidIndex(index))?;

        Ok(mapping.as_mut())
    }

    fn queue(&mut self, index: usize, bytes_used: usize, last: bool) -> Result<()> {
        let bytes_used = if bytes_used == 0 && last {
            let padding = self.buffer_mut(index)?;
            let len = END_OF_STREAM_PADDING.min(padding.len());
            padding[..len].fill(0);
            len
        } else {
            bytes_used
        };

        let queue = self.allocated()?;
        queue
            .try_get_buffer(index)
            .map_err(|err| BackendError::QueueBuffer(index, anyhow!("{err}")))?
            .queue(&[bytes_used])
            .map_err(|err| BackendError::QueueBuffer(index, anyhow!("{err}")))?;

        Ok(())
    }

    fn dequeue(&mut self) -> Result<usize> {
        let buffer = self.allocated()?.try_dequeue()?;

        Ok(buffer.data.index() as usize)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.allocated()?.stream_on().map_err(BackendError::from)?;
        log::debug!("OUTPUT queue: stream on");

        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.allocated()?
            .stream_off()
            .map_err(|err| BackendError::StreamOff(anyhow!("{err}")))?;
        log::debug!("OUTPUT queue: stream off");

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut command = v4l2_decoder_cmd {
            cmd: V4L2_DEC_CMD_STOP,
            ..Default::default()
        };

        // SAFETY: `command` is a valid, initialized `v4l2_decoder_cmd` that outlives the call.
        unsafe { vidioc_decoder_cmd(self.device.as_raw_fd(), &mut command) }
            .map_err(BackendError::from)?;
        log::debug!("OUTPUT queue: sent stop command");

        Ok(())
    }

    fn release(&mut self) {
        self.mappings.clear();

        self.handle = match std::mem::take(&mut self.handle) {
            OutputQueueHandle::Allocated(queue) => match queue.free_buffers() {
                Ok(freed) => OutputQueueHandle::Init(freed.queue),
                Err(err) => {
                    log::warn!("OUTPUT queue: failed to free buffers: {:?}", err);
                    OutputQueueHandle::Unknown
                }
            },
            handle => handle,
        };
        log::debug!("OUTPUT queue: buffers released");
    }
}

#[derive(Default)]
enum CaptureQueueHandle {
    Init(Queue<Capture, QueueInit>),
    Allocated(Queue<Capture, BuffersAllocated<Vec<MmapHandle>>>),
    #[default]
    Unknown,
}

/// Decoded frames queue of a V4L2 stateful decoder.
pub struct V4l2CaptureBackend {
    device: Arc<Device>,
    handle: CaptureQueueHandle,
    mappings: Vec<Vec<PlaneMapping>>,
}

impl V4l2CaptureBackend {
    pub fn new(device: Arc<Device>) -> std::result::Result<Self, BackendError> {
        let queue = Queue::get_capture_mplane_queue(device.clone())?;
        log::debug!("CAPTURE queue: state: None -> Init");

        Ok(Self {
            device,
            handle: CaptureQueueHandle::Init(queue),
            mappings: Vec::new(),
        })
    }

    fn allocated(
        &self,
    ) -> std::result::Result<&Queue<Capture, BuffersAllocated<Vec<MmapHandle>>>, BackendError> {
        match &self.handle {
            CaptureQueueHandle::Allocated(queue) => Ok(queue),
            _ => Err(BackendError::NotAllocated),
        }
    }

    /// Reads the CAPTURE format, retrying until the decoder has parsed enough of the stream to
    /// report a picture size.
    fn wait_for_format(queue: &Queue<Capture, QueueInit>) -> Result<Format> {
        for attempt in 0..FORMAT_RETRIES {
            let format: std::result::Result<Format, _> = queue.get_format();
            match format {
                Ok(format) if format.width > 0 && format.height > 0 => return Ok(format),
                Ok(_) => log::trace!("CAPTURE queue: no picture size yet (attempt {attempt})"),
                Err(err) => log::trace!("CAPTURE queue: G_FMT failed: {:?}", err),
            }

            thread::sleep(FORMAT_RETRY_INTERVAL);
        }

        log::error!("CAPTURE queue: the decoder never reported a format");
        Err(BackendError::NoCaptureFormat.into())
    }

    /// The visible part of the decoded picture, or the whole coded size if the driver does not
    /// report a compose rectangle.
    fn visible_size(&self, coded_size: Resolution) -> Resolution {
        let rect: std::result::Result<v4l2r::Rect, _> = ioctl::g_selection(
            &*self.device,
            ioctl::SelectionType::Capture,
            ioctl::SelectionTarget::Compose,
        );

        match rect {
            Ok(rect) => Resolution {
                width: rect.width,
                height: rect.height,
            }
            .intersect(coded_size),
            Err(err) => {
                log::debug!(
                    "CAPTURE queue: no compose rectangle ({:?}), using {}",
                    err,
                    coded_size
                );
                coded_size
            }
        }
    }
}

impl CaptureBackend for V4l2CaptureBackend {
    fn configure(&mut self, num_buffers: usize) -> Result<CaptureFormat> {
        let format = match &self.handle {
            CaptureQueueHandle::Init(queue) => Self::wait_for_format(queue)?,
            _ => return Err(DecoderError::AlreadyConfigured),
        };
        log::debug!("CAPTURE queue format = {:?}", format);

        let fourcc = Fourcc::from(format.pixelformat);
        let decoded_format =
            DecodedFormat::try_from(fourcc).map_err(|_| DecoderError::UnsupportedFormat(fourcc))?;

        let coded_size = Resolution {
            width: format.width,
            height: format.height,
        };
        let visible_size = self.visible_size(coded_size);

        let queue = match std::mem::take(&mut self.handle) {
            CaptureQueueHandle::Init(queue) => queue,
            handle => {
                self.handle = handle;
                return Err(DecoderError::AlreadyConfigured);
            }
        };
        let queue = queue
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, num_buffers as u32)
            .map_err(BackendError::from)?;
        let num_buffers = queue.num_buffers();

        self.mappings = map_buffers(&self.device, QueueType::VideoCaptureMplane, num_buffers)?;
        self.handle = CaptureQueueHandle::Allocated(queue);
        log::debug!("CAPTURE queue: state: Init -> Allocated, {} buffers", num_buffers);

        Ok(CaptureFormat {
            format: decoded_format,
            coded_size,
            visible_size,
            planes: format
                .plane_fmt
                .iter()
                .map(|plane| PlaneLayout {
                    stride: plane.bytesperline as usize,
                    size: plane.sizeimage as usize,
                })
                .collect(),
            num_buffers,
        })
    }

    fn queue(&mut self, index: usize) -> Result<()> {
        let queue = self.allocated()?;
        queue
            .try_get_buffer(index)
            .map_err(|err| BackendError::QueueBuffer(index, anyhow!("{err}")))?
            .queue()
            .map_err(|err| BackendError::QueueBuffer(index, anyhow!("{err}")))?;

        Ok(())
    }

    fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        let buffer = self.allocated()?.try_dequeue()?;

        Ok(DequeuedBuffer {
            index: buffer.data.index() as usize,
            sequence: buffer.data.sequence(),
            last: buffer.data.is_last(),
            planes: buffer
                .data
                .as_v4l2_planes()
                .iter()
                .map(|plane| PlaneData {
                    bytes_used: plane.bytesused as usize,
                    data_offset: plane.data_offset as usize,
                })
                .collect(),
        })
    }

    fn plane(&self, index: usize, plane: usize) -> Result<&[u8]> {
        self.mappings
            .get(index)
            .and_then(|planes| planes.get(plane))
            .map(|mapping| &mapping[..])
            .ok_or(DecoderError::InvalidIndex(index))
    }

    fn stream_on(&mut self) -> Result<()> {
        self.allocated()?.stream_on().map_err(BackendError::from)?;
        log::debug!("CAPTURE queue: stream on");

        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.allocated()?
            .stream_off()
            .map_err(|err| BackendError::StreamOff(anyhow!("{err}")))?;
        log::debug!("CAPTURE queue: stream off");

        Ok(())
    }

    fn release(&mut self) {
        self.mappings.clear();

        self.handle = match std::mem::take(&mut self.handle) {
            CaptureQueueHandle::Allocated(queue) => match queue.free_buffers() {
                Ok(freed) => CaptureQueueHandle::Init(freed.queue),
                Err(err) => {
                    log::warn!("CAPTURE queue: failed to free buffers: {:?}", err);
                    CaptureQueueHandle::Unknown
                }
            },
            handle => handle,
        };
        log::debug!("CAPTURE queue: buffers released");
    }
}
