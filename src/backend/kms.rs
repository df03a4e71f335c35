// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DRM/KMS backend
//!
//! Mode setting, page flips and dumb buffers all go through the `drm` crate.

use std::num::NonZeroU32;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::time::Duration;

use drm::buffer::Buffer;
use drm::buffer::DrmFourcc;
use drm::buffer::DrmModifier;
use drm::buffer::PlanarBuffer;
use drm::control::atomic::AtomicModeReq;
use drm::control::connector;
use drm::control::crtc;
use drm::control::dumbbuffer;
use drm::control::encoder;
use drm::control::plane;
use drm::control::property;
use drm::control::AtomicCommitFlags;
use drm::control::Device as ControlDevice;
use drm::control::Event;
use drm::control::FbCmd2Flags;
use drm::control::Mode;
use drm::control::ModeFlags;
use drm::control::RawResourceHandle;
use drm::ClientCapability;
use drm::Device as DrmDevice;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;

use crate::display::AtomicRequest;
use crate::display::CommitMode;
use crate::display::ConnectorInfo;
use crate::display::DisplayEvent;
use crate::display::DisplayMode;
use crate::display::DumbBuffer;
use crate::display::EncoderInfo;
use crate::display::FramebufferLayout;
use crate::display::KmsBackend;
use crate::display::KmsError;
use crate::display::ObjectType;
use crate::display::PlaneInfo;
use crate::display::Property;
use crate::display::Result;
use crate::Fourcc;
use crate::Resolution;

impl DisplayMode for Mode {
    fn size(&self) -> Resolution {
        let (width, height) = Mode::size(self);
        Resolution::from((width as u32, height as u32))
    }

    fn vrefresh(&self) -> u32 {
        Mode::vrefresh(self)
    }

    fn is_interlaced(&self) -> bool {
        self.flags().contains(ModeFlags::INTERLACE)
    }
}

fn drm_fourcc(format: Fourcc) -> Result<DrmFourcc> {
    DrmFourcc::try_from(format.as_u32()).map_err(|_| KmsError::UnsupportedFormat(format))
}

/// Converts a raw object id into a typed `drm` handle.
fn handle<H: From<RawResourceHandle>>(id: u32) -> Result<H> {
    NonZeroU32::new(id)
        .map(H::from)
        .ok_or(KmsError::InvalidObject(id))
}

/// A simple wrapper for a DRM device node.
pub struct Card(std::fs::File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DrmDevice for Card {}

impl ControlDevice for Card {}

/// Simple helper methods for opening a `Card`.
impl Card {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(Card)
    }
}

/// Buffer description handed to `add_planar_framebuffer`.
struct PlanarLayout<'a>(&'a FramebufferLayout, DrmFourcc);

impl PlanarBuffer for PlanarLayout<'_> {
    fn size(&self) -> (u32, u32) {
        self.0.size.into()
    }

    fn format(&self) -> DrmFourcc {
        self.1
    }

    fn modifier(&self) -> Option<DrmModifier> {
        Some(DrmModifier::from(self.0.modifier))
    }

    fn pitches(&self) -> [u32; 4] {
        self.0.pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        let mut handles = [None; 4];
        for (dst, src) in handles
            .iter_mut()
            .zip(&self.0.handles)
            .take(self.0.num_planes)
        {
            *dst = NonZeroU32::new(*src).map(drm::buffer::Handle::from);
        }
        handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.0.offsets
    }
}

/// [`KmsBackend`] on top of a DRM device node.
pub struct DrmBackend {
    card: Card,
}

impl DrmBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let card = Card::open(path).map_err(KmsError::io("opening the DRM device"))?;

        if let Ok(driver) = card.get_driver() {
            log::info!("Using DRM driver {:?} ({:?})", driver.name(), driver.description());
        }

        Ok(Self { card })
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    fn property_name(&self, id: property::Handle) -> Result<String> {
        let info = self
            .card
            .get_property(id)
            .map_err(KmsError::io("reading a property"))?;

        Ok(info.name().to_string_lossy().into_owned())
    }
}

impl KmsBackend for DrmBackend {
    type Mode = Mode;
    type CrtcState = crtc::Info;
    type Dumb = dumbbuffer::DumbBuffer;

    fn enable_atomic(&self) -> Result<()> {
        self.card
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(KmsError::io("enabling universal planes"))?;
        self.card
            .set_client_capability(ClientCapability::Atomic, true)
            .map_err(KmsError::io("enabling atomic mode setting"))
    }

    fn connectors(&self) -> Result<Vec<ConnectorInfo<Mode>>> {
        let resources = self
            .card
            .resource_handles()
            .map_err(KmsError::io("reading resources"))?;

        resources
            .connectors()
            .iter()
            .map(|id| {
                let info = self
                    .card
                    .get_connector(*id, true)
                    .map_err(KmsError::io("reading a connector"))?;

                Ok(ConnectorInfo {
                    id: u32::from(*id),
                    connected: info.state() == connector::State::Connected,
                    modes: info.modes().to_vec(),
                    encoder: info.current_encoder().map(u32::from),
                    encoders: info.encoders().iter().map(|e| u32::from(*e)).collect(),
                })
            })
            .collect()
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo> {
        let info = self
            .card
            .get_encoder(handle::<encoder::Handle>(id)?)
            .map_err(KmsError::io("reading an encoder"))?;
        let resources = self
            .card
            .resource_handles()
            .map_err(KmsError::io("reading resources"))?;

        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(u32::from),
            possible_crtcs: resources
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(u32::from)
                .collect(),
        })
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>> {
        let resources = self
            .card
            .resource_handles()
            .map_err(KmsError::io("reading resources"))?;
        let planes = self
            .card
            .plane_handles()
            .map_err(KmsError::io("reading planes"))?;

        planes
            .into_iter()
            .map(|id| {
                let info = self
                    .card
                    .get_plane(id)
                    .map_err(KmsError::io("reading a plane"))?;

                Ok(PlaneInfo {
                    id: u32::from(id),
                    formats: info.formats().iter().map(|f| Fourcc::from(*f)).collect(),
                    possible_crtcs: resources
                        .filter_crtcs(info.possible_crtcs())
                        .into_iter()
                        .map(u32::from)
                        .collect(),
                })
            })
            .collect()
    }

    fn properties(&self, object: u32, kind: ObjectType) -> Result<Vec<Property>> {
        let values = match kind {
            ObjectType::Connector => self
                .card
                .get_properties(handle::<connector::Handle>(object)?),
            ObjectType::Crtc => self.card.get_properties(handle::<crtc::Handle>(object)?),
            ObjectType::Plane => self.card.get_properties(handle::<plane::Handle>(object)?),
        }
        .map_err(KmsError::io("reading object properties"))?;

        let (ids, raw_values) = values.as_props_and_values();
        ids.iter()
            .zip(raw_values)
            .map(|(id, value)| {
                Ok(Property {
                    id: u32::from(*id),
                    name: self.property_name(*id)?,
                    value: *value,
                })
            })
            .collect()
    }

    fn create_mode_blob(&self, mode: &Mode) -> Result<u64> {
        match self
            .card
            .create_property_blob(mode)
            .map_err(KmsError::io("creating the mode blob"))?
        {
            property::Value::Blob(id) => Ok(id),
            other => Err(KmsError::Io {
                what: "creating the mode blob",
                source: std::io::Error::other(format!("unexpected blob value {:?}", other)),
            }),
        }
    }

    fn destroy_blob(&self, blob: u64) -> Result<()> {
        self.card
            .destroy_property_blob(blob)
            .map_err(KmsError::io("destroying a property blob"))
    }

    fn commit(&self, request: &AtomicRequest, mode: CommitMode) -> Result<()> {
        let mut req = AtomicModeReq::new();

        for change in request.changes() {
            let property = handle::<property::Handle>(change.property)?;
            let value = property::Value::Unknown(change.value);

            match change.kind {
                ObjectType::Connector => {
                    req.add_property(handle::<connector::Handle>(change.object)?, property, value)
                }
                ObjectType::Crtc => {
                    req.add_property(handle::<crtc::Handle>(change.object)?, property, value)
                }
                ObjectType::Plane => {
                    req.add_property(handle::<plane::Handle>(change.object)?, property, value)
                }
            }
        }

        let flags = match mode {
            CommitMode::Modeset => AtomicCommitFlags::ALLOW_MODESET,
            CommitMode::PageFlip => {
                AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT
            }
        };

        self.card
            .atomic_commit(flags, req)
            .map_err(|source| {
                // The kernel refuses a new flip while the previous one has not completed.
                if source.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) {
                    KmsError::FlipPending
                } else {
                    KmsError::Io {
                        what: "atomic commit",
                        source,
                    }
                }
            })
    }

    fn save_crtc(&self, crtc: u32) -> Result<crtc::Info> {
        self.card
            .get_crtc(handle::<crtc::Handle>(crtc)?)
            .map_err(KmsError::io("reading the CRTC"))
    }

    fn restore_crtc(&self, state: &crtc::Info, connector: u32) -> Result<()> {
        let connector = handle::<connector::Handle>(connector)?;

        self.card
            .set_crtc(
                state.handle(),
                state.framebuffer(),
                state.position(),
                &[connector],
                state.mode(),
            )
            .map_err(KmsError::io("restoring the CRTC"))
    }

    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        bpp: u32,
    ) -> Result<(dumbbuffer::DumbBuffer, DumbBuffer)> {
        let drm_format = drm_fourcc(format)?;
        let buffer = self
            .card
            .create_dumb_buffer((width, height), drm_format, bpp)
            .map_err(KmsError::io("creating a dumb buffer"))?;

        let info = DumbBuffer {
            handle: u32::from(buffer.handle()),
            pitch: buffer.pitch(),
            size: u64::from(buffer.pitch()) * u64::from(buffer.size().1),
        };
        log::trace!(
            "created dumb buffer {} ({}x{}, {} bpp, pitch {})",
            info.handle,
            width,
            height,
            bpp,
            info.pitch
        );

        Ok((buffer, info))
    }

    fn with_dumb_mapping<R, F>(&self, buffer: &mut dumbbuffer::DumbBuffer, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut mapping = self
            .card
            .map_dumb_buffer(buffer)
            .map_err(KmsError::io("mapping a dumb buffer"))?;

        Ok(f(&mut mapping[..]))
    }

    fn destroy_dumb(&self, buffer: dumbbuffer::DumbBuffer) -> Result<()> {
        self.card
            .destroy_dumb_buffer(buffer)
            .map_err(KmsError::io("destroying a dumb buffer"))
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<u32> {
        let format = drm_fourcc(layout.format)?;

        self.card
            .add_planar_framebuffer(&PlanarLayout(layout, format), FbCmd2Flags::MODIFIERS)
            .map(u32::from)
            .map_err(KmsError::io("adding a framebuffer"))
    }

    fn remove_framebuffer(&self, fb: u32) -> Result<()> {
        self.card
            .destroy_framebuffer(handle(fb)?)
            .map_err(KmsError::io("removing a framebuffer"))
    }

    fn wait_events(&self, timeout: Duration) -> Result<Vec<DisplayEvent>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.card.as_fd(), PollFlags::POLLIN)];

        let ready = nix::poll::poll(&mut fds, PollTimeout::from(millis))
            .map_err(|err| KmsError::io("waiting for display events")(err.into()))?;
        if ready == 0 {
            return Ok(Vec::new());
        }

        let events = self
            .card
            .receive_events()
            .map_err(KmsError::io("reading display events"))?;

        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(DisplayEvent::PageFlip {
                    crtc: u32::from(flip.crtc),
                    sequence: flip.frame,
                    time: flip.duration,
                }),
                _ => None,
            })
            .collect())
    }
}
