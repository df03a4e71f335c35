// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display device discovery and mode setting.
//!
//! [`Display`] owns the KMS device for the lifetime of the player. It picks a connector, its
//! encoder and CRTC, and two planes on that CRTC: the *video plane*, which scans out decoded
//! NV12 frames, and the *OSD plane*, which accepts ARGB8888. All changes to the display go
//! through atomic commits built from property ids cached at discovery time.

pub mod properties;

use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use enumn::N;
use thiserror::Error;

use crate::framebuffer::Framebuffer;
use crate::Fourcc;
use crate::Resolution;
use crate::FOURCC_ARGB8888;
use crate::FOURCC_NV12;

pub use properties::AtomicRequest;
pub use properties::ObjectProperties;
pub use properties::Property;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("{what} failed: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("no connected connector with at least one mode")]
    NoConnector,
    #[error("no encoder for connector {0}")]
    NoEncoder(u32),
    #[error("no CRTC for encoder {0}")]
    NoCrtc(u32),
    #[error("no plane supporting {0} on CRTC {1}")]
    NoPlane(Fourcc, u32),
    #[error("object {object} has no property {name}")]
    MissingProperty { object: u32, name: String },
    #[error("no {0} mode on the connector")]
    NoMode(ModeRequest),
    #[error("refusing to commit an empty mode")]
    EmptyMode,
    #[error("unsupported framebuffer format {0}")]
    UnsupportedFormat(Fourcc),
    #[error("invalid KMS object {0}")]
    InvalidObject(u32),
    #[error("a page flip is already pending")]
    FlipPending,
    #[error("failed to fetch a decoded frame: {0}")]
    Frame(#[source] crate::decoder::DecoderError),
}

impl KmsError {
    /// Wraps an I/O error with the name of the operation that failed.
    pub fn io(what: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| KmsError::Io { what, source }
    }
}

pub type Result<T> = std::result::Result<T, KmsError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Connector,
    Crtc,
    Plane,
}

/// Values of the "type" plane property.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum PlaneType {
    Overlay = 0,
    Primary = 1,
    Cursor = 2,
}

/// How a plane is used by the player.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlaneRole {
    /// Positioned full-screen at mode set.
    Primary,
    /// Stacked over the primary role plane.
    Overlay,
}

/// A display timing the backend can program into a CRTC.
pub trait DisplayMode: Clone + Debug {
    fn size(&self) -> Resolution;
    fn vrefresh(&self) -> u32;
    fn is_interlaced(&self) -> bool;
}

/// The mode the player wants, e.g. `1920x1080@50`. Only progressive modes match.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModeRequest {
    pub size: Resolution,
    pub refresh: u32,
}

impl ModeRequest {
    pub fn matches<M: DisplayMode>(&self, mode: &M) -> bool {
        mode.size() == self.size && mode.vrefresh() == self.refresh && !mode.is_interlaced()
    }
}

impl Default for ModeRequest {
    fn default() -> Self {
        Self {
            size: Resolution::from((1920, 1080)),
            refresh: 50,
        }
    }
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.size, self.refresh)
    }
}

impl FromStr for ModeRequest {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        const ERR: &str = "unrecognized mode. Expected WIDTHxHEIGHT@REFRESH, e.g. 1920x1080@50";

        let (size, refresh) = s.split_once('@').ok_or(ERR)?;
        Ok(Self {
            size: size.parse().map_err(|_| ERR)?,
            refresh: refresh.trim().parse().map_err(|_| ERR)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ConnectorInfo<M> {
    pub id: u32,
    pub connected: bool,
    pub modes: Vec<M>,
    /// Encoder currently driving the connector.
    pub encoder: Option<u32>,
    /// All encoders that can drive the connector.
    pub encoders: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct EncoderInfo {
    pub id: u32,
    /// CRTC currently bound to the encoder.
    pub crtc: Option<u32>,
    pub possible_crtcs: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct PlaneInfo {
    pub id: u32,
    pub formats: Vec<Fourcc>,
    pub possible_crtcs: Vec<u32>,
}

/// Flags of an atomic commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitMode {
    /// Blocking commit that may perform a full mode set.
    Modeset,
    /// Non-blocking commit that sends a page flip event once it has taken effect.
    PageFlip,
}

/// A dumb buffer as returned by the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Everything needed to register a buffer as a framebuffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FramebufferLayout {
    pub size: Resolution,
    pub format: Fourcc,
    pub num_planes: usize,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayEvent {
    PageFlip {
        crtc: u32,
        sequence: u32,
        time: Duration,
    },
}

/// Access to a KMS device.
pub trait KmsBackend {
    type Mode: DisplayMode;
    /// Saved CRTC configuration, see [`KmsBackend::save_crtc`].
    type CrtcState: Debug;
    /// Backend handle of a dumb buffer.
    type Dumb;

    /// Enables universal planes and atomic mode setting for this client.
    fn enable_atomic(&self) -> Result<()>;
    fn connectors(&self) -> Result<Vec<ConnectorInfo<Self::Mode>>>;
    fn encoder(&self, id: u32) -> Result<EncoderInfo>;
    fn planes(&self) -> Result<Vec<PlaneInfo>>;
    fn properties(&self, object: u32, kind: ObjectType) -> Result<Vec<Property>>;
    /// Uploads `mode` as a property blob and returns the blob id.
    fn create_mode_blob(&self, mode: &Self::Mode) -> Result<u64>;
    fn destroy_blob(&self, blob: u64) -> Result<()>;
    fn commit(&self, request: &AtomicRequest, mode: CommitMode) -> Result<()>;
    /// Captures the current configuration of `crtc`.
    fn save_crtc(&self, crtc: u32) -> Result<Self::CrtcState>;
    /// Programs a configuration captured by [`KmsBackend::save_crtc`] back, driving `connector`.
    fn restore_crtc(&self, state: &Self::CrtcState, connector: u32) -> Result<()>;
    /// Allocates a dumb buffer for `format` pixels of `bpp` bits, returning it along with the
    /// size and pitch the kernel chose.
    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        bpp: u32,
    ) -> Result<(Self::Dumb, DumbBuffer)>;
    /// Maps `buffer` for CPU access while `f` runs.
    fn with_dumb_mapping<R, F>(&self, buffer: &mut Self::Dumb, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R;
    fn destroy_dumb(&self, buffer: Self::Dumb) -> Result<()>;
    /// Registers a framebuffer and returns its id.
    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<u32>;
    fn remove_framebuffer(&self, fb: u32) -> Result<()>;
    /// Waits up to `timeout` for events and returns all that are pending.
    fn wait_events(&self, timeout: Duration) -> Result<Vec<DisplayEvent>>;
}

impl<B: KmsBackend + ?Sized> KmsBackend for &B {
    type Mode = B::Mode;
    type CrtcState = B::CrtcState;
    type Dumb = B::Dumb;

    fn enable_atomic(&self) -> Result<()> {
        (**self).enable_atomic()
    }

    fn connectors(&self) -> Result<Vec<ConnectorInfo<Self::Mode>>> {
        (**self).connectors()
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo> {
        (**self).encoder(id)
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>> {
        (**self).planes()
    }

    fn properties(&self, object: u32, kind: ObjectType) -> Result<Vec<Property>> {
        (**self).properties(object, kind)
    }

    fn create_mode_blob(&self, mode: &Self::Mode) -> Result<u64> {
        (**self).create_mode_blob(mode)
    }

    fn destroy_blob(&self, blob: u64) -> Result<()> {
        (**self).destroy_blob(blob)
    }

    fn commit(&self, request: &AtomicRequest, mode: CommitMode) -> Result<()> {
        (**self).commit(request, mode)
    }

    fn save_crtc(&self, crtc: u32) -> Result<Self::CrtcState> {
        (**self).save_crtc(crtc)
    }

    fn restore_crtc(&self, state: &Self::CrtcState, connector: u32) -> Result<()> {
        (**self).restore_crtc(state, connector)
    }

    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        bpp: u32,
    ) -> Result<(Self::Dumb, DumbBuffer)> {
        (**self).create_dumb(width, height, format, bpp)
    }

    fn with_dumb_mapping<R, F>(&self, buffer: &mut Self::Dumb, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        (**self).with_dumb_mapping(buffer, f)
    }

    fn destroy_dumb(&self, buffer: Self::Dumb) -> Result<()> {
        (**self).destroy_dumb(buffer)
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<u32> {
        (**self).add_framebuffer(layout)
    }

    fn remove_framebuffer(&self, fb: u32) -> Result<()> {
        (**self).remove_framebuffer(fb)
    }

    fn wait_events(&self, timeout: Duration) -> Result<Vec<DisplayEvent>> {
        (**self).wait_events(timeout)
    }
}

/// One of the two planes driven by the player.
#[derive(Clone, Debug)]
pub struct PlaneDescriptor {
    pub id: u32,
    pub formats: Vec<Fourcc>,
    pub kind: PlaneType,
    /// Z-position currently programmed, if the plane exposes one.
    pub zpos: Option<u64>,
    /// Z-position found at discovery.
    pub resting_zpos: Option<u64>,
    pub role: PlaneRole,
    pub properties: ObjectProperties,
}

impl PlaneDescriptor {
    pub fn supports(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }
}

struct PlaneCandidate {
    info: PlaneInfo,
    kind: PlaneType,
    properties: ObjectProperties,
}

/// Picks the video and OSD planes among `candidates`, returning their positions.
///
/// Planes are considered in ascending id order. The video plane is the first plane supporting
/// NV12 for which another plane supporting ARGB8888 exists, and that other plane becomes the OSD
/// plane.
fn classify_planes(candidates: &[PlaneCandidate], crtc: u32) -> Result<(usize, usize)> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|i| candidates[*i].info.id);

    let supports = |i: usize, format: Fourcc| candidates[i].info.formats.contains(&format);

    let mut found_video = false;
    for &video in &order {
        if !supports(video, FOURCC_NV12) {
            continue;
        }
        found_video = true;

        if let Some(&osd) = order
            .iter()
            .find(|&&osd| osd != video && supports(osd, FOURCC_ARGB8888))
        {
            return Ok((video, osd));
        }
    }

    Err(if found_video {
        KmsError::NoPlane(FOURCC_ARGB8888, crtc)
    } else {
        KmsError::NoPlane(FOURCC_NV12, crtc)
    })
}

/// The display pipeline: one connector, its CRTC and the video and OSD planes.
pub struct Display<B: KmsBackend> {
    backend: B,
    connector: ObjectProperties,
    encoder: u32,
    crtc: ObjectProperties,
    modes: Vec<B::Mode>,
    video: PlaneDescriptor,
    osd: PlaneDescriptor,
    /// The video plane is not the hardware primary plane, so the OSD plane takes the primary
    /// role and z-positions have to be exchanged to put video on top.
    swap_zpos: bool,
    saved_crtc: Option<B::CrtcState>,
    mode_blob: Option<u64>,
    mode: Option<B::Mode>,
}

impl<B: KmsBackend> Display<B> {
    /// Finds the connector, encoder, CRTC and planes to use, and saves the current CRTC
    /// configuration for [`Display::restore`].
    pub fn discover(backend: B) -> Result<Self> {
        backend.enable_atomic()?;

        let connector = backend
            .connectors()?
            .into_iter()
            .find(|c| c.connected && !c.modes.is_empty())
            .ok_or(KmsError::NoConnector)?;

        let encoder_id = connector
            .encoder
            .or_else(|| connector.encoders.first().copied())
            .ok_or(KmsError::NoEncoder(connector.id))?;
        let encoder = backend.encoder(encoder_id)?;

        let crtc = encoder
            .crtc
            .or_else(|| encoder.possible_crtcs.first().copied())
            .ok_or(KmsError::NoCrtc(encoder.id))?;

        log::debug!(
            "Display: connector={} encoder={} crtc={} modes={}",
            connector.id,
            encoder.id,
            crtc,
            connector.modes.len()
        );

        let mut candidates = Vec::new();
        for info in backend.planes()? {
            if !info.possible_crtcs.contains(&crtc) {
                continue;
            }

            let properties = ObjectProperties::fetch(&backend, info.id, ObjectType::Plane)?;
            let kind = match properties.value("type").and_then(PlaneType::n) {
                Some(kind) => kind,
                None => {
                    log::warn!("Plane {} has no usable type, assuming overlay", info.id);
                    PlaneType::Overlay
                }
            };
            if kind == PlaneType::Cursor {
                continue;
            }

            log::debug!(
                "Plane {}: type={:?} formats={:?} zpos={:?}",
                info.id,
                kind,
                info.formats,
                properties.value("zpos")
            );
            candidates.push(PlaneCandidate {
                info,
                kind,
                properties,
            });
        }

        let (video, osd) = classify_planes(&candidates, crtc)?;
        let swap_zpos = candidates[video].kind != PlaneType::Primary;

        let mut descriptors = candidates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i == video || *i == osd)
            .map(|(i, candidate)| {
                let zpos = candidate.properties.value("zpos");
                let role = if (i == video) != swap_zpos {
                    PlaneRole::Primary
                } else {
                    PlaneRole::Overlay
                };
                (
                    i,
                    PlaneDescriptor {
                        id: candidate.info.id,
                        formats: candidate.info.formats,
                        kind: candidate.kind,
                        zpos,
                        resting_zpos: zpos,
                        role,
                        properties: candidate.properties,
                    },
                )
            })
            .collect::<Vec<_>>();
        // Both indices are in `descriptors`, in ascending candidate order.
        let (first, second) = (descriptors.remove(0), descriptors.remove(0));
        let (video, osd) = if first.0 == video {
            (first.1, second.1)
        } else {
            (second.1, first.1)
        };

        log::info!(
            "Display: video plane {} ({:?}), OSD plane {} ({:?}), zpos swap: {}",
            video.id,
            video.kind,
            osd.id,
            osd.kind,
            swap_zpos
        );

        let connector_properties =
            ObjectProperties::fetch(&backend, connector.id, ObjectType::Connector)?;
        let crtc_properties = ObjectProperties::fetch(&backend, crtc, ObjectType::Crtc)?;
        let saved_crtc = backend.save_crtc(crtc)?;

        Ok(Self {
            backend,
            connector: connector_properties,
            encoder: encoder.id,
            crtc: crtc_properties,
            modes: connector.modes,
            video,
            osd,
            swap_zpos,
            saved_crtc: Some(saved_crtc),
            mode_blob: None,
            mode: None,
        })
    }

    /// Returns the first connector mode matching `request`.
    pub fn select_mode(&self, request: &ModeRequest) -> Option<B::Mode> {
        self.modes.iter().find(|mode| request.matches(*mode)).cloned()
    }

    /// The connector's preferred mode, which the kernel lists first.
    pub fn preferred_mode(&self) -> Option<B::Mode> {
        self.modes.first().cloned()
    }

    pub fn modes(&self) -> &[B::Mode] {
        &self.modes
    }

    /// Programs `mode` on the CRTC and shows `blank` on the video plane, in one atomic commit.
    ///
    /// `mode` is the result of [`Display::select_mode`]. If no mode was found, or the mode has
    /// no size, nothing is committed.
    pub fn set_mode<D>(&mut self, mode: Option<B::Mode>, blank: &Framebuffer<D>) -> Result<()> {
        let mode = mode.ok_or(KmsError::EmptyMode)?;
        let size = mode.size();
        if size.get_area() == 0 {
            return Err(KmsError::EmptyMode);
        }

        let blob = self.backend.create_mode_blob(&mode)?;
        let crtc = self.crtc.object() as u64;

        let mut request = AtomicRequest::new();
        request
            .set(&self.crtc, "MODE_ID", blob)?
            .set(&self.crtc, "ACTIVE", 1)?
            .set(&self.connector, "CRTC_ID", crtc)?;

        let primary = self.primary_role_plane();
        Self::set_full_screen(&mut request, &primary.properties, size)?;

        let video = &self.video.properties;
        Self::set_full_screen(&mut request, video, size)?;
        Self::set_source(&mut request, video, blank.size())?;
        request
            .set(video, "CRTC_ID", crtc)?
            .set(video, "FB_ID", blank.id() as u64)?;

        if let Err(err) = self.backend.commit(&request, CommitMode::Modeset) {
            log::error!("Display: mode set to {:?} failed: {}", mode, err);
            if let Err(err) = self.backend.destroy_blob(blob) {
                log::warn!("Display: failed to destroy mode blob {}: {}", blob, err);
            }
            return Err(err);
        }

        log::info!(
            "Display: mode {}@{} set on CRTC {}",
            size,
            mode.vrefresh(),
            crtc
        );

        if let Some(old) = self.mode_blob.replace(blob) {
            if let Err(err) = self.backend.destroy_blob(old) {
                log::warn!("Display: failed to destroy mode blob {}: {}", old, err);
            }
        }
        self.mode = Some(mode);

        Ok(())
    }

    /// Points the video plane at framebuffer `fb`. If `source` is given, the source rectangle
    /// and full-screen destination are programmed too.
    ///
    /// With [`CommitMode::PageFlip`] the commit does not block and a [`DisplayEvent::PageFlip`]
    /// is delivered once the new framebuffer is on screen.
    pub fn show(&self, fb: u32, source: Option<Resolution>, mode: CommitMode) -> Result<()> {
        let video = &self.video.properties;
        let mut request = AtomicRequest::new();

        if let Some(source) = source {
            let screen = self.mode_size()?;
            Self::set_full_screen(&mut request, video, screen)?;
            Self::set_source(&mut request, video, source)?;
            request.set(video, "CRTC_ID", self.crtc.object() as u64)?;
        }
        request.set(video, "FB_ID", fb as u64)?;

        self.backend.commit(&request, mode)
    }

    /// Exchanges the z-positions of the video and OSD planes, or puts the original ones back.
    pub fn swap_plane_order(&mut self, swapped: bool) -> Result<()> {
        let (Some(video_zpos), Some(osd_zpos)) = (self.video.resting_zpos, self.osd.resting_zpos)
        else {
            log::debug!("Display: planes have no zpos, nothing to swap");
            return Ok(());
        };

        let (video_zpos, osd_zpos) = if swapped {
            (osd_zpos, video_zpos)
        } else {
            (video_zpos, osd_zpos)
        };

        let mut request = AtomicRequest::new();
        request
            .set(&self.video.properties, "zpos", video_zpos)?
            .set(&self.osd.properties, "zpos", osd_zpos)?;
        self.backend.commit(&request, CommitMode::Modeset)?;

        self.video.zpos = Some(video_zpos);
        self.osd.zpos = Some(osd_zpos);
        log::debug!(
            "Display: zpos video={} osd={}",
            video_zpos,
            osd_zpos
        );

        Ok(())
    }

    /// Puts the display back in the state found by [`Display::discover`].
    ///
    /// Every step is attempted even if an earlier one fails. The first error is returned.
    pub fn restore(&mut self) -> Result<()> {
        let mut result = Ok(());
        let saved = self.saved_crtc.take();
        let first_restore = saved.is_some();

        if let Some(saved) = saved {
            if let Err(err) = self.backend.restore_crtc(&saved, self.connector.object()) {
                log::error!("Display: failed to restore CRTC: {}", err);
                result = Err(err);
            }
        }

        // Put the resting plane order back whenever the driver needed the swap.
        if self.swap_zpos && first_restore {
            if let Err(err) = self.swap_plane_order(false) {
                log::error!("Display: failed to restore plane order: {}", err);
                result = result.and(Err(err));
            }
        }

        if let Some(blob) = self.mode_blob.take() {
            if let Err(err) = self.backend.destroy_blob(blob) {
                log::warn!("Display: failed to destroy mode blob {}: {}", blob, err);
            }
        }
        self.mode = None;

        result
    }

    /// Waits up to `timeout` for page flips of our CRTC to complete.
    pub fn wait_flips(&self, timeout: Duration) -> Result<Vec<DisplayEvent>> {
        let crtc = self.crtc.object();

        Ok(self
            .backend
            .wait_events(timeout)?
            .into_iter()
            .filter(|DisplayEvent::PageFlip { crtc: c, .. }| *c == crtc)
            .collect())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn video_plane(&self) -> &PlaneDescriptor {
        &self.video
    }

    pub fn osd_plane(&self) -> &PlaneDescriptor {
        &self.osd
    }

    pub fn connector_id(&self) -> u32 {
        self.connector.object()
    }

    pub fn encoder_id(&self) -> u32 {
        self.encoder
    }

    pub fn crtc_id(&self) -> u32 {
        self.crtc.object()
    }

    pub fn swaps_zpos(&self) -> bool {
        self.swap_zpos
    }

    /// The mode programmed by [`Display::set_mode`].
    pub fn mode(&self) -> Option<&B::Mode> {
        self.mode.as_ref()
    }

    fn mode_size(&self) -> Result<Resolution> {
        self.mode
            .as_ref()
            .map(|mode| mode.size())
            .ok_or(KmsError::EmptyMode)
    }

    fn primary_role_plane(&self) -> &PlaneDescriptor {
        if self.video.role == PlaneRole::Primary {
            &self.video
        } else {
            &self.osd
        }
    }

    fn set_full_screen(
        request: &mut AtomicRequest,
        plane: &ObjectProperties,
        screen: Resolution,
    ) -> Result<()> {
        request
            .set(plane, "CRTC_X", 0)?
            .set(plane, "CRTC_Y", 0)?
            .set(plane, "CRTC_W", screen.width as u64)?
            .set(plane, "CRTC_H", screen.height as u64)?;
        Ok(())
    }

    fn set_source(
        request: &mut AtomicRequest,
        plane: &ObjectProperties,
        source: Resolution,
    ) -> Result<()> {
        // Source coordinates are 16.16 fixed point.
        request
            .set(plane, "SRC_X", 0)?
            .set(plane, "SRC_Y", 0)?
            .set(plane, "SRC_W", (source.width as u64) << 16)?
            .set(plane, "SRC_H", (source.height as u64) << 16)?;
        Ok(())
    }
}
