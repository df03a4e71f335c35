// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A KMS device living in memory. It records every request it receives so tests can look at
//! what would have reached the hardware.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

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
use crate::display::PlaneType;
use crate::display::Property;
use crate::display::Result;
use crate::Fourcc;
use crate::Resolution;
use crate::FOURCC_ARGB8888;
use crate::FOURCC_NV12;

pub const CONNECTOR: u32 = 10;
pub const ENCODER: u32 = 20;
pub const CRTC: u32 = 30;

const CONNECTOR_PROPERTIES: &[&str] = &["CRTC_ID"];
const CRTC_PROPERTIES: &[&str] = &["MODE_ID", "ACTIVE"];
const PLANE_PROPERTIES: &[&str] = &[
    "type", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W",
    "CRTC_H",
];

/// Property ids are the same for every object, derived from the property name.
fn property_id(name: &str) -> u32 {
    CONNECTOR_PROPERTIES
        .iter()
        .chain(CRTC_PROPERTIES)
        .chain(PLANE_PROPERTIES)
        .chain(&["zpos"])
        .position(|p| *p == name)
        .map_or(0, |pos| 100 + pos as u32)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DummyMode {
    pub size: Resolution,
    pub refresh: u32,
    pub interlaced: bool,
}

impl DummyMode {
    pub fn new(width: u32, height: u32, refresh: u32, interlaced: bool) -> Self {
        Self {
            size: Resolution::from((width, height)),
            refresh,
            interlaced,
        }
    }
}

impl DisplayMode for DummyMode {
    fn size(&self) -> Resolution {
        self.size
    }

    fn vrefresh(&self) -> u32 {
        self.refresh
    }

    fn is_interlaced(&self) -> bool {
        self.interlaced
    }
}

#[derive(Clone, Debug)]
pub struct DummyPlane {
    pub id: u32,
    pub formats: Vec<Fourcc>,
    pub kind: Option<PlaneType>,
    pub zpos: Option<u64>,
    pub possible_crtcs: Vec<u32>,
}

impl DummyPlane {
    /// A plane of `kind` usable on [`CRTC`], stacked according to its type.
    pub fn new(id: u32, formats: &[Fourcc], kind: PlaneType) -> Self {
        Self {
            id,
            formats: formats.to_vec(),
            kind: Some(kind),
            zpos: Some(match kind {
                PlaneType::Primary => 0,
                PlaneType::Overlay => 1,
                PlaneType::Cursor => 2,
            }),
            possible_crtcs: vec![CRTC],
        }
    }
}

#[derive(Debug)]
pub struct DummyCrtcState {
    pub crtc: u32,
}

/// A single connector, encoder and CRTC, with a configurable set of planes.
pub struct DummyKms {
    pub connector_connected: bool,
    pub modes: Vec<DummyMode>,
    pub planes: Vec<DummyPlane>,
    /// Report no current encoder so the first possible one has to be used.
    pub detached_encoder: bool,

    next_id: Cell<u32>,
    commits: RefCell<Vec<(AtomicRequest, CommitMode)>>,
    events: RefCell<VecDeque<DisplayEvent>>,
    flip_pending: Cell<bool>,
    sequence: Cell<u32>,
    blobs: RefCell<HashSet<u64>>,
    /// Contents of every live dumb buffer.
    dumb_buffers: RefCell<HashMap<u32, Vec<u8>>>,
    framebuffers: RefCell<HashMap<u32, FramebufferLayout>>,
    mapped: Cell<usize>,
    calls: RefCell<Vec<String>>,
    restored_crtcs: Cell<usize>,

    fail_commits: Cell<usize>,
    lose_flip_events_from: Cell<Option<u32>>,
    pub fail_add_framebuffer: Cell<bool>,
    pub fail_map: Cell<bool>,
}

impl DummyKms {
    /// A 1080p50 capable connector with an ARGB primary plane and an NV12 overlay plane.
    pub fn new() -> Self {
        Self::with_planes(vec![
            DummyPlane::new(40, &[FOURCC_ARGB8888], PlaneType::Primary),
            DummyPlane::new(41, &[FOURCC_NV12], PlaneType::Overlay),
        ])
    }

    pub fn with_planes(planes: Vec<DummyPlane>) -> Self {
        Self {
            connector_connected: true,
            modes: vec![
                DummyMode::new(1920, 1080, 60, false),
                DummyMode::new(1920, 1080, 50, false),
                DummyMode::new(1920, 1080, 25, true),
                DummyMode::new(1280, 720, 50, false),
            ],
            planes,
            detached_encoder: false,
            next_id: Cell::new(1000),
            commits: Default::default(),
            events: Default::default(),
            flip_pending: Cell::new(false),
            sequence: Cell::new(0),
            blobs: Default::default(),
            dumb_buffers: Default::default(),
            framebuffers: Default::default(),
            mapped: Default::default(),
            calls: Default::default(),
            restored_crtcs: Cell::new(0),
            fail_commits: Cell::new(0),
            lose_flip_events_from: Cell::new(None),
            fail_add_framebuffer: Cell::new(false),
            fail_map: Cell::new(false),
        }
    }

    fn allocate_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn log(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commits(1);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.set(count);
    }

    /// Page flips from the `flips`-th one on complete without ever sending an event.
    pub fn lose_flip_events_from(&self, flips: u32) {
        self.lose_flip_events_from.set(Some(flips));
    }

    pub fn commits(&self) -> Vec<(AtomicRequest, CommitMode)> {
        self.commits.borrow().clone()
    }

    pub fn page_flip_commits(&self) -> usize {
        self.commits
            .borrow()
            .iter()
            .filter(|(_, mode)| *mode == CommitMode::PageFlip)
            .count()
    }

    /// The value of property `name` of `object` in the most recent commit that set it.
    pub fn committed_value(&self, object: u32, name: &str) -> Option<u64> {
        let property = property_id(name);

        self.commits.borrow().iter().rev().find_map(|(request, _)| {
            request
                .changes()
                .iter()
                .find(|change| change.object == object && change.property == property)
                .map(|change| change.value)
        })
    }

    /// Every call that changed the device, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn push_event(&self, event: DisplayEvent) {
        self.events.borrow_mut().push_back(event);
    }

    pub fn live_blobs(&self) -> usize {
        self.blobs.borrow().len()
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.dumb_buffers.borrow().len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mapped.get()
    }

    /// What was last written to a dumb buffer.
    pub fn dumb_contents(&self, handle: u32) -> Option<Vec<u8>> {
        self.dumb_buffers.borrow().get(&handle).cloned()
    }

    pub fn framebuffer(&self, fb: u32) -> Option<FramebufferLayout> {
        self.framebuffers.borrow().get(&fb).copied()
    }

    pub fn restored_crtcs(&self) -> usize {
        self.restored_crtcs.get()
    }

    fn plane_properties(plane: &DummyPlane) -> Vec<Property> {
        let mut properties: Vec<Property> = PLANE_PROPERTIES
            .iter()
            .filter(|name| **name != "type" || plane.kind.is_some())
            .map(|name| Property {
                id: property_id(name),
                name: name.to_string(),
                value: match *name {
                    "type" => plane.kind.map_or(0, |kind| kind as u64),
                    _ => 0,
                },
            })
            .collect();

        if let Some(zpos) = plane.zpos {
            properties.push(Property {
                id: property_id("zpos"),
                name: "zpos".into(),
                value: zpos,
            });
        }

        properties
    }
}

impl Default for DummyKms {
    fn default() -> Self {
        Self::new()
    }
}

fn named(names: &[&str]) -> Vec<Property> {
    names
        .iter()
        .map(|name| Property {
            id: property_id(name),
            name: name.to_string(),
            value: 0,
        })
        .collect()
}

impl KmsBackend for DummyKms {
    type Mode = DummyMode;
    type CrtcState = DummyCrtcState;
    type Dumb = DumbBuffer;

    fn enable_atomic(&self) -> Result<()> {
        Ok(())
    }

    fn connectors(&self) -> Result<Vec<ConnectorInfo<DummyMode>>> {
        Ok(vec![ConnectorInfo {
            id: CONNECTOR,
            connected: self.connector_connected,
            modes: if self.connector_connected {
                self.modes.clone()
            } else {
                Vec::new()
            },
            encoder: (!self.detached_encoder).then_some(ENCODER),
            encoders: vec![ENCODER],
        }])
    }

    fn encoder(&self, id: u32) -> Result<EncoderInfo> {
        if id != ENCODER {
            return Err(KmsError::InvalidObject(id));
        }

        Ok(EncoderInfo {
            id,
            crtc: (!self.detached_encoder).then_some(CRTC),
            possible_crtcs: vec![CRTC],
        })
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>> {
        Ok(self
            .planes
            .iter()
            .map(|plane| PlaneInfo {
                id: plane.id,
                formats: plane.formats.clone(),
                possible_crtcs: plane.possible_crtcs.clone(),
            })
            .collect())
    }

    fn properties(&self, object: u32, kind: ObjectType) -> Result<Vec<Property>> {
        match kind {
            ObjectType::Connector if object == CONNECTOR => Ok(named(CONNECTOR_PROPERTIES)),
            ObjectType::Crtc if object == CRTC => Ok(named(CRTC_PROPERTIES)),
            ObjectType::Plane => self
                .planes
                .iter()
                .find(|plane| plane.id == object)
                .map(Self::plane_properties)
                .ok_or(KmsError::InvalidObject(object)),
            _ => Err(KmsError::InvalidObject(object)),
        }
    }

    fn create_mode_blob(&self, _mode: &DummyMode) -> Result<u64> {
        let blob = self.allocate_id() as u64;
        self.blobs.borrow_mut().insert(blob);
        Ok(blob)
    }

    fn destroy_blob(&self, blob: u64) -> Result<()> {
        if !self.blobs.borrow_mut().remove(&blob) {
            return Err(KmsError::InvalidObject(blob as u32));
        }
        Ok(())
    }

    fn commit(&self, request: &AtomicRequest, mode: CommitMode) -> Result<()> {
        let failures = self.fail_commits.get();
        if failures > 0 {
            self.fail_commits.set(failures - 1);
            return Err(KmsError::Io {
                what: "atomic commit",
                source: std::io::Error::from_raw_os_error(22),
            });
        }

        if mode == CommitMode::PageFlip {
            if self.flip_pending.get() {
                return Err(KmsError::FlipPending);
            }
            self.flip_pending.set(true);

            let sequence = self.sequence.get();
            self.sequence.set(sequence + 1);
            if self
                .lose_flip_events_from
                .get()
                .map_or(true, |from| sequence < from)
            {
                self.events.borrow_mut().push_back(DisplayEvent::PageFlip {
                    crtc: CRTC,
                    sequence,
                    time: Duration::from_millis(20 * sequence as u64),
                });
            }
        }

        self.log(format!("commit {:?}", mode));
        self.commits.borrow_mut().push((request.clone(), mode));
        Ok(())
    }

    fn save_crtc(&self, crtc: u32) -> Result<DummyCrtcState> {
        Ok(DummyCrtcState { crtc })
    }

    fn restore_crtc(&self, state: &DummyCrtcState, _connector: u32) -> Result<()> {
        self.log(format!("restore_crtc {}", state.crtc));
        self.restored_crtcs.set(self.restored_crtcs.get() + 1);
        Ok(())
    }

    fn create_dumb(
        &self,
        width: u32,
        height: u32,
        _format: Fourcc,
        bpp: u32,
    ) -> Result<(DumbBuffer, DumbBuffer)> {
        let pitch = (width * bpp).div_ceil(8);
        let buffer = DumbBuffer {
            handle: self.allocate_id(),
            pitch,
            size: pitch as u64 * height as u64,
        };

        self.log(format!("create_dumb {}", buffer.handle));
        self.dumb_buffers
            .borrow_mut()
            .insert(buffer.handle, vec![0; buffer.size as usize]);
        Ok((buffer, buffer))
    }

    fn with_dumb_mapping<R, F>(&self, buffer: &mut DumbBuffer, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        if self.fail_map.get() {
            return Err(KmsError::Io {
                what: "mmap",
                source: std::io::Error::from_raw_os_error(12),
            });
        }

        let mut buffers = self.dumb_buffers.borrow_mut();
        let data = buffers
            .get_mut(&buffer.handle)
            .ok_or(KmsError::InvalidObject(buffer.handle))?;

        self.mapped.set(self.mapped.get() + 1);
        self.log(format!("map {}", buffer.handle));
        let result = f(data.as_mut_slice());
        self.mapped.set(self.mapped.get() - 1);
        self.log(format!("unmap {}", buffer.handle));

        Ok(result)
    }

    fn destroy_dumb(&self, buffer: DumbBuffer) -> Result<()> {
        self.dumb_buffers
            .borrow_mut()
            .remove(&buffer.handle)
            .ok_or(KmsError::InvalidObject(buffer.handle))?;
        self.log(format!("destroy_dumb {}", buffer.handle));
        Ok(())
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<u32> {
        if self.fail_add_framebuffer.get() {
            return Err(KmsError::Io {
                what: "add framebuffer",
                source: std::io::Error::from_raw_os_error(22),
            });
        }
        let handles = &layout.handles[..layout.num_planes];
        if let Some(handle) = handles
            .iter()
            .find(|handle| !self.dumb_buffers.borrow().contains_key(handle))
        {
            return Err(KmsError::InvalidObject(*handle));
        }

        let fb = self.allocate_id();
        self.log(format!("add_framebuffer {}", fb));
        self.framebuffers.borrow_mut().insert(fb, *layout);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> Result<()> {
        self.framebuffers
            .borrow_mut()
            .remove(&fb)
            .ok_or(KmsError::InvalidObject(fb))?;
        self.log(format!("remove_framebuffer {}", fb));
        Ok(())
    }

    fn wait_events(&self, _timeout: Duration) -> Result<Vec<DisplayEvent>> {
        let events: Vec<_> = self.events.borrow_mut().drain(..).collect();
        if events
            .iter()
            .any(|DisplayEvent::PageFlip { crtc, .. }| *crtc == CRTC)
        {
            self.flip_pending.set(false);
        }
        Ok(events)
    }
}
