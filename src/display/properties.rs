// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Property lookup and atomic request building.
//!
//! KMS properties are addressed by numeric ids that differ from one device to another. They are
//! resolved by name once per object when the display is discovered, and every atomic request
//! afterwards only uses the cached ids.

use std::collections::HashMap;

use crate::display::KmsBackend;
use crate::display::KmsError;
use crate::display::ObjectType;
use crate::display::Result;

/// A property of a KMS object, with the value it had when it was read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub value: u64,
}

/// Name to id table for the properties of one KMS object.
#[derive(Clone, Debug)]
pub struct ObjectProperties {
    object: u32,
    kind: ObjectType,
    by_name: HashMap<String, Property>,
}

impl ObjectProperties {
    /// Reads all properties of `object` from the device.
    pub fn fetch<B: KmsBackend>(backend: &B, object: u32, kind: ObjectType) -> Result<Self> {
        let properties = backend.properties(object, kind)?;
        log::trace!("{:?} {} has {} properties", kind, object, properties.len());

        Ok(Self::from_properties(object, kind, properties))
    }

    pub fn from_properties(object: u32, kind: ObjectType, properties: Vec<Property>) -> Self {
        Self {
            object,
            kind,
            by_name: properties
                .into_iter()
                .map(|prop| (prop.name.clone(), prop))
                .collect(),
        }
    }

    pub fn object(&self) -> u32 {
        self.object
    }

    pub fn kind(&self) -> ObjectType {
        self.kind
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.by_name.get(name)
    }

    /// The value `name` had when the properties were fetched.
    pub fn value(&self, name: &str) -> Option<u64> {
        self.get(name).map(|prop| prop.value)
    }

    fn id(&self, name: &str) -> Result<u32> {
        self.get(name)
            .map(|prop| prop.id)
            .ok_or_else(|| KmsError::MissingProperty {
                object: self.object,
                name: name.to_string(),
            })
    }
}

/// One property assignment of an atomic request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PropertyChange {
    pub object: u32,
    pub kind: ObjectType,
    pub property: u32,
    pub value: u64,
}

/// A set of property changes applied together by one atomic commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    changes: Vec<PropertyChange>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets property `name` of `object` to `value`, replacing any value set earlier in this
    /// request. Fails if the object has no such property.
    pub fn set(&mut self, object: &ObjectProperties, name: &str, value: u64) -> Result<&mut Self> {
        let property = object.id(name)?;

        match self
            .changes
            .iter_mut()
            .find(|change| change.object == object.object && change.property == property)
        {
            Some(change) => change.value = value,
            None => self.changes.push(PropertyChange {
                object: object.object,
                kind: object.kind,
                property,
                value,
            }),
        }

        Ok(self)
    }

    pub fn changes(&self) -> &[PropertyChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
