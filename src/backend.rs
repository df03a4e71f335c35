// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel backends.
//!
//! A backend implements one of the device traits ([`crate::decoder::OutputBackend`],
//! [`crate::decoder::CaptureBackend`] or [`crate::display::KmsBackend`]) on top of an actual
//! kernel interface. Everything above this module only deals with the traits.

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "kms")]
pub mod kms;
#[cfg(feature = "v4l2")]
pub mod v4l2;
