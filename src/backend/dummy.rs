// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory backends whose only purpose is to let the queues, the display and the pipeline run
//! so we can test them in isolation.

pub mod decoder;
pub mod display;
