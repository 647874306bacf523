// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Goldfish virtual platform devices.
//!
//! `pipe` is the MMIO pipe device multiplexing guest-to-host channels onto host services; `qemud`
//! is the older multiplexer framing channels over an emulated serial line, also reachable through
//! the pipe device.

pub mod pipe;
pub mod qemud;
