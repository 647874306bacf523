// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side utilities shared by every goldfish crate.
//!
//! Logging goes through the `log` facade re-exported here so that device code writes
//! `base::warn!` and never depends on the backend chosen by [`syslog::init`].

pub mod syslog;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
