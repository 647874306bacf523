// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! Releases are built with panic=abort, so a poisoned lock can only be observed in tests. Code
//! holding one of these locks therefore never has to consider poison, and `.lock().unwrap()` never
//! has to appear next to unwraps of errors that deserve real handling.

mod mutex;

pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
