// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device state serialization.
//!
//! Two representations are provided. [`AnySnapshot`] is a type erased serde value used where a
//! snapshot has to cross a dyn compatible trait. [`SnapshotWriter`] and [`SnapshotReader`] build
//! and parse the versioned big-endian byte streams device models save their state in.

mod any_snapshot;
mod stream;

pub use any_snapshot::AnySnapshot;
pub use stream::Error;
pub use stream::Result;
pub use stream::SnapshotReader;
pub use stream::SnapshotWriter;
