// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small services used to exercise guest pipe drivers.

mod pingpong;
mod zero;

use std::sync::Arc;

pub use self::pingpong::PingPongService;
pub use self::pingpong::PINGPONG_MAX_SIZE;
pub use self::zero::ZeroService;
use super::PipeServiceRegistry;
use super::RegistryError;

/// Registers `zero` and `pingpong`.
pub fn register_debug_services(registry: &mut PipeServiceRegistry) -> Result<(), RegistryError> {
    registry.register("zero", Arc::new(ZeroService))?;
    registry.register("pingpong", Arc::new(PingPongService))?;
    Ok(())
}
