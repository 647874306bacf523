// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates virtual and hardware devices.

mod bus;
pub mod goldfish;
mod irq_line;
mod suspendable;

pub use self::bus::Bus;
pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::Error as BusError;
pub use self::irq_line::IrqLevelState;
pub use self::irq_line::IrqLine;
pub use self::suspendable::Suspendable;
