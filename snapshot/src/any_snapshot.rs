// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// A type erased snapshot value. Or, alternatively, you can think of it as a partially
/// (de)serialized value that can be nested in other values without incurring double encoding in
/// the final output.
///
/// Only use it where a dyn compatible trait has to carry device state, e.g. `Suspendable`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AnySnapshot(serde_json::Value);

impl AnySnapshot {
    pub fn to_any(x: impl serde::Serialize) -> anyhow::Result<Self> {
        Ok(AnySnapshot(serde_json::to_value(x)?))
    }

    pub fn from_any<T: serde::de::DeserializeOwned>(x: Self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(x.0)?)
    }
}
