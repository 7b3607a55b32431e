// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container driver - images, volumes and containers on the local runtime.

mod docker;
pub mod mock;
mod traits;

pub use docker::DockerDriver;
pub use mock::MockDriver;
pub use traits::*;
