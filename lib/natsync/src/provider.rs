// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Providers plug the engine into the outside world.
//!
//! The cache never talks to the NAT driver, the modem filter service
//! or the connection tracker directly. Instead each of them is a
//! trait object handed to the cache at construction. Production wires
//! up the real implementations, the replay tool and the test suites
//! wire up the simulated ones in [`crate::engine::sim`]. If a service
//! doesn't have at least two obvious implementations, it probably
//! doesn't need to be a provider.

use crate::engine::conntrack::ConntrackUpdater;
use crate::engine::conntrack::TimeoutSource;
use crate::engine::device::MirrorControl;
use crate::engine::device::NatTableDevice;
use slog::Logger;
use std::sync::Arc;

/// The set of all external collaborators required by the cache.
#[derive(Clone)]
pub struct Providers {
    pub device: Arc<dyn NatTableDevice>,
    pub mirror: Arc<dyn MirrorControl>,
    pub ct_updater: Arc<dyn ConntrackUpdater>,
    pub ct_timeouts: Arc<dyn TimeoutSource>,
    pub log: Logger,
}
