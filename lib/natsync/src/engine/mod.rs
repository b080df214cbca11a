// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NAT cache engine.
pub mod cache;
pub mod config;
pub mod conntrack;
pub mod device;
pub mod dispatch;
pub mod entry;
pub mod policy;
#[cfg(any(feature = "sim", test))]
pub mod sim;
pub mod table;
pub mod temp;
pub mod ts_sync;
