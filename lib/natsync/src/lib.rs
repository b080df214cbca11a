// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NAT offload cache.
//!
//! This crate keeps a hardware NAT table in sync with the kernel's
//! connection tracker. New translated connections are pushed into the
//! table as rules, idle timers read back from hardware are fed to the
//! tracker so offloaded flows are not aged out, and the whole cache
//! survives the table being torn down and recreated across WAN
//! flaps.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as natsync;

pub use natsync_api as api;

pub mod ddi;
pub mod engine;
#[cfg(feature = "std")]
pub mod print;
pub mod provider;
