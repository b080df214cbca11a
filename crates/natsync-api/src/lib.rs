// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared between the NAT cache engine and its consumers.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cmd;
pub mod ip;

pub use cmd::*;
pub use ip::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment. Dumps
/// produced by one version are only guaranteed to be read back by the
/// same version.
pub const API_VERSION: u64 = 3;
