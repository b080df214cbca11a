// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Offload policy: which connections may never be offloaded, and
//! which endpoints are currently asleep.

use crate::api::Ipv4Addr;
use crate::api::NatConn;
use crate::api::Protocol;
use heapless::Vec as FVec;
use serde::Deserialize;
use serde::Serialize;

/// The maximum number of endpoints tracked in power-save at once.
pub const MAX_PWR_SAVE_CLIENTS: usize = 32;

/// A port reserved for an application-level gateway.
///
/// Connections touching such a port need their payload rewritten by
/// the kernel and must therefore never bypass it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AlgPort {
    #[serde(alias = "protocol")]
    pub proto: Protocol,
    pub port: u16,
}

/// The immutable ALG port list, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct AlgPorts {
    ports: Vec<AlgPort>,
}

impl AlgPorts {
    pub fn new(ports: Vec<AlgPort>) -> Self {
        Self { ports }
    }

    /// Is `port` reserved for an ALG under `proto`?
    pub fn is_alg_port(&self, proto: Protocol, port: u16) -> bool {
        self.ports.iter().any(|p| p.proto == proto && p.port == port)
    }

    /// Is the connection excluded from offload because either of its
    /// ports belongs to an ALG?
    pub fn excludes(&self, conn: &NatConn) -> bool {
        self.is_alg_port(conn.proto, conn.private_port)
            || self.is_alg_port(conn.proto, conn.target_port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlgPort> {
        self.ports.iter()
    }
}

/// The endpoints currently in power-save.
///
/// Entries whose private endpoint is in this set must not hold a
/// hardware rule: traffic for a sleeping endpoint has to go through
/// the kernel so that it can buffer and wake it.
#[derive(Debug, Default)]
pub struct PowerSaveSet {
    ips: FVec<Ipv4Addr, MAX_PWR_SAVE_CLIENTS>,
}

/// The power-save set has no room for another endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerSaveFull(pub Ipv4Addr);

impl PowerSaveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains(&ip)
    }

    /// Add `ip` to the set, returning `false` if it was already
    /// present.
    pub fn insert(&mut self, ip: Ipv4Addr) -> Result<bool, PowerSaveFull> {
        if self.contains(ip) {
            return Ok(false);
        }

        self.ips.push(ip).map_err(PowerSaveFull)?;
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ipv4Addr> {
        self.ips.iter()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    /// Remove `ip` from the set, returning `false` if it wasn't
    /// present.
    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        match self.ips.iter().position(|i| *i == ip) {
            Some(idx) => {
                self.ips.swap_remove(idx);
                true
            }

            None => false,
        }
    }
}
