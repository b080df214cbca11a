// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use super::ConnKey;
use super::Ipv4Addr;
use super::NatConn;
use core::fmt;
use core::fmt::Display;
use core::num::NonZeroU32;
use core::str::FromStr;
use libc::c_int;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// The handle of a hardware NAT table, as handed out by the driver.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct TableHdl(pub u32);

/// The handle of a single rule inside a hardware NAT table.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct RuleHdl(pub u32);

/// The id of a downlink filter rule installed on the companion
/// processor path.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct MirrorRuleId(pub NonZeroU32);

impl Display for TableHdl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for RuleHdl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for MirrorRuleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the hardware NAT table memory lives.
///
/// `Sram` and `Hybrid` tables sit behind a clock domain which may be
/// gated; touching them from software requires a clock vote.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(into = "String", try_from = "String")]
pub enum MemPlacement {
    #[default]
    Ddr,
    Sram,
    Hybrid,
}

impl MemPlacement {
    /// Does this placement require a clock vote before the table can
    /// be read from software?
    pub fn needs_clock_vote(&self) -> bool {
        matches!(self, Self::Sram | Self::Hybrid)
    }
}

impl FromStr for MemPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DDR" => Ok(Self::Ddr),
            "SRAM" => Ok(Self::Sram),
            "HYBRID" => Ok(Self::Hybrid),
            _ => Err(format!("invalid memory placement: {s}")),
        }
    }
}

impl TryFrom<String> for MemPlacement {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MemPlacement> for String {
    fn from(p: MemPlacement) -> String {
        p.to_string()
    }
}

impl Display for MemPlacement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Ddr => "DDR",
            Self::Sram => "SRAM",
            Self::Hybrid => "HYBRID",
        };
        write!(f, "{s}")
    }
}

/// The WAN backhaul currently in use.
///
/// When the backhaul is a companion modem reached over PCIe, downlink
/// traffic for translated flows must also be recognized by the modem,
/// which requires a mirror filter rule per qualifying flow.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum BackhaulMode {
    #[default]
    Standard,
    CompanionModem,
}

impl Display for BackhaulMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::CompanionModem => write!(f, "companion-modem"),
        }
    }
}

/// The driver operation which failed.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum DriverOp {
    CreateTable,
    DestroyTable,
    ModifyPdn,
    AddRule,
    DeleteRule,
    QueryIdleTimer,
    Relocate,
    VoteClock,
    InstallMirror,
    RemoveMirror,
    UpdateTimeout,
    ReadTimeouts,
}

/// A failed call into one of the external collaborators.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Error, PartialEq, Serialize,
)]
#[error("{op:?} failed: errno {errno}")]
pub struct DriverError {
    pub op: DriverOp,
    pub errno: c_int,
}

impl DriverError {
    pub fn new(op: DriverOp, errno: c_int) -> Self {
        Self { op, errno }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum NatError {
    #[error("duplicate connection {0}")]
    Duplicate(ConnKey),

    #[error("NAT cache full ({0} entries)")]
    CacheFull(u32),

    /// A required field of the candidate was the zero sentinel.
    #[error("malformed connection")]
    MalformedCandidate,

    #[error("driver failure: {0}")]
    Driver(DriverError),

    /// An idle timer query or timeout update failed for a rule.
    #[error("stale rule handle {0}")]
    StaleHandle(RuleHdl),

    #[error("public IP {requested} does not match active table {active}")]
    TableMismatch { active: Ipv4Addr, requested: Ipv4Addr },

    #[error("no NAT table is bound")]
    NoTable,

    #[error("a NAT table is already bound to {0}")]
    TableExists(Ipv4Addr),

    #[error("failed to mirror connection: {0}")]
    MirrorInstall(DriverError),

    #[error("invalid address {0}")]
    InvalidAddress(Ipv4Addr),
}

impl From<DriverError> for NatError {
    fn from(e: DriverError) -> Self {
        Self::Driver(e)
    }
}

impl NatError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> c_int {
        use libc::*;

        match self {
            Self::Duplicate(_) => EEXIST,
            Self::CacheFull(_) => ENFILE,
            Self::MalformedCandidate => EINVAL,
            Self::Driver(e) => e.errno,
            Self::StaleHandle(_) => ESTALE,
            Self::TableMismatch { .. } => ENOENT,
            Self::NoTable => ENODEV,
            Self::TableExists(_) => EEXIST,
            Self::MirrorInstall(e) => e.errno,
            Self::InvalidAddress(_) => EINVAL,
        }
    }
}

/// A single NAT cache entry as reported by [`DumpCacheResp`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntryDump {
    pub conn: NatConn,
    pub enabled: bool,
    pub rule: Option<RuleHdl>,
    pub mirror: Option<MirrorRuleId>,
    pub timestamp: u32,
}

/// The current binding of the hardware table.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TableDump {
    pub hdl: TableHdl,
    pub public_ip: Ipv4Addr,
    pub mux_id: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpCacheResp {
    pub limit: u32,
    pub table: Option<TableDump>,
    pub prev_public_ip: Option<Ipv4Addr>,
    pub backhaul: BackhaulMode,
    /// Occupied slots, in slot order.
    pub entries: Vec<(u32, CacheEntryDump)>,
    pub staged: Vec<NatConn>,
    pub power_save: Vec<Ipv4Addr>,
    /// Cache counters, by name.
    pub stats: BTreeMap<String, u64>,
}
