// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The hardware NAT table and companion modem interfaces.

use crate::api::DriverError;
use crate::api::DriverOp;
use crate::api::Ipv4Addr;
use crate::api::MemPlacement;
use crate::api::MirrorRuleId;
use crate::api::NatConn;
use crate::api::RuleHdl;
use crate::api::TableHdl;
use slog::Logger;
use slog::warn;
use std::sync::Arc;

pub type DriverResult<T> = Result<T, DriverError>;

/// The hardware NAT table driver.
///
/// Every call is synchronous and may fail. Implementations use
/// interior mutability: the cache serializes all calls under its own
/// lock, so there is never more than one caller at a time.
pub trait NatTableDevice: Send + Sync {
    /// Create a table of `capacity` rules translating to `public_ip`
    /// on WAN mux `mux_id`.
    fn create_table(
        &self,
        public_ip: Ipv4Addr,
        capacity: u32,
        placement: MemPlacement,
        mux_id: u8,
    ) -> DriverResult<TableHdl>;

    fn destroy_table(&self, hdl: TableHdl) -> DriverResult<()>;

    /// Set the PDN metadata word used to steer translated traffic to
    /// the right WAN mux.
    fn modify_pdn_metadata(&self, hdl: TableHdl, metadata: u32)
    -> DriverResult<()>;

    fn add_rule(&self, hdl: TableHdl, conn: &NatConn) -> DriverResult<RuleHdl>;

    fn delete_rule(&self, hdl: TableHdl, rule: RuleHdl) -> DriverResult<()>;

    /// Read the rule's idle timer. The value changes whenever the
    /// rule has seen traffic since the last query.
    fn query_idle_timer(
        &self,
        hdl: TableHdl,
        rule: RuleHdl,
    ) -> DriverResult<u32>;

    /// Move the table between its primary placement and DDR.
    fn relocate(&self, to_ddr: bool) -> DriverResult<()>;

    /// Vote the table memory clock on (`true`) or off (`false`).
    fn vote_clock(&self, on: bool) -> DriverResult<()>;

    /// Can this hardware place tables in SRAM at all?
    fn sram_supported(&self) -> bool;
}

/// The companion modem's downlink filter service.
pub trait MirrorControl: Send + Sync {
    fn install_mirror_rule(
        &self,
        conn: &NatConn,
        mux_id: u8,
    ) -> DriverResult<MirrorRuleId>;

    fn remove_mirror_rule(&self, id: MirrorRuleId) -> DriverResult<()>;
}

/// A held vote for the table memory clock.
///
/// The vote is released when the guard is dropped, on every exit
/// path of the caller.
pub struct ClockVote {
    device: Arc<dyn NatTableDevice>,
    log: Logger,
}

impl ClockVote {
    pub fn acquire(
        device: &Arc<dyn NatTableDevice>,
        log: &Logger,
    ) -> DriverResult<Self> {
        device.vote_clock(true)?;
        Ok(Self { device: device.clone(), log: log.clone() })
    }
}

impl Drop for ClockVote {
    fn drop(&mut self) {
        if let Err(e) = self.device.vote_clock(false) {
            warn!(self.log, "failed to release clock vote"; "err" => %e);
        }
    }
}

/// A mirror service for hardware without a companion modem. Every
/// request fails, which the cache treats as a logged, non-fatal
/// condition.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMirror;

impl MirrorControl for NoMirror {
    fn install_mirror_rule(
        &self,
        _conn: &NatConn,
        _mux_id: u8,
    ) -> DriverResult<MirrorRuleId> {
        Err(DriverError::new(DriverOp::InstallMirror, libc::ENOTSUP))
    }

    fn remove_mirror_rule(&self, _id: MirrorRuleId) -> DriverResult<()> {
        Err(DriverError::new(DriverOp::RemoveMirror, libc::ENOTSUP))
    }
}
