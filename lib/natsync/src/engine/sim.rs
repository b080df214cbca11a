// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! In-memory collaborators.
//!
//! These stand in for the NAT driver, the modem filter service and the
//! connection tracker. They keep just enough state to answer the
//! cache's questions honestly, record every call made against them,
//! and can be told to fail any operation.

use super::conntrack::ConntrackUpdater;
use super::conntrack::IdleTimeouts;
use super::conntrack::TimeoutSource;
use super::conntrack::TimeoutUpdate;
use super::device::DriverResult;
use super::device::MirrorControl;
use super::device::NatTableDevice;
use crate::api::ConnKey;
use crate::api::CtTuple;
use crate::api::DriverError;
use crate::api::DriverOp;
use crate::api::Ipv4Addr;
use crate::api::MemPlacement;
use crate::api::MirrorRuleId;
use crate::api::NatConn;
use crate::api::RuleHdl;
use crate::api::TableHdl;
use crate::ddi::sync::KMutex;
use crate::provider::Providers;
use core::num::NonZeroU32;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The errno reported by injected faults.
pub const SIM_ERRNO: i32 = libc::EIO;

#[derive(Clone, Copy, Debug)]
enum Fault {
    Times(u32),
    Always,
}

#[derive(Debug, Default)]
struct Faults {
    faults: BTreeMap<DriverOp, Fault>,
    calls: BTreeMap<DriverOp, u32>,
}

impl Faults {
    // Record a call to `op` and decide whether it fails.
    fn check(&mut self, op: DriverOp) -> DriverResult<()> {
        *self.calls.entry(op).or_default() += 1;

        match self.faults.get_mut(&op) {
            None => Ok(()),
            Some(Fault::Always) => Err(DriverError::new(op, SIM_ERRNO)),
            Some(Fault::Times(n)) => {
                *n -= 1;
                if *n == 0 {
                    self.faults.remove(&op);
                }
                Err(DriverError::new(op, SIM_ERRNO))
            }
        }
    }

    fn calls(&self, op: DriverOp) -> u32 {
        self.calls.get(&op).copied().unwrap_or(0)
    }

    fn fail(&mut self, op: DriverOp) {
        self.faults.insert(op, Fault::Always);
    }

    fn fail_times(&mut self, op: DriverOp, times: u32) {
        if times > 0 {
            self.faults.insert(op, Fault::Times(times));
        }
    }

    fn heal(&mut self, op: DriverOp) {
        self.faults.remove(&op);
    }
}

#[derive(Clone, Debug)]
pub struct SimRule {
    pub conn: NatConn,
    pub idle: u32,
}

#[derive(Clone, Debug)]
pub struct SimTable {
    pub public_ip: Ipv4Addr,
    pub capacity: u32,
    pub placement: MemPlacement,
    pub mux_id: u8,
    pub metadata: Option<u32>,
    pub rules: BTreeMap<RuleHdl, SimRule>,
}

#[derive(Debug)]
struct SimDevState {
    next_table: u32,
    next_rule: u32,
    tables: BTreeMap<TableHdl, SimTable>,
    on_ddr: bool,
    votes: i32,
    sram: bool,
    faults: Faults,
    bad_conns: BTreeSet<ConnKey>,
}

/// A NAT table driver backed by plain maps.
#[derive(Debug)]
pub struct SimNatDevice {
    state: KMutex<SimDevState>,
}

impl SimNatDevice {
    pub fn new() -> Self {
        Self {
            state: KMutex::new(SimDevState {
                next_table: 1,
                next_rule: 1,
                tables: BTreeMap::new(),
                on_ddr: false,
                votes: 0,
                sram: true,
                faults: Faults::default(),
                bad_conns: BTreeSet::new(),
            }),
        }
    }

    /// A device which can't place tables in SRAM.
    pub fn without_sram() -> Self {
        let dev = Self::new();
        dev.state.lock().sram = false;
        dev
    }

    /// The number of times `op` was called.
    pub fn calls(&self, op: DriverOp) -> u32 {
        self.state.lock().faults.calls(op)
    }

    /// Make every future call to `op` fail.
    pub fn fail(&self, op: DriverOp) {
        self.state.lock().faults.fail(op);
    }

    /// Make the next `times` calls to `op` fail.
    pub fn fail_times(&self, op: DriverOp, times: u32) {
        self.state.lock().faults.fail_times(op, times);
    }

    /// Make adding a rule for `key` fail.
    pub fn fail_conn(&self, key: ConnKey) {
        self.state.lock().bad_conns.insert(key);
    }

    pub fn heal(&self, op: DriverOp) {
        self.state.lock().faults.heal(op);
    }

    pub fn heal_conn(&self, key: &ConnKey) {
        self.state.lock().bad_conns.remove(key);
    }

    /// Does any table hold a rule for `key`?
    pub fn has_rule(&self, key: &ConnKey) -> bool {
        self.state
            .lock()
            .tables
            .values()
            .any(|t| t.rules.values().any(|r| r.conn.key() == *key))
    }

    /// Is the table currently relocated to DDR?
    pub fn on_ddr(&self) -> bool {
        self.state.lock().on_ddr
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().tables.values().map(|t| t.rules.len()).sum()
    }

    /// Every rule in every table, in handle order.
    pub fn rules(&self) -> Vec<NatConn> {
        self.state
            .lock()
            .tables
            .values()
            .flat_map(|t| t.rules.values().map(|r| r.conn))
            .collect()
    }

    /// Set the idle timer of the rule for `key`, as if the hardware
    /// had seen traffic.
    pub fn set_idle(&self, key: &ConnKey, idle: u32) -> bool {
        let mut state = self.state.lock();
        for table in state.tables.values_mut() {
            for rule in table.rules.values_mut() {
                if rule.conn.key() == *key {
                    rule.idle = idle;
                    return true;
                }
            }
        }
        false
    }

    pub fn table(&self, hdl: TableHdl) -> Option<SimTable> {
        self.state.lock().tables.get(&hdl).cloned()
    }

    pub fn table_count(&self) -> usize {
        self.state.lock().tables.len()
    }

    /// The net number of clock votes currently held.
    pub fn votes(&self) -> i32 {
        self.state.lock().votes
    }
}

impl Default for SimNatDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NatTableDevice for SimNatDevice {
    fn create_table(
        &self,
        public_ip: Ipv4Addr,
        capacity: u32,
        placement: MemPlacement,
        mux_id: u8,
    ) -> DriverResult<TableHdl> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::CreateTable)?;

        let hdl = TableHdl(state.next_table);
        state.next_table += 1;
        state.tables.insert(
            hdl,
            SimTable {
                public_ip,
                capacity,
                placement,
                mux_id,
                metadata: None,
                rules: BTreeMap::new(),
            },
        );
        Ok(hdl)
    }

    fn destroy_table(&self, hdl: TableHdl) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::DestroyTable)?;
        state
            .tables
            .remove(&hdl)
            .map(|_| ())
            .ok_or(DriverError::new(DriverOp::DestroyTable, libc::ENOENT))
    }

    fn modify_pdn_metadata(
        &self,
        hdl: TableHdl,
        metadata: u32,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::ModifyPdn)?;
        let table = state
            .tables
            .get_mut(&hdl)
            .ok_or(DriverError::new(DriverOp::ModifyPdn, libc::ENOENT))?;
        table.metadata = Some(metadata);
        Ok(())
    }

    fn add_rule(&self, hdl: TableHdl, conn: &NatConn) -> DriverResult<RuleHdl> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::AddRule)?;
        if state.bad_conns.contains(&conn.key()) {
            return Err(DriverError::new(DriverOp::AddRule, SIM_ERRNO));
        }

        let rule = RuleHdl(state.next_rule);
        let table = state
            .tables
            .get_mut(&hdl)
            .ok_or(DriverError::new(DriverOp::AddRule, libc::ENOENT))?;
        if table.rules.len() as u32 >= table.capacity {
            return Err(DriverError::new(DriverOp::AddRule, libc::ENOSPC));
        }

        table.rules.insert(rule, SimRule { conn: *conn, idle: 0 });
        state.next_rule += 1;
        Ok(rule)
    }

    fn delete_rule(&self, hdl: TableHdl, rule: RuleHdl) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::DeleteRule)?;
        state
            .tables
            .get_mut(&hdl)
            .and_then(|t| t.rules.remove(&rule))
            .map(|_| ())
            .ok_or(DriverError::new(DriverOp::DeleteRule, libc::ENOENT))
    }

    fn query_idle_timer(
        &self,
        hdl: TableHdl,
        rule: RuleHdl,
    ) -> DriverResult<u32> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::QueryIdleTimer)?;
        state
            .tables
            .get(&hdl)
            .and_then(|t| t.rules.get(&rule))
            .map(|r| r.idle)
            .ok_or(DriverError::new(DriverOp::QueryIdleTimer, libc::ENOENT))
    }

    fn relocate(&self, to_ddr: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::Relocate)?;
        state.on_ddr = to_ddr;
        Ok(())
    }

    fn vote_clock(&self, on: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::VoteClock)?;
        state.votes += if on { 1 } else { -1 };
        Ok(())
    }

    fn sram_supported(&self) -> bool {
        self.state.lock().sram
    }
}

#[derive(Debug, Default)]
struct SimMirrorState {
    next: u32,
    rules: BTreeMap<MirrorRuleId, (NatConn, u8)>,
    faults: Faults,
}

/// A companion modem filter service backed by a map.
#[derive(Debug, Default)]
pub struct SimMirror {
    state: KMutex<SimMirrorState>,
}

impl SimMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, op: DriverOp) -> u32 {
        self.state.lock().faults.calls(op)
    }

    pub fn fail(&self, op: DriverOp) {
        self.state.lock().faults.fail(op);
    }

    pub fn heal(&self, op: DriverOp) {
        self.state.lock().faults.heal(op);
    }

    /// The mirrored connections with the mux they were installed on,
    /// in rule id order.
    pub fn installed(&self) -> Vec<(NatConn, u8)> {
        self.state.lock().rules.values().copied().collect()
    }

    pub fn is_mirrored(&self, key: &ConnKey) -> bool {
        self.state.lock().rules.values().any(|(c, _)| c.key() == *key)
    }
}

impl MirrorControl for SimMirror {
    fn install_mirror_rule(
        &self,
        conn: &NatConn,
        mux_id: u8,
    ) -> DriverResult<MirrorRuleId> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::InstallMirror)?;
        state.next += 1;
        let id = NonZeroU32::new(state.next)
            .map(MirrorRuleId)
            .ok_or(DriverError::new(DriverOp::InstallMirror, libc::EOVERFLOW))?;
        state.rules.insert(id, (*conn, mux_id));
        Ok(id)
    }

    fn remove_mirror_rule(&self, id: MirrorRuleId) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::RemoveMirror)?;
        state
            .rules
            .remove(&id)
            .map(|_| ())
            .ok_or(DriverError::new(DriverOp::RemoveMirror, libc::ENOENT))
    }
}

#[derive(Debug, Default)]
struct SimCtState {
    timeouts: IdleTimeouts,
    updates: Vec<TimeoutUpdate>,
    bad_tuples: Vec<CtTuple>,
    faults: Faults,
}

/// A connection tracker which records timeout updates.
#[derive(Debug, Default)]
pub struct SimConntrack {
    state: KMutex<SimCtState>,
}

impl SimConntrack {
    pub fn new(timeouts: IdleTimeouts) -> Self {
        let ct = Self::default();
        ct.state.lock().timeouts = timeouts;
        ct
    }

    pub fn calls(&self, op: DriverOp) -> u32 {
        self.state.lock().faults.calls(op)
    }

    pub fn fail(&self, op: DriverOp) {
        self.state.lock().faults.fail(op);
    }

    /// Make updates for `tuple` fail, as if the tracker no longer
    /// knew the flow.
    pub fn fail_tuple(&self, tuple: CtTuple) {
        self.state.lock().bad_tuples.push(tuple);
    }

    pub fn heal(&self, op: DriverOp) {
        self.state.lock().faults.heal(op);
    }

    pub fn set_timeouts(&self, timeouts: IdleTimeouts) {
        self.state.lock().timeouts = timeouts;
    }

    /// Every successful update, in order.
    pub fn updates(&self) -> Vec<TimeoutUpdate> {
        self.state.lock().updates.clone()
    }
}

impl ConntrackUpdater for SimConntrack {
    fn update_idle_timeout(
        &self,
        tuple: &CtTuple,
        timeout: u32,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::UpdateTimeout)?;
        if state.bad_tuples.contains(tuple) {
            return Err(DriverError::new(DriverOp::UpdateTimeout, libc::ENOENT));
        }
        state.updates.push(TimeoutUpdate { tuple: *tuple, timeout });
        Ok(())
    }
}

impl TimeoutSource for SimConntrack {
    fn idle_timeouts(&self) -> DriverResult<IdleTimeouts> {
        let mut state = self.state.lock();
        state.faults.check(DriverOp::ReadTimeouts)?;
        Ok(state.timeouts)
    }
}

/// A full set of simulated collaborators, with handles kept around
/// for inspection.
#[derive(Clone)]
pub struct SimStack {
    pub device: Arc<SimNatDevice>,
    pub mirror: Arc<SimMirror>,
    pub ct: Arc<SimConntrack>,
}

impl SimStack {
    pub fn new() -> Self {
        Self {
            device: Arc::new(SimNatDevice::new()),
            mirror: Arc::new(SimMirror::new()),
            ct: Arc::new(SimConntrack::new(IdleTimeouts::FRAMEWORK_DEFAULT)),
        }
    }

    pub fn providers(&self, log: Logger) -> Providers {
        Providers {
            device: self.device.clone(),
            mirror: self.mirror.clone(),
            ct_updater: self.ct.clone(),
            ct_timeouts: self.ct.clone(),
            log,
        }
    }
}

impl Default for SimStack {
    fn default() -> Self {
        Self::new()
    }
}
