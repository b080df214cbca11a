// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The table context: the binding between the hardware table and the
//! active public IP, and the per-entry install/withdraw primitives
//! which go through that binding.

use super::device::MirrorControl;
use super::device::NatTableDevice;
use super::entry::CacheEntry;
use crate::api::BackhaulMode;
use crate::api::DriverError;
use crate::api::Ipv4Addr;
use crate::api::MemPlacement;
use crate::api::MirrorRuleId;
use crate::api::NatConn;
use crate::api::NatError;
use crate::api::Protocol;
use crate::api::TableDump;
use crate::api::TableHdl;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::Arc;

pub const PDN_MUX_SHIFT: u32 = 16;
pub const PDN_MUX_MASK: u32 = 0x00FF_0000;

/// The PDN header metadata word for WAN mux `mux_id`.
pub fn pdn_metadata(mux_id: u8) -> u32 {
    (u32::from(mux_id) << PDN_MUX_SHIFT) & PDN_MUX_MASK
}

/// An active hardware table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Binding {
    pub hdl: TableHdl,
    pub public_ip: Ipv4Addr,
    pub mux_id: u8,
}

impl From<Binding> for TableDump {
    fn from(b: Binding) -> Self {
        TableDump { hdl: b.hdl, public_ip: b.public_ip, mux_id: b.mux_id }
    }
}

/// The result of the mirroring half of an install.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MirrorState {
    /// The connection doesn't qualify for mirroring.
    NotRequired,
    Installed(MirrorRuleId),
    /// The hardware rule is in place but the modem doesn't know about
    /// the flow.
    Failed(DriverError),
}

pub struct TableCtx {
    log: Logger,
    device: Arc<dyn NatTableDevice>,
    mirror: Arc<dyn MirrorControl>,
    capacity: u32,
    placement: MemPlacement,
    binding: Option<Binding>,
    prev_public_ip: Option<Ipv4Addr>,
    backhaul: BackhaulMode,
}

impl TableCtx {
    pub fn new(
        log: &Logger,
        device: Arc<dyn NatTableDevice>,
        mirror: Arc<dyn MirrorControl>,
        capacity: u32,
        placement: MemPlacement,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "table")),
            device,
            mirror,
            capacity,
            placement,
            binding: None,
            prev_public_ip: None,
            backhaul: BackhaulMode::default(),
        }
    }

    pub fn backhaul(&self) -> BackhaulMode {
        self.backhaul
    }

    /// Allocate a table for `public_ip` and bind it.
    ///
    /// A failure to program the PDN metadata is not fatal: the
    /// hardware falls back to its default steering.
    pub fn bind(
        &mut self,
        public_ip: Ipv4Addr,
        mux_id: u8,
    ) -> Result<Binding, NatError> {
        if let Some(b) = self.binding {
            return Err(NatError::TableExists(b.public_ip));
        }

        let hdl = self.device.create_table(
            public_ip,
            self.capacity,
            self.placement,
            mux_id,
        )?;

        let metadata = pdn_metadata(mux_id);
        if let Err(e) = self.device.modify_pdn_metadata(hdl, metadata) {
            warn!(self.log, "failed to program PDN metadata";
                "hdl" => hdl.0, "metadata" => metadata, "err" => %e);
        }

        let binding = Binding { hdl, public_ip, mux_id };
        self.binding = Some(binding);
        info!(self.log, "table created";
            "hdl" => hdl.0, "public_ip" => %public_ip, "mux_id" => mux_id,
            "placement" => %self.placement);
        Ok(binding)
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding
    }

    /// Return the binding for `public_ip`, if it is the active one.
    pub fn check_binding(
        &self,
        public_ip: Ipv4Addr,
    ) -> Result<Binding, NatError> {
        match self.binding {
            None => Err(NatError::NoTable),
            Some(b) if b.public_ip != public_ip => {
                Err(NatError::TableMismatch {
                    active: b.public_ip,
                    requested: public_ip,
                })
            }
            Some(b) => Ok(b),
        }
    }

    pub fn device(&self) -> &Arc<dyn NatTableDevice> {
        &self.device
    }

    /// Install the hardware rule for `entry` and, if it qualifies, its
    /// mirror rule.
    ///
    /// A mirror failure leaves the entry enabled without a mirror id.
    pub fn install(
        &self,
        entry: &mut CacheEntry,
    ) -> Result<MirrorState, NatError> {
        let b = self.binding.ok_or(NatError::NoTable)?;
        let rule = self.device.add_rule(b.hdl, &entry.conn)?;
        entry.enable(rule);

        if !self.wants_mirror(&entry.conn) {
            return Ok(MirrorState::NotRequired);
        }

        match self.mirror.install_mirror_rule(&entry.conn, b.mux_id) {
            Ok(id) => {
                entry.set_mirror(Some(id));
                Ok(MirrorState::Installed(id))
            }

            Err(e) => {
                warn!(self.log, "{}", NatError::MirrorInstall(e);
                    "conn" => %entry.conn);
                Ok(MirrorState::Failed(e))
            }
        }
    }

    pub fn placement(&self) -> MemPlacement {
        self.placement
    }

    pub fn prev_public_ip(&self) -> Option<Ipv4Addr> {
        self.prev_public_ip
    }

    pub fn relocate(&self, to_ddr: bool) -> Result<(), NatError> {
        self.device.relocate(to_ddr)?;
        info!(self.log, "table relocated"; "to_ddr" => to_ddr);
        Ok(())
    }

    pub fn set_backhaul(&mut self, mode: BackhaulMode) {
        if self.backhaul != mode {
            info!(self.log, "backhaul changed";
                "from" => %self.backhaul, "to" => %mode);
        }
        self.backhaul = mode;
    }

    /// Deallocate the active table and remember its public IP.
    ///
    /// On failure the binding is kept so that a later attempt can
    /// retry.
    pub fn unbind(&mut self) -> Result<Ipv4Addr, NatError> {
        let b = self.binding.ok_or(NatError::NoTable)?;
        self.device.destroy_table(b.hdl)?;
        self.binding = None;
        self.prev_public_ip = Some(b.public_ip);
        info!(self.log, "table destroyed";
            "hdl" => b.hdl.0, "public_ip" => %b.public_ip);
        Ok(b.public_ip)
    }

    /// Does `conn` need a mirror rule on the current backhaul?
    pub fn wants_mirror(&self, conn: &NatConn) -> bool {
        self.backhaul == BackhaulMode::CompanionModem
            && (conn.dst_nat || conn.proto == Protocol::TCP)
    }

    /// Remove the mirror rule and then the hardware rule of `entry`.
    ///
    /// A failed mirror removal is logged and otherwise ignored. A
    /// failed hardware delete leaves the entry enabled.
    pub fn withdraw(&self, entry: &mut CacheEntry) -> Result<(), NatError> {
        let Some(rule) = entry.rule() else {
            return Ok(());
        };
        let b = self.binding.ok_or(NatError::NoTable)?;

        if let Some(id) = entry.take_mirror() {
            if let Err(e) = self.mirror.remove_mirror_rule(id) {
                warn!(self.log, "failed to remove mirror rule";
                    "id" => %id, "conn" => %entry.conn, "err" => %e);
            }
        }

        self.device.delete_rule(b.hdl, rule)?;
        entry.disable();
        Ok(())
    }
}
