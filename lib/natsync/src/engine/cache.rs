// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NAT cache context.
//!
//! The [`NatCache`] ties the entry store, the temp buffer, the
//! power-save set and the table context together, and is the only
//! thing which mutates any of them. Each public method is an entry
//! point for one kind of notification; it is up to the caller to
//! serialize calls, see [`crate::engine::dispatch`].
//!
//! Driver calls are never retried here. Failures are either returned
//! to the caller, or, in the batch operations, logged and counted
//! against the offending entry while the batch carries on.

use super::config::CfgError;
use super::config::NatCfg;
use super::conntrack::ConntrackUpdater;
use super::conntrack::IdleTimeouts;
use super::conntrack::TimeoutSource;
use super::entry::CacheEntry;
use super::entry::EntryStore;
use super::entry::SlotId;
use super::entry::Visit;
use super::policy::AlgPorts;
use super::policy::PowerSaveFull;
use super::policy::PowerSaveSet;
use super::table::MirrorState;
use super::table::TableCtx;
use super::temp::TempBuffer;
use crate::api::BackhaulMode;
use crate::api::ConnKey;
use crate::api::DumpCacheResp;
use crate::api::Ipv4Addr;
use crate::api::NatConn;
use crate::api::NatError;
use crate::api::TableHdl;
use crate::ddi::stat::StatProvider;
use crate::ddi::stat::StatU64;
use crate::provider::Providers;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::sync::Arc;

#[derive(StatProvider)]
pub struct CacheStats {
    /// Connections installed into the hardware table.
    pub added: StatU64,
    /// Connections cached without a hardware rule.
    pub cached: StatU64,
    pub staged: StatU64,
    /// Connections dropped because the temp buffer was full.
    pub stage_dropped: StatU64,
    pub unstaged: StatU64,
    pub promoted: StatU64,
    pub alg_excluded: StatU64,
    pub malformed: StatU64,
    pub duplicate: StatU64,
    pub full: StatU64,
    pub deleted: StatU64,
    pub hw_add_fail: StatU64,
    pub hw_del_fail: StatU64,
    pub mirror_installed: StatU64,
    pub mirror_fail: StatU64,
    /// Entries reinstalled when their table came back.
    pub restored: StatU64,
    pub restore_fail: StatU64,
    /// Entries discarded because the table came back with another
    /// public IP.
    pub purged: StatU64,
    pub ps_disabled: StatU64,
    pub ps_restored: StatU64,
    pub ps_restore_fail: StatU64,
    pub ts_passes: StatU64,
    pub ts_query_fail: StatU64,
    pub ts_updated: StatU64,
    pub ts_evicted: StatU64,
    pub clock_vote_fail: StatU64,
}

impl CacheStats {
    fn count_mirror(&mut self, state: MirrorState) {
        match state {
            MirrorState::NotRequired => (),
            MirrorState::Installed(_) => self.mirror_installed += 1,
            MirrorState::Failed(_) => self.mirror_fail += 1,
        }
    }

    fn count_reject(&mut self, err: &NatError) {
        match err {
            NatError::MalformedCandidate => self.malformed += 1,
            NatError::Duplicate(_) => self.duplicate += 1,
            NatError::CacheFull(_) => self.full += 1,
            _ => (),
        }
    }
}

/// What became of a new connection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AddOutcome {
    /// Stored and installed in hardware.
    Installed { slot: u32, mirror: bool },
    /// Stored, but left disabled because an endpoint is asleep.
    Cached { slot: u32 },
    /// Parked until a table exists.
    Staged,
    /// The temp buffer was full.
    StageDropped,
    /// One of the ports belongs to an ALG.
    AlgExcluded,
}

/// What became of a closed connection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CloseOutcome {
    /// The entry and its hardware rule were removed.
    Deleted { slot: u32 },
    /// The entry was removed; it had no hardware rule.
    Uncached { slot: u32 },
    /// A staged connection was removed.
    Unstaged,
    NotFound,
}

/// The result of creating a table.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    /// Entries left disabled because an endpoint is in power-save.
    pub deferred: usize,
    /// Entries which failed to reinstall and were dropped.
    pub failed: usize,
    /// Entries dropped because they translate to another public IP.
    pub purged: usize,
}

/// The result of flushing the temp buffer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlushReport {
    pub visited: usize,
    pub promoted: usize,
    pub dropped: usize,
}

pub struct NatCache {
    pub(super) log: Logger,
    pub(super) table: TableCtx,
    pub(super) store: EntryStore,
    pub(super) temp: TempBuffer,
    pub(super) alg: AlgPorts,
    pub(super) power_save: PowerSaveSet,
    pub(super) ct_updater: Arc<dyn ConntrackUpdater>,
    pub(super) ct_timeouts: Arc<dyn TimeoutSource>,
    /// The last thresholds successfully read from the tracker.
    pub(super) timeouts: IdleTimeouts,
    pub(super) sync_period: Duration,
    pub(super) stats: CacheStats,
}

impl NatCache {
    pub fn new(cfg: &NatCfg, providers: Providers) -> Result<Self, CfgError> {
        cfg.validate()?;
        let limit = cfg.limit()?;
        let log = providers.log.new(slog::o!("component" => "nat-cache"));
        let table = TableCtx::new(
            &providers.log,
            providers.device,
            providers.mirror,
            limit.get(),
            cfg.mem_type,
        );

        info!(log, "NAT cache ready";
            "max_entries" => limit.get(), "mem_type" => %cfg.mem_type,
            "alg_ports" => cfg.alg_ports.len());

        Ok(Self {
            log,
            table,
            store: EntryStore::new(limit),
            temp: TempBuffer::new(),
            alg: cfg.alg(),
            power_save: PowerSaveSet::new(),
            ct_updater: providers.ct_updater,
            ct_timeouts: providers.ct_timeouts,
            timeouts: IdleTimeouts::FRAMEWORK_DEFAULT,
            sync_period: cfg.sync_period(),
            stats: CacheStats::new(),
        })
    }

    pub fn backhaul_mode(&self) -> BackhaulMode {
        self.table.backhaul()
    }

    /// Record `conn` as a disabled entry without touching hardware.
    pub fn cache_only(&mut self, conn: NatConn) -> Result<SlotId, NatError> {
        let slot = self.store.add(conn).inspect_err(|e| {
            self.stats.count_reject(e);
            debug!(self.log, "not caching"; "conn" => %conn, "err" => %e);
        })?;
        self.stats.cached += 1;
        Ok(slot)
    }

    /// Create the hardware table for `public_ip` on WAN mux `mux_id`.
    ///
    /// If `public_ip` is the same public IP the previous table was
    /// bound to, every cached entry is reinstalled, except those
    /// belonging to an endpoint in power-save. Otherwise, entries
    /// translating to any other public IP are discarded.
    pub fn create_table(
        &mut self,
        public_ip: Ipv4Addr,
        mux_id: u8,
    ) -> Result<RestoreReport, NatError> {
        if public_ip.is_unset() {
            return Err(NatError::InvalidAddress(public_ip));
        }

        self.table.bind(public_ip, mux_id)?;

        let mut report = RestoreReport::default();
        let table = &self.table;
        let ps = &self.power_save;
        let stats = &mut self.stats;
        let log = &self.log;

        if table.prev_public_ip() == Some(public_ip) {
            self.store.for_each(|slot, entry| {
                if entry.enabled() {
                    return Visit::Keep;
                }

                if ps.contains(entry.conn.private_ip)
                    || ps.contains(entry.conn.target_ip)
                {
                    report.deferred += 1;
                    return Visit::Keep;
                }

                match table.install(entry) {
                    Ok(mirror) => {
                        stats.restored += 1;
                        stats.count_mirror(mirror);
                        report.restored += 1;
                        Visit::Keep
                    }

                    Err(e) => {
                        warn!(log, "failed to restore entry";
                            "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                        stats.restore_fail += 1;
                        report.failed += 1;
                        Visit::Evict
                    }
                }
            });
        } else {
            self.store.for_each(|_, entry| {
                if entry.conn.public_ip == public_ip {
                    return Visit::Keep;
                }

                stats.purged += 1;
                report.purged += 1;
                Visit::Evict
            });
        }

        info!(self.log, "table up";
            "public_ip" => %public_ip, "restored" => report.restored,
            "deferred" => report.deferred, "failed" => report.failed,
            "purged" => report.purged);
        Ok(report)
    }

    /// Tear down the table bound to `public_ip`.
    ///
    /// Every entry is disabled and kept, so that it can be restored
    /// if the same public IP comes back. Returns the number of
    /// entries which were enabled.
    pub fn destroy_table(
        &mut self,
        public_ip: Ipv4Addr,
    ) -> Result<usize, NatError> {
        self.table.check_binding(public_ip)?;

        let table = &self.table;
        let stats = &mut self.stats;
        let log = &self.log;
        let withdrawn = self.store.for_each_enabled(|slot, entry| {
            if let Err(e) = table.withdraw(entry) {
                // The table is going away regardless, and its rules
                // with it.
                warn!(log, "failed to withdraw entry";
                    "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                stats.hw_del_fail += 1;
                entry.disable();
            }
            Visit::Keep
        });

        self.table.unbind()?;
        Ok(withdrawn)
    }

    /// Snapshot the whole cache.
    pub fn dump(&self) -> DumpCacheResp {
        let stats = self.stats.snapshot();
        DumpCacheResp {
            limit: self.store.get_limit().get(),
            table: self.table.binding().map(Into::into),
            prev_public_ip: self.table.prev_public_ip(),
            backhaul: self.table.backhaul(),
            entries: self.store.dump(),
            staged: self.temp.iter().copied().collect(),
            power_save: self.power_save.iter().copied().collect(),
            stats: stats
                .iter()
                .map(|(name, val)| (name.to_string(), val))
                .collect(),
        }
    }

    /// Put `ip` into power-save, withdrawing the hardware rules of
    /// every connection it originated. Returns the number of entries
    /// disabled.
    pub fn enter_power_save(
        &mut self,
        ip: Ipv4Addr,
    ) -> Result<usize, NatError> {
        if ip.is_unset() {
            return Err(NatError::InvalidAddress(ip));
        }

        match self.power_save.insert(ip) {
            Ok(true) => (),
            Ok(false) => {
                debug!(self.log, "already in power-save"; "ip" => %ip);
                return Ok(0);
            }
            // We can't remember this endpoint, but its rules must
            // still go.
            Err(PowerSaveFull(_)) => {
                warn!(self.log, "power-save set full"; "ip" => %ip);
            }
        }

        let mut disabled = 0;
        let table = &self.table;
        let stats = &mut self.stats;
        let log = &self.log;
        self.store.for_each_matching_private_ip(ip, |slot, entry| {
            if !entry.enabled() {
                return Visit::Keep;
            }

            match table.withdraw(entry) {
                Ok(()) => {
                    stats.ps_disabled += 1;
                    disabled += 1;
                }

                Err(e) => {
                    warn!(log, "failed to disable entry";
                        "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                    stats.hw_del_fail += 1;
                }
            }
            Visit::Keep
        });

        info!(self.log, "power-save enter"; "ip" => %ip, "disabled" => disabled);
        Ok(disabled)
    }

    /// Take `ip` out of power-save and reinstall every disabled
    /// connection it originated. Connections targeting `ip` which were
    /// held back on its account are reinstalled as well, unless their
    /// originator is itself in power-save. Entries which fail to
    /// reinstall are dropped. Returns the number of entries restored.
    pub fn exit_power_save(&mut self, ip: Ipv4Addr) -> Result<usize, NatError> {
        if ip.is_unset() {
            return Err(NatError::InvalidAddress(ip));
        }

        self.power_save.remove(ip);
        if self.table.binding().is_none() {
            // Nothing can be installed; the entries are restored when
            // the table comes up.
            debug!(self.log, "power-save exit without table"; "ip" => %ip);
            return Ok(0);
        }

        let mut restored = 0;
        let table = &self.table;
        let ps = &self.power_save;
        let stats = &mut self.stats;
        let log = &self.log;
        let mut restore = |slot: SlotId, entry: &mut CacheEntry| {
            if entry.enabled() {
                return Visit::Keep;
            }

            match table.install(entry) {
                Ok(mirror) => {
                    stats.ps_restored += 1;
                    stats.count_mirror(mirror);
                    restored += 1;
                    Visit::Keep
                }

                Err(e) => {
                    warn!(log, "failed to re-enable entry";
                        "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                    stats.ps_restore_fail += 1;
                    Visit::Evict
                }
            }
        };

        self.store.for_each_matching_private_ip(ip, &mut restore);
        self.store.for_each_matching_target_ip(ip, |slot, entry| {
            if ps.contains(entry.conn.private_ip) {
                return Visit::Keep;
            }
            restore(slot, entry)
        });

        info!(self.log, "power-save exit"; "ip" => %ip, "restored" => restored);
        Ok(restored)
    }

    /// Visit every staged connection touching `addr` and clear it.
    ///
    /// When `promote` is set, connections translating to the active
    /// table's public IP go through the normal add path first. With
    /// `substitute` their private endpoint is replaced by the public
    /// one, so that they pass through the table untranslated.
    pub fn flush_temp(
        &mut self,
        addr: Ipv4Addr,
        promote: bool,
        substitute: bool,
    ) -> FlushReport {
        let active = self.table.binding().map(|b| b.public_ip);
        let mut report = FlushReport::default();

        for mut conn in self.temp.drain_matching(addr) {
            report.visited += 1;

            if !promote || Some(conn.public_ip) != active {
                report.dropped += 1;
                continue;
            }

            if substitute {
                conn.private_ip = conn.public_ip;
                conn.private_port = conn.public_port;
            }

            match self.on_new_connection(conn) {
                Ok(AddOutcome::Installed { .. } | AddOutcome::Cached { .. }) => {
                    self.stats.promoted += 1;
                    report.promoted += 1;
                }

                Ok(outcome) => {
                    debug!(self.log, "staged connection not promoted";
                        "conn" => %conn, "outcome" => ?outcome);
                    report.dropped += 1;
                }

                Err(e) => {
                    debug!(self.log, "staged connection not promoted";
                        "conn" => %conn, "err" => %e);
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Is `ip` currently in power-save?
    pub fn is_power_saving(&self, ip: Ipv4Addr) -> bool {
        self.power_save.contains(ip)
    }

    /// Is `conn` excluded from offload because of an ALG port?
    pub fn is_alg_excluded(&self, conn: &NatConn) -> bool {
        self.alg.excludes(conn)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// A LAN client went away. Forget its power-save state and
    /// withdraw the hardware rules of the connections it originated,
    /// keeping them cached. Returns the number of entries disabled.
    pub fn on_client_disconnect(
        &mut self,
        ip: Ipv4Addr,
    ) -> Result<usize, NatError> {
        if ip.is_unset() {
            return Err(NatError::InvalidAddress(ip));
        }

        self.power_save.remove(ip);

        let mut disabled = 0;
        let table = &self.table;
        let stats = &mut self.stats;
        let log = &self.log;
        self.store.for_each_matching_private_ip(ip, |slot, entry| {
            if !entry.enabled() {
                return Visit::Keep;
            }

            match table.withdraw(entry) {
                Ok(()) => disabled += 1,
                Err(e) => {
                    warn!(log, "failed to disable entry";
                        "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                    stats.hw_del_fail += 1;
                }
            }
            Visit::Keep
        });

        info!(self.log, "client disconnect"; "ip" => %ip, "disabled" => disabled);
        Ok(disabled)
    }

    /// The connection identified by `key` closed.
    pub fn on_connection_closed(&mut self, key: &ConnKey) -> CloseOutcome {
        if let Some(slot) = self.store.find(key) {
            let enabled = self.delete_slot(slot);
            self.stats.deleted += 1;
            let slot = slot.index() as u32;
            return if enabled {
                CloseOutcome::Deleted { slot }
            } else {
                CloseOutcome::Uncached { slot }
            };
        }

        if self.temp.remove(key).is_some() {
            self.stats.unstaged += 1;
            return CloseOutcome::Unstaged;
        }

        debug!(self.log, "no entry for closed connection"; "key" => %key);
        CloseOutcome::NotFound
    }

    /// A new translated connection showed up.
    ///
    /// # Errors
    ///
    /// * [`NatError::MalformedCandidate`], [`NatError::Duplicate`],
    ///   [`NatError::CacheFull`]: the connection was not stored.
    /// * [`NatError::Driver`]: the hardware refused the rule; the
    ///   connection was not stored.
    pub fn on_new_connection(
        &mut self,
        conn: NatConn,
    ) -> Result<AddOutcome, NatError> {
        if self.alg.excludes(&conn) {
            self.stats.alg_excluded += 1;
            debug!(self.log, "ALG connection"; "conn" => %conn);
            return Ok(AddOutcome::AlgExcluded);
        }

        if self.table.binding().is_none() {
            return self.stage(conn);
        }

        let deferred = self.power_save.contains(conn.private_ip)
            || self.power_save.contains(conn.target_ip);

        let (slot, entry) = match self.store.insert(conn) {
            Ok(v) => v,
            Err(e) => {
                self.stats.count_reject(&e);
                debug!(self.log, "not adding"; "conn" => %conn, "err" => %e);
                return Err(e);
            }
        };

        if deferred {
            self.stats.cached += 1;
            debug!(self.log, "endpoint in power-save, caching";
                "slot" => %slot, "conn" => %conn);
            return Ok(AddOutcome::Cached { slot: slot.index() as u32 });
        }

        match self.table.install(entry) {
            Ok(mirror) => {
                self.stats.added += 1;
                self.stats.count_mirror(mirror);
                Ok(AddOutcome::Installed {
                    slot: slot.index() as u32,
                    mirror: matches!(mirror, MirrorState::Installed(_)),
                })
            }

            Err(e) => {
                self.store.clear_slot(slot);
                self.stats.hw_add_fail += 1;
                error!(self.log, "failed to install rule";
                    "conn" => %conn, "err" => %e);
                Err(e)
            }
        }
    }

    /// An upstream station went away. Delete every connection
    /// targeting it; entries whose hardware rule can't be deleted are
    /// kept. Returns the number of entries deleted.
    pub fn on_sta_client_disconnect(
        &mut self,
        ip: Ipv4Addr,
    ) -> Result<usize, NatError> {
        if ip.is_unset() {
            return Err(NatError::InvalidAddress(ip));
        }

        let mut deleted = 0;
        let table = &self.table;
        let stats = &mut self.stats;
        let log = &self.log;
        self.store.for_each_matching_target_ip(ip, |slot, entry| {
            if let Err(e) = table.withdraw(entry) {
                warn!(log, "failed to delete entry";
                    "slot" => %slot, "conn" => %entry.conn, "err" => %e);
                stats.hw_del_fail += 1;
                return Visit::Keep;
            }

            stats.deleted += 1;
            deleted += 1;
            Visit::Evict
        });

        info!(self.log, "station disconnect"; "ip" => %ip, "deleted" => deleted);
        Ok(deleted)
    }

    /// Move the table to DDR (`true`) or back to its configured
    /// placement (`false`).
    pub fn relocate(&mut self, to_ddr: bool) -> Result<(), NatError> {
        self.table.relocate(to_ddr)
    }

    pub fn set_backhaul_mode(&mut self, mode: BackhaulMode) {
        self.table.set_backhaul(mode);
    }

    /// Park `conn` until a table exists.
    pub fn stage(&mut self, conn: NatConn) -> Result<AddOutcome, NatError> {
        if self.alg.excludes(&conn) {
            self.stats.alg_excluded += 1;
            return Ok(AddOutcome::AlgExcluded);
        }

        if conn.is_malformed() {
            self.stats.malformed += 1;
            debug!(self.log, "malformed connection"; "conn" => %conn);
            return Err(NatError::MalformedCandidate);
        }

        let key = conn.key();
        if self.store.find_duplicate(&key) || self.temp.contains(&key) {
            self.stats.duplicate += 1;
            debug!(self.log, "duplicate connection"; "conn" => %conn);
            return Err(NatError::Duplicate(key));
        }

        if self.temp.push(conn).is_err() {
            self.stats.stage_dropped += 1;
            debug!(self.log, "temp buffer full"; "conn" => %conn);
            return Ok(AddOutcome::StageDropped);
        }

        self.stats.staged += 1;
        Ok(AddOutcome::Staged)
    }

    /// How often the timestamp synchronizer should run.
    pub fn sync_period(&self) -> Duration {
        self.sync_period
    }

    pub fn stats(&self) -> CacheStatsSnap {
        self.stats.snapshot()
    }

    /// The handle of the table bound to `public_ip`.
    pub fn table_handle(
        &self,
        public_ip: Ipv4Addr,
    ) -> Result<TableHdl, NatError> {
        self.table.check_binding(public_ip).map(|b| b.hdl)
    }

    /// Remove the staged connection for `key`.
    pub fn unstage(&mut self, key: &ConnKey) -> bool {
        self.temp.remove(key).is_some()
    }

    // Withdraw and clear the entry in `slot`, returning whether it was
    // enabled. A failed withdraw is logged and the slot is cleared
    // regardless.
    pub(super) fn delete_slot(&mut self, slot: SlotId) -> bool {
        let Some(entry) = self.store.get_mut(slot) else {
            return false;
        };

        let enabled = entry.enabled();
        if let Err(e) = self.table.withdraw(entry) {
            warn!(self.log, "failed to delete rule";
                "slot" => %slot, "conn" => %entry.conn, "err" => %e);
            self.stats.hw_del_fail += 1;
        }

        self.store.clear_slot(slot);
        enabled
    }
}
