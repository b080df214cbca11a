// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Idle timer reconciliation.
//!
//! Traffic for an offloaded flow never reaches the kernel, so the
//! connection tracker would age it out while it is still in use. Each
//! pass reads the hardware idle timer of every translated rule, and
//! for every rule which has seen traffic since the previous pass
//! pushes a fresh idle timeout to the tracker.

use super::cache::NatCache;
use super::conntrack::IdleTimeouts;
use super::device::ClockVote;
use super::entry::SlotId;
use crate::api::CtTuple;
use crate::api::Ipv4Addr;
use crate::api::NatConn;
use crate::api::NatError;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::warn;

/// The result of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    /// Idle timers successfully read.
    pub queried: usize,
    /// Rules which saw no traffic since the last pass.
    pub unchanged: usize,
    /// Timeouts pushed to the tracker.
    pub updated: usize,
    /// Entries deleted because the tracker refused the update.
    pub evicted: usize,
    /// Rules whose idle timer couldn't be read.
    pub skipped: usize,
}

/// The tuple the tracker knows `conn` by.
///
/// For source NAT that's the original direction, private to target.
/// For destination NAT the tracker sees the target talking to our
/// public endpoint.
pub fn ct_tuple(conn: &NatConn, public_ip: Ipv4Addr) -> CtTuple {
    if !conn.dst_nat {
        CtTuple {
            src_ip: conn.private_ip,
            src_port: conn.private_port,
            dst_ip: conn.target_ip,
            dst_port: conn.target_port,
            proto: conn.proto,
        }
    } else {
        CtTuple {
            src_ip: conn.target_ip,
            src_port: conn.target_port,
            dst_ip: public_ip,
            dst_port: conn.public_port,
            proto: conn.proto,
        }
    }
}

impl NatCache {
    /// Run one reconciliation pass.
    pub fn sync_timestamps(&mut self) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(binding) = self.table.binding() else {
            return report;
        };

        let candidates: Vec<SlotId> = self
            .store
            .iter()
            .filter(|(_, e)| e.enabled() && e.conn.translates())
            .map(|(slot, _)| slot)
            .collect();

        if candidates.is_empty() {
            return report;
        }

        self.stats.ts_passes += 1;
        let device = self.table.device().clone();

        // Held until the end of the pass.
        let _vote = if self.table.placement().needs_clock_vote()
            && device.sram_supported()
        {
            match ClockVote::acquire(&device, &self.log) {
                Ok(vote) => Some(vote),
                Err(e) => {
                    warn!(self.log, "clock vote failed, skipping pass";
                        "err" => %e);
                    self.stats.clock_vote_fail += 1;
                    return report;
                }
            }
        } else {
            None
        };

        let mut timeouts: Option<IdleTimeouts> = None;

        for slot in candidates {
            // An earlier eviction in this pass may have emptied the
            // slot.
            let Some(entry) = self.store.get(slot) else { continue };
            let Some(rule) = entry.rule() else { continue };
            let conn = entry.conn;
            let last = entry.timestamp;

            let idle = match device.query_idle_timer(binding.hdl, rule) {
                Ok(idle) => idle,
                Err(e) => {
                    debug!(self.log, "idle timer query failed";
                        "rule" => %rule, "conn" => %conn, "err" => %e);
                    self.stats.ts_query_fail += 1;
                    report.skipped += 1;
                    continue;
                }
            };
            report.queried += 1;

            if idle == last {
                report.unchanged += 1;
                continue;
            }

            let limits = match timeouts {
                Some(t) => t,
                None => *timeouts.insert(self.read_timeouts()),
            };

            let tuple = ct_tuple(&conn, binding.public_ip);
            let timeout = limits.for_proto(conn.proto);
            match self.ct_updater.update_idle_timeout(&tuple, timeout) {
                Ok(()) => {
                    if let Some(entry) = self.store.get_mut(slot) {
                        entry.timestamp = idle;
                    }
                    self.stats.ts_updated += 1;
                    report.updated += 1;
                }

                Err(e) => {
                    warn!(self.log, "{}", NatError::StaleHandle(rule);
                        "conn" => %conn, "tuple" => %tuple, "err" => %e);
                    self.delete_slot(slot);
                    self.stats.ts_evicted += 1;
                    report.evicted += 1;
                }
            }
        }

        report
    }

    /// The tracker's current thresholds, or the last ones we saw if
    /// they can't be read.
    fn read_timeouts(&mut self) -> IdleTimeouts {
        match self.ct_timeouts.idle_timeouts() {
            Ok(t) => {
                self.timeouts = t;
                t
            }

            Err(e) => {
                warn!(self.log, "failed to read idle timeouts";
                    "err" => %e, "using" => ?self.timeouts);
                self.timeouts
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::DriverOp;
    use crate::api::MemPlacement;
    use crate::api::Protocol;
    use crate::engine::config::NatCfg;
    use crate::engine::sim::SimStack;
    use slog::Logger;

    const PUB: Ipv4Addr = Ipv4Addr::from_const([52, 10, 128, 69]);

    fn conn(port: u16, proto: Protocol, dst_nat: bool) -> NatConn {
        NatConn {
            private_ip: "10.0.0.5".parse().unwrap(),
            private_port: port,
            target_ip: "93.1.1.1".parse().unwrap(),
            target_port: 443,
            public_ip: PUB,
            public_port: port + 20000,
            proto,
            dst_nat,
        }
    }

    fn cache(mem_type: MemPlacement) -> (NatCache, SimStack) {
        let sim = SimStack::new();
        let mut cfg = NatCfg::from_toml("max_entries = 8").unwrap();
        cfg.mem_type = mem_type;
        let log = Logger::root(slog::Discard, slog::o!());
        let mut cache = NatCache::new(&cfg, sim.providers(log)).unwrap();
        cache.create_table(PUB, 1).unwrap();
        (cache, sim)
    }

    #[test]
    fn tuple_direction() {
        let snat = conn(4000, Protocol::TCP, false);
        let t = ct_tuple(&snat, PUB);
        assert_eq!((t.src_ip, t.src_port), (snat.private_ip, 4000));
        assert_eq!((t.dst_ip, t.dst_port), (snat.target_ip, 443));

        let dnat = conn(4000, Protocol::UDP, true);
        let t = ct_tuple(&dnat, PUB);
        assert_eq!((t.src_ip, t.src_port), (dnat.target_ip, 443));
        assert_eq!((t.dst_ip, t.dst_port), (PUB, 24000));
        assert_eq!(t.proto, Protocol::UDP);
    }

    #[test]
    fn updates_only_changed() {
        let (mut c, sim) = cache(MemPlacement::Ddr);
        let tcp = conn(1, Protocol::TCP, false);
        let udp = conn(2, Protocol::UDP, false);
        c.on_new_connection(tcp).unwrap();
        c.on_new_connection(udp).unwrap();

        // Nothing moved yet.
        let r = c.sync_timestamps();
        assert_eq!(r, SyncReport { queried: 2, unchanged: 2, ..Default::default() });
        assert!(sim.ct.updates().is_empty());

        sim.device.set_idle(&udp.key(), 17);
        let r = c.sync_timestamps();
        assert_eq!(r.updated, 1);
        let ups = sim.ct.updates();
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].timeout, IdleTimeouts::FRAMEWORK_DEFAULT.udp);
        assert_eq!(ups[0].tuple, ct_tuple(&udp, PUB));

        // Stored, so the next pass sees no change.
        let r = c.sync_timestamps();
        assert_eq!(r.updated, 0);
        assert_eq!(sim.device.votes(), 0);
        assert_eq!(sim.device.calls(DriverOp::VoteClock), 0);
    }

    #[test]
    fn untranslated_skipped() {
        let (mut c, sim) = cache(MemPlacement::Sram);
        let mut passthru = conn(1, Protocol::TCP, false);
        passthru.private_ip = PUB;
        c.on_new_connection(passthru).unwrap();
        sim.device.set_idle(&passthru.key(), 5);

        assert_eq!(c.sync_timestamps(), SyncReport::default());
        assert_eq!(sim.device.calls(DriverOp::QueryIdleTimer), 0);
        assert_eq!(sim.device.calls(DriverOp::VoteClock), 0);
    }

    #[test]
    fn clock_vote_released() {
        let (mut c, sim) = cache(MemPlacement::Hybrid);
        let tcp = conn(1, Protocol::TCP, false);
        c.on_new_connection(tcp).unwrap();
        sim.device.set_idle(&tcp.key(), 3);

        c.sync_timestamps();
        assert_eq!(sim.device.calls(DriverOp::VoteClock), 2);
        assert_eq!(sim.device.votes(), 0);

        sim.device.fail_times(DriverOp::VoteClock, 1);
        sim.device.set_idle(&tcp.key(), 4);
        assert_eq!(c.sync_timestamps(), SyncReport::default());
        assert_eq!(c.stats().clock_vote_fail, 1);
        assert_eq!(sim.device.calls(DriverOp::QueryIdleTimer), 1);
    }

    #[test]
    fn failed_update_evicts() {
        let (mut c, sim) = cache(MemPlacement::Ddr);
        let a = conn(1, Protocol::TCP, false);
        let b = conn(2, Protocol::TCP, false);
        c.on_new_connection(a).unwrap();
        c.on_new_connection(b).unwrap();
        sim.device.set_idle(&a.key(), 1);
        sim.device.set_idle(&b.key(), 1);
        sim.ct.fail_tuple(ct_tuple(&a, PUB));

        let r = c.sync_timestamps();
        assert_eq!((r.updated, r.evicted), (1, 1));
        assert_eq!(c.len(), 1);
        assert!(!sim.device.has_rule(&a.key()));
        assert!(sim.device.has_rule(&b.key()));
    }

    #[test]
    fn thresholds_read_once() {
        let (mut c, sim) = cache(MemPlacement::Ddr);
        for p in 1..=3 {
            let cn = conn(p, Protocol::TCP, false);
            c.on_new_connection(cn).unwrap();
            sim.device.set_idle(&cn.key(), 9);
        }

        assert_eq!(c.sync_timestamps().updated, 3);
        assert_eq!(sim.ct.calls(DriverOp::ReadTimeouts), 1);

        // A failed read falls back to the last known thresholds.
        sim.ct.set_timeouts(IdleTimeouts { tcp: 60, udp: 30 });
        sim.ct.fail(DriverOp::ReadTimeouts);
        let cn = conn(1, Protocol::TCP, false);
        sim.device.set_idle(&cn.key(), 10);
        assert_eq!(c.sync_timestamps().updated, 1);
        let last = sim.ct.updates().pop().unwrap();
        assert_eq!(last.timeout, IdleTimeouts::FRAMEWORK_DEFAULT.tcp);
    }
}
