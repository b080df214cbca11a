// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Event dispatch.
//!
//! Notifications from the connection tracker and the interface
//! manager arrive as [`NatEvent`]s. One worker applies them in order,
//! while a periodic runs the timestamp synchronizer; both go through
//! the single lock around the [`NatCache`].

use super::cache::AddOutcome;
use super::cache::CloseOutcome;
use super::cache::FlushReport;
use super::cache::NatCache;
use super::cache::RestoreReport;
use super::ts_sync::SyncReport;
use crate::api::BackhaulMode;
use crate::api::ConnKey;
use crate::api::Ipv4Addr;
use crate::api::NatConn;
use crate::api::NatError;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Periodic;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::warn;
use std::io;
use std::sync::Arc;
use std::sync::mpsc;

/// A notification for the cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NatEvent {
    /// The tracker saw a new translated connection.
    NewConnection(NatConn),
    ConnectionClosed(ConnKey),
    /// Remember a connection without offloading it.
    CacheOnly(NatConn),
    /// The WAN came up with `public_ip` on mux `mux_id`.
    WanUp {
        public_ip: Ipv4Addr,
        mux_id: u8,
        #[serde(default)]
        backhaul: BackhaulMode,
    },
    WanDown { public_ip: Ipv4Addr },
    /// A neighbor was resolved. With `passthru`, its staged
    /// connections are installed untranslated.
    NeighborUp {
        ip: Ipv4Addr,
        #[serde(default)]
        passthru: bool,
    },
    NeighborDown { ip: Ipv4Addr },
    PowerSaveEnter(Ipv4Addr),
    PowerSaveExit(Ipv4Addr),
    ClientDisconnect(Ipv4Addr),
    StaClientDisconnect(Ipv4Addr),
    TableMove { to_ddr: bool },
    SetBackhaul(BackhaulMode),
    SyncTimestamps,
}

/// What applying an event did.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum EventOutcome {
    Added(AddOutcome),
    Closed(CloseOutcome),
    Cached { slot: u32 },
    TableUp { restore: RestoreReport, flush: FlushReport },
    /// The table is gone; `withdrawn` entries were disabled.
    TableDown { withdrawn: usize },
    Flushed(FlushReport),
    NeighborDown { flush: FlushReport, disabled: usize },
    /// A batch operation touched this many entries.
    Entries(usize),
    Synced(SyncReport),
    Done,
}

impl NatCache {
    /// Apply a single event.
    pub fn apply(&mut self, ev: NatEvent) -> Result<EventOutcome, NatError> {
        use EventOutcome as Out;

        match ev {
            NatEvent::NewConnection(conn) => {
                self.on_new_connection(conn).map(Out::Added)
            }

            NatEvent::ConnectionClosed(key) => {
                Ok(Out::Closed(self.on_connection_closed(&key)))
            }

            NatEvent::CacheOnly(conn) => self
                .cache_only(conn)
                .map(|slot| Out::Cached { slot: slot.index() as u32 }),

            NatEvent::WanUp { public_ip, mux_id, backhaul } => {
                // Restored entries are mirrored under the new mode; a
                // failed bring-up leaves the current one in place.
                let prev = self.backhaul_mode();
                self.set_backhaul_mode(backhaul);
                let restore = match self.create_table(public_ip, mux_id) {
                    Ok(restore) => restore,
                    Err(e) => {
                        self.set_backhaul_mode(prev);
                        return Err(e);
                    }
                };
                let flush = self.flush_temp(public_ip, true, false);
                Ok(Out::TableUp { restore, flush })
            }

            NatEvent::WanDown { public_ip } => self
                .destroy_table(public_ip)
                .map(|withdrawn| Out::TableDown { withdrawn }),

            NatEvent::NeighborUp { ip, passthru } => {
                Ok(Out::Flushed(self.flush_temp(ip, true, passthru)))
            }

            NatEvent::NeighborDown { ip } => {
                let flush = self.flush_temp(ip, false, false);
                let disabled = self.on_client_disconnect(ip)?;
                Ok(Out::NeighborDown { flush, disabled })
            }

            NatEvent::PowerSaveEnter(ip) => {
                self.enter_power_save(ip).map(Out::Entries)
            }

            NatEvent::PowerSaveExit(ip) => {
                self.exit_power_save(ip).map(Out::Entries)
            }

            NatEvent::ClientDisconnect(ip) => {
                self.on_client_disconnect(ip).map(Out::Entries)
            }

            NatEvent::StaClientDisconnect(ip) => {
                self.on_sta_client_disconnect(ip).map(Out::Entries)
            }

            NatEvent::TableMove { to_ddr } => {
                self.relocate(to_ddr).map(|_| Out::Done)
            }

            NatEvent::SetBackhaul(mode) => {
                self.set_backhaul_mode(mode);
                Ok(Out::Done)
            }

            NatEvent::SyncTimestamps => Ok(Out::Synced(self.sync_timestamps())),
        }
    }
}

/// The shared handle to a [`NatCache`].
pub struct NatSync {
    cache: KMutex<NatCache>,
    log: Logger,
}

impl NatSync {
    pub fn new(cache: NatCache, log: &Logger) -> Self {
        Self {
            cache: KMutex::new(cache),
            log: log.new(slog::o!("component" => "dispatch")),
        }
    }

    /// Apply `ev` under the cache lock.
    pub fn handle(&self, ev: NatEvent) -> Result<EventOutcome, NatError> {
        let mut cache = self.cache.lock();
        cache.apply(ev)
    }

    pub fn into_inner(self) -> NatCache {
        self.cache.into_inner()
    }

    /// Apply events from `rx` until every sender hangs up. Failures
    /// are logged and do not stop the worker. Returns the number of
    /// events applied.
    pub fn run(&self, rx: mpsc::Receiver<NatEvent>) -> usize {
        let mut n = 0;

        for ev in rx {
            let desc = format!("{ev:?}");
            match self.handle(ev) {
                Ok(out) => {
                    debug!(self.log, "event applied";
                        "event" => &desc, "outcome" => ?out);
                }

                Err(e) => {
                    warn!(self.log, "event failed";
                        "event" => &desc, "err" => %e, "errno" => e.to_errno());
                }
            }
            n += 1;
        }

        n
    }

    /// Start running the timestamp synchronizer at the configured
    /// `timestamp_sync_secs`. The synchronizer stops when the returned
    /// periodic is dropped.
    pub fn start_ts_sync(self: &Arc<Self>) -> io::Result<Periodic> {
        let period = self.cache.lock().sync_period();
        self.start_ts_sync_every(period)
    }

    /// Like [`Self::start_ts_sync`], but every `period`.
    pub fn start_ts_sync_every(
        self: &Arc<Self>,
        period: Duration,
    ) -> io::Result<Periodic> {
        debug!(self.log, "starting timestamp sync"; "period" => ?period);
        Periodic::new("natsync-ts", ts_tick, Box::new(self.clone()), period)
    }

    pub fn with_cache<R>(&self, f: impl FnOnce(&mut NatCache) -> R) -> R {
        let mut cache = self.cache.lock();
        f(&mut cache)
    }
}

fn ts_tick(sync: &mut Arc<NatSync>) {
    let report = sync.cache.lock().sync_timestamps();
    if report.queried > 0 || report.skipped > 0 {
        debug!(sync.log, "timestamp sync";
            "queried" => report.queried, "updated" => report.updated,
            "evicted" => report.evicted, "skipped" => report.skipped);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::engine::config::NatCfg;
    use crate::engine::sim::SimStack;
    use std::time::Instant;

    const PUB: Ipv4Addr = Ipv4Addr::from_const([52, 10, 128, 69]);

    fn conn(port: u16) -> NatConn {
        NatConn {
            private_ip: "10.0.0.5".parse().unwrap(),
            private_port: port,
            target_ip: "93.1.1.1".parse().unwrap(),
            target_port: 443,
            public_ip: PUB,
            public_port: port + 20000,
            proto: Protocol::TCP,
            dst_nat: false,
        }
    }

    fn sync() -> (NatSync, SimStack) {
        sync_with("max_entries = 8")
    }

    fn sync_with(cfg: &str) -> (NatSync, SimStack) {
        let sim = SimStack::new();
        let cfg = NatCfg::from_toml(cfg).unwrap();
        let log = Logger::root(slog::Discard, slog::o!());
        let cache = NatCache::new(&cfg, sim.providers(log.clone())).unwrap();
        (NatSync::new(cache, &log), sim)
    }

    #[test]
    fn wan_up_promotes_staged() {
        let (ns, sim) = sync();
        assert_eq!(
            ns.handle(NatEvent::NewConnection(conn(1))),
            Ok(EventOutcome::Added(AddOutcome::Staged))
        );

        let out = ns
            .handle(NatEvent::WanUp {
                public_ip: PUB,
                mux_id: 1,
                backhaul: BackhaulMode::CompanionModem,
            })
            .unwrap();
        let EventOutcome::TableUp { flush, .. } = out else {
            panic!("unexpected outcome: {out:?}");
        };
        assert_eq!(flush.promoted, 1);
        assert!(sim.device.has_rule(&conn(1).key()));
        assert!(sim.mirror.is_mirrored(&conn(1).key()));
    }

    #[test]
    fn failed_wan_up_keeps_backhaul() {
        let (ns, sim) = sync();
        let up = |backhaul| NatEvent::WanUp {
            public_ip: PUB,
            mux_id: 1,
            backhaul,
        };
        ns.handle(up(BackhaulMode::CompanionModem)).unwrap();

        assert_eq!(
            ns.handle(up(BackhaulMode::Standard)),
            Err(NatError::TableExists(PUB))
        );
        assert_eq!(
            ns.with_cache(|c| c.backhaul_mode()),
            BackhaulMode::CompanionModem
        );

        ns.handle(NatEvent::WanDown { public_ip: PUB }).unwrap();
        sim.device.fail(crate::api::DriverOp::CreateTable);
        assert!(ns.handle(up(BackhaulMode::Standard)).is_err());
        assert_eq!(
            ns.with_cache(|c| c.backhaul_mode()),
            BackhaulMode::CompanionModem
        );

        ns.handle(NatEvent::NewConnection(conn(1))).unwrap();
        sim.device.heal(crate::api::DriverOp::CreateTable);
        ns.handle(up(BackhaulMode::Standard)).unwrap();
        assert_eq!(
            ns.with_cache(|c| c.backhaul_mode()),
            BackhaulMode::Standard
        );
        assert!(sim.device.has_rule(&conn(1).key()));
        assert!(!sim.mirror.is_mirrored(&conn(1).key()));
    }

    #[test]
    fn worker_drains_channel() {
        let (ns, sim) = sync();
        let (tx, rx) = mpsc::channel();
        tx.send(NatEvent::WanUp {
            public_ip: PUB,
            mux_id: 1,
            backhaul: BackhaulMode::Standard,
        })
        .unwrap();
        tx.send(NatEvent::NewConnection(conn(1))).unwrap();
        tx.send(NatEvent::NewConnection(conn(1))).unwrap();
        tx.send(NatEvent::NewConnection(conn(2))).unwrap();
        tx.send(NatEvent::ConnectionClosed(conn(2).key())).unwrap();
        drop(tx);

        assert_eq!(ns.run(rx), 5);
        assert_eq!(sim.device.rules(), vec![conn(1)]);
        assert_eq!(ns.with_cache(|c| c.stats().duplicate), 1);
    }

    #[test]
    fn neighbor_down_discards_staged() {
        let (ns, _sim) = sync();
        ns.handle(NatEvent::NewConnection(conn(1))).unwrap();
        let out = ns
            .handle(NatEvent::NeighborDown { ip: "10.0.0.5".parse().unwrap() })
            .unwrap();
        assert_eq!(
            out,
            EventOutcome::NeighborDown {
                flush: FlushReport { visited: 1, promoted: 0, dropped: 1 },
                disabled: 0,
            }
        );
        assert!(ns.with_cache(|c| c.dump().staged.is_empty()));
    }

    #[test]
    fn periodic_sync_runs() {
        let (ns, sim) = sync();
        let ns = Arc::new(ns);
        ns.handle(NatEvent::WanUp {
            public_ip: PUB,
            mux_id: 1,
            backhaul: BackhaulMode::Standard,
        })
        .unwrap();
        ns.handle(NatEvent::NewConnection(conn(1))).unwrap();
        sim.device.set_idle(&conn(1).key(), 42);

        let p = ns.start_ts_sync_every(Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sim.ct.updates().is_empty() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(p);

        assert_eq!(sim.ct.updates().len(), 1);
        assert_eq!(Arc::strong_count(&ns), 1);
    }

    #[test]
    fn configured_sync_period() {
        let (ns, sim) = sync_with(
            r#"
            max_entries = 8
            timestamp_sync_secs = 1
            "#,
        );
        let ns = Arc::new(ns);
        assert_eq!(
            ns.with_cache(|c| c.sync_period()),
            Duration::from_secs(1)
        );
        ns.handle(NatEvent::WanUp {
            public_ip: PUB,
            mux_id: 1,
            backhaul: BackhaulMode::Standard,
        })
        .unwrap();
        ns.handle(NatEvent::NewConnection(conn(1))).unwrap();
        sim.device.set_idle(&conn(1).key(), 42);

        let started = Instant::now();
        let p = ns.start_ts_sync().unwrap();
        while sim.ct.updates().is_empty() {
            assert!(started.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(p);

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(sim.ct.updates().len(), 1);
    }
}
