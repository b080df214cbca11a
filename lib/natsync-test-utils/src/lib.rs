// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

// Let's make our lives easier and pub use a bunch of stuff.
pub use natsync::api::BackhaulMode;
pub use natsync::api::ConnKey;
pub use natsync::api::DriverOp;
pub use natsync::api::Ipv4Addr;
pub use natsync::api::MemPlacement;
pub use natsync::api::NatConn;
pub use natsync::api::NatError;
pub use natsync::api::Protocol;
pub use natsync::engine::cache::AddOutcome;
pub use natsync::engine::cache::CloseOutcome;
pub use natsync::engine::cache::FlushReport;
pub use natsync::engine::cache::NatCache;
pub use natsync::engine::cache::RestoreReport;
pub use natsync::engine::config::NatCfg;
pub use natsync::engine::conntrack::IdleTimeouts;
pub use natsync::engine::dispatch::EventOutcome;
pub use natsync::engine::dispatch::NatEvent;
pub use natsync::engine::dispatch::NatSync;
pub use natsync::engine::sim::SimStack;
pub use natsync::engine::temp::MAX_TEMP_ENTRIES;
pub use natsync::engine::ts_sync::ct_tuple;
pub use slog::Logger;

/// The public IP used by the default WAN.
pub const WAN_IP: Ipv4Addr = Ipv4Addr::from_const([52, 10, 128, 69]);

/// The public IP a WAN might come back with after a reconnect.
pub const WAN_IP2: Ipv4Addr = Ipv4Addr::from_const([52, 10, 128, 70]);

/// A LAN client.
pub const CLIENT: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 5]);

/// Another LAN client.
pub const CLIENT2: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 6]);

/// A remote server.
pub const SERVER: Ipv4Addr = Ipv4Addr::from_const([93, 184, 216, 34]);

pub fn discard_log() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A source NAT connection from `private` to `SERVER:443`, translated
/// to `public`.
pub fn snat(
    proto: Protocol,
    private: Ipv4Addr,
    port: u16,
    public: Ipv4Addr,
) -> NatConn {
    NatConn {
        private_ip: private,
        private_port: port,
        target_ip: SERVER,
        target_port: 443,
        public_ip: public,
        public_port: port.wrapping_add(20000),
        proto,
        dst_nat: false,
    }
}

/// A TCP connection from [`CLIENT`] through [`WAN_IP`].
pub fn tcp(port: u16) -> NatConn {
    snat(Protocol::TCP, CLIENT, port, WAN_IP)
}

/// A UDP connection from [`CLIENT`] through [`WAN_IP`].
pub fn udp(port: u16) -> NatConn {
    snat(Protocol::UDP, CLIENT, port, WAN_IP)
}

/// An inbound port forward: `SERVER` reaches `private:port` through
/// `WAN_IP:public_port`.
pub fn dnat(
    proto: Protocol,
    private: Ipv4Addr,
    port: u16,
    public_port: u16,
) -> NatConn {
    NatConn {
        private_ip: private,
        private_port: port,
        target_ip: SERVER,
        target_port: 40000,
        public_ip: WAN_IP,
        public_port,
        proto,
        dst_nat: true,
    }
}

pub fn cfg(max_entries: u32) -> NatCfg {
    let mut cfg = NatCfg::from_toml("max_entries = 1").unwrap();
    cfg.max_entries = max_entries;
    cfg
}

/// A cache without a table.
pub fn cache_with(cfg: &NatCfg) -> (NatCache, SimStack) {
    let sim = SimStack::new();
    let cache = NatCache::new(cfg, sim.providers(discard_log())).unwrap();
    (cache, sim)
}

/// A cache holding `max_entries`, without a table.
pub fn cache(max_entries: u32) -> (NatCache, SimStack) {
    cache_with(&cfg(max_entries))
}

/// A cache holding `max_entries` with a table for [`WAN_IP`] on mux 1.
pub fn cache_up(max_entries: u32) -> (NatCache, SimStack) {
    let (mut cache, sim) = cache(max_entries);
    cache.create_table(WAN_IP, 1).unwrap();
    (cache, sim)
}

/// Like [`cache_up`], but backhauled over the companion modem, so
/// that qualifying rules are mirrored.
pub fn cache_modem(max_entries: u32) -> (NatCache, SimStack) {
    let (mut cache, sim) = cache(max_entries);
    cache.set_backhaul_mode(BackhaulMode::CompanionModem);
    cache.create_table(WAN_IP, 1).unwrap();
    (cache, sim)
}

/// Assert that the cache and the simulated table agree on which
/// connections are offloaded.
pub fn assert_hw_matches(cache: &NatCache, sim: &SimStack) {
    let dump = cache.dump();
    let mut enabled: Vec<ConnKey> = dump
        .entries
        .iter()
        .filter(|(_, e)| e.enabled)
        .map(|(_, e)| e.conn.key())
        .collect();
    let mut hw: Vec<ConnKey> =
        sim.device.rules().iter().map(NatConn::key).collect();
    enabled.sort();
    hw.sort();
    assert_eq!(enabled, hw, "cache and hardware disagree");
}

/// The dumped entry for `key`, if the cache holds one.
pub fn entry(
    cache: &NatCache,
    key: &ConnKey,
) -> Option<natsync::api::CacheEntryDump> {
    cache
        .dump()
        .entries
        .into_iter()
        .map(|(_, e)| e)
        .find(|e| e.conn.key() == *key)
}
