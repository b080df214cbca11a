// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Workloads shared by the natsync benchmarks.

use natsync_test_utils::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Cache sizes worth measuring: a small home router up to the largest
/// table the hardware supports.
pub const SIZES: [u32; 4] = [16, 128, 512, 2048];

/// `n` distinct TCP connections spread over `clients` LAN clients,
/// all translated through [`WAN_IP`].
pub fn conns(n: u32, clients: u8) -> Vec<NatConn> {
    let mut rng = StdRng::seed_from_u64(0x6e61_7473);
    let clients = u32::from(clients);
    (0..n)
        .map(|i| {
            let host = 1 + (i % clients) as u8;
            let port = 1024 + (i / clients) as u16;
            let client = Ipv4Addr::from([10, 0, 0, host]);
            let mut c = snat(Protocol::TCP, client, port, WAN_IP);
            c.target_port = rng.random_range(1..=u16::MAX);
            c
        })
        .collect()
}

/// A cache with a table, holding every connection in `conns`.
pub fn loaded_cache(conns: &[NatConn]) -> (NatCache, SimStack) {
    let (mut cache, sim) = cache_up(conns.len() as u32);
    for c in conns {
        cache.on_new_connection(*c).expect("failed to load connection");
    }
    (cache, sim)
}
