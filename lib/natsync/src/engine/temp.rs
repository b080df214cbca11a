// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The temp entry buffer.
//!
//! Connections can show up before the hardware table exists, or
//! before the neighbor they belong to has been resolved. Such
//! connections are parked here until an address event either
//! promotes them into the cache or discards them.

use crate::api::ConnKey;
use crate::api::Ipv4Addr;
use crate::api::NatConn;
use heapless::Vec as FVec;

pub const MAX_TEMP_ENTRIES: usize = 100;

#[derive(Debug, Default)]
pub struct TempBuffer {
    entries: FVec<NatConn, MAX_TEMP_ENTRIES>,
}

impl TempBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.entries.iter().any(|c| c.key() == *key)
    }

    /// Remove and return every staged connection touching `addr` as
    /// its private, target or public address, in staging order.
    pub fn drain_matching(&mut self, addr: Ipv4Addr) -> Vec<NatConn> {
        let (matched, kept): (Vec<NatConn>, Vec<NatConn>) = self
            .entries
            .iter()
            .copied()
            .partition(|c| c.involves(addr) || c.public_ip == addr);

        // The kept set is a subset of what we had, so it always fits.
        self.entries = kept.into_iter().collect();
        matched
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NatConn> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Stage `conn`, handing it back if the buffer is full.
    ///
    /// The caller is responsible for dedup: a connection is never
    /// staged twice.
    pub fn push(&mut self, conn: NatConn) -> Result<(), NatConn> {
        debug_assert!(!self.contains(&conn.key()));
        self.entries.push(conn)
    }

    /// Remove the staged connection matching `key`.
    pub fn remove(&mut self, key: &ConnKey) -> Option<NatConn> {
        let idx = self.entries.iter().position(|c| c.key() == *key)?;
        Some(self.entries.remove(idx))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;

    fn conn(private: &str, port: u16) -> NatConn {
        NatConn {
            private_ip: private.parse().unwrap(),
            private_port: port,
            target_ip: "93.1.1.1".parse().unwrap(),
            target_port: 443,
            public_ip: "52.10.128.69".parse().unwrap(),
            public_port: port,
            proto: Protocol::UDP,
            dst_nat: false,
        }
    }

    #[test]
    fn bounded_push() {
        let mut tb = TempBuffer::new();
        for p in 1..=MAX_TEMP_ENTRIES as u16 {
            tb.push(conn("10.0.0.5", p)).unwrap();
        }
        assert!(tb.is_full());
        let extra = conn("10.0.0.6", 1);
        assert_eq!(tb.push(extra), Err(extra));
        assert_eq!(tb.len(), MAX_TEMP_ENTRIES);
    }

    #[test]
    fn drain_keeps_order_and_rest() {
        let mut tb = TempBuffer::new();
        tb.push(conn("10.0.0.5", 1)).unwrap();
        tb.push(conn("10.0.0.6", 2)).unwrap();
        tb.push(conn("10.0.0.5", 3)).unwrap();

        let drained = tb.drain_matching("10.0.0.5".parse().unwrap());
        let ports: Vec<u16> = drained.iter().map(|c| c.private_port).collect();
        assert_eq!(ports, vec![1, 3]);
        assert_eq!(tb.len(), 1);

        // The public address matches every staged connection.
        let drained = tb.drain_matching("52.10.128.69".parse().unwrap());
        assert_eq!(drained.len(), 1);
        assert_eq!(tb.len(), 0);
    }

    #[test]
    fn remove_by_key() {
        let mut tb = TempBuffer::new();
        let c = conn("10.0.0.5", 1);
        tb.push(c).unwrap();
        assert!(tb.contains(&c.key()));
        assert_eq!(tb.remove(&c.key()), Some(c));
        assert_eq!(tb.remove(&c.key()), None);
    }
}
