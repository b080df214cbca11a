// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The NAT entry store.
//!
//! A bounded arena of optional entries. Lookups and dedup checks are
//! linear scans over every slot, and a new entry always claims the
//! lowest free slot. Both properties are intentional: the capacity
//! mirrors the hardware table size, and slot reuse is observable by
//! consumers of the dump.

use crate::api::CacheEntryDump;
use crate::api::ConnKey;
use crate::api::Ipv4Addr;
use crate::api::MirrorRuleId;
use crate::api::NatConn;
use crate::api::NatError;
use crate::api::RuleHdl;
use core::fmt;
use core::num::NonZeroU32;

/// The index of an occupied slot in the [`EntryStore`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a traversal callback wants done with the visited entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    Keep,
    Evict,
}

/// A single connection known to the cache.
///
/// An entry is *enabled* exactly when it holds a hardware rule
/// handle. A disabled entry keeps every translation field so that it
/// can be reinstalled later.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub conn: NatConn,
    rule: Option<RuleHdl>,
    mirror: Option<MirrorRuleId>,
    /// The last idle timer value read back from hardware.
    pub timestamp: u32,
}

impl CacheEntry {
    fn new(conn: NatConn) -> Self {
        Self { conn, rule: None, mirror: None, timestamp: 0 }
    }

    pub fn enabled(&self) -> bool {
        self.rule.is_some()
    }

    pub fn rule(&self) -> Option<RuleHdl> {
        self.rule
    }

    pub fn mirror(&self) -> Option<MirrorRuleId> {
        self.mirror
    }

    pub fn key(&self) -> ConnKey {
        self.conn.key()
    }

    /// Record the hardware rule backing this entry.
    pub(crate) fn enable(&mut self, rule: RuleHdl) {
        self.rule = Some(rule);
    }

    /// Forget the hardware rule (and with it any mirror rule, which is
    /// only meaningful while the hardware rule exists).
    pub(crate) fn disable(&mut self) -> Option<RuleHdl> {
        self.mirror = None;
        self.rule.take()
    }

    pub(crate) fn set_mirror(&mut self, id: Option<MirrorRuleId>) {
        debug_assert!(id.is_none() || self.enabled());
        self.mirror = id;
    }

    pub(crate) fn take_mirror(&mut self) -> Option<MirrorRuleId> {
        self.mirror.take()
    }

    pub fn dump(&self) -> CacheEntryDump {
        CacheEntryDump {
            conn: self.conn,
            enabled: self.enabled(),
            rule: self.rule,
            mirror: self.mirror,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug)]
pub struct EntryStore {
    limit: NonZeroU32,
    slots: Vec<Option<CacheEntry>>,
    count: usize,
}

impl EntryStore {
    pub fn new(limit: NonZeroU32) -> Self {
        let slots = (0..limit.get()).map(|_| None).collect();
        Self { limit, slots, count: 0 }
    }

    /// Add a new, disabled entry for `conn` in the lowest free slot.
    ///
    /// # Errors
    ///
    /// * [`NatError::MalformedCandidate`]: a key field is zero.
    /// * [`NatError::Duplicate`]: an entry with the same 5-tuple
    ///   exists. The existing entry is never overwritten.
    /// * [`NatError::CacheFull`]: every slot is occupied.
    pub fn add(&mut self, conn: NatConn) -> Result<SlotId, NatError> {
        self.insert(conn).map(|(slot, _)| slot)
    }

    /// Like [`EntryStore::add()`], but also hand back the new entry.
    pub fn insert(
        &mut self,
        conn: NatConn,
    ) -> Result<(SlotId, &mut CacheEntry), NatError> {
        if conn.is_malformed() {
            return Err(NatError::MalformedCandidate);
        }

        let key = conn.key();
        if self.find_duplicate(&key) {
            return Err(NatError::Duplicate(key));
        }

        let Some(idx) = self.slots.iter().position(Option::is_none) else {
            return Err(NatError::CacheFull(self.limit.get()));
        };

        self.count += 1;
        let entry = self.slots[idx].insert(CacheEntry::new(conn));
        Ok((SlotId(idx as u32), entry))
    }

    /// Clear the given slot, returning the entry it held.
    pub fn clear_slot(&mut self, slot: SlotId) -> Option<CacheEntry> {
        let entry = self.slots.get_mut(slot.index())?.take();
        if entry.is_some() {
            self.count -= 1;
        }
        entry
    }

    pub fn dump(&self) -> Vec<(u32, CacheEntryDump)> {
        self.iter().map(|(slot, e)| (slot.0, e.dump())).collect()
    }

    /// Find the slot holding `key`, if any.
    pub fn find(&self, key: &ConnKey) -> Option<SlotId> {
        self.iter().find(|(_, e)| e.key() == *key).map(|(slot, _)| slot)
    }

    /// Is there an entry with the same 5-tuple as `key`?
    pub fn find_duplicate(&self, key: &ConnKey) -> bool {
        self.find(key).is_some()
    }

    /// Call `f` for every enabled entry, in slot order.
    pub fn for_each_enabled<F>(&mut self, f: F) -> usize
    where
        F: FnMut(SlotId, &mut CacheEntry) -> Visit,
    {
        self.visit(|e| e.enabled(), f)
    }

    /// Call `f` for every entry whose private IP is `ip`, in slot
    /// order.
    pub fn for_each_matching_private_ip<F>(
        &mut self,
        ip: Ipv4Addr,
        f: F,
    ) -> usize
    where
        F: FnMut(SlotId, &mut CacheEntry) -> Visit,
    {
        self.visit(|e| e.conn.private_ip == ip, f)
    }

    /// Call `f` for every entry whose target IP is `ip`, in slot
    /// order.
    pub fn for_each_matching_target_ip<F>(
        &mut self,
        ip: Ipv4Addr,
        f: F,
    ) -> usize
    where
        F: FnMut(SlotId, &mut CacheEntry) -> Visit,
    {
        self.visit(|e| e.conn.target_ip == ip, f)
    }

    /// Call `f` for every occupied slot, in slot order.
    pub fn for_each<F>(&mut self, f: F) -> usize
    where
        F: FnMut(SlotId, &mut CacheEntry) -> Visit,
    {
        self.visit(|_| true, f)
    }

    pub fn get(&self, slot: SlotId) -> Option<&CacheEntry> {
        self.slots.get(slot.index())?.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut CacheEntry> {
        self.slots.get_mut(slot.index())?.as_mut()
    }

    pub fn get_limit(&self) -> NonZeroU32 {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &CacheEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (SlotId(i as u32), e)))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Remove the entry for `key`. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &ConnKey) -> Option<CacheEntry> {
        let slot = self.find(key)?;
        self.clear_slot(slot)
    }

    // Visit every occupied slot matching `pred`, evicting those the
    // callback asks for. Returns the number of entries visited.
    fn visit<P, F>(&mut self, pred: P, mut f: F) -> usize
    where
        P: Fn(&CacheEntry) -> bool,
        F: FnMut(SlotId, &mut CacheEntry) -> Visit,
    {
        let mut visited = 0;

        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.as_mut() else { continue };
            if !pred(entry) {
                continue;
            }

            visited += 1;
            if f(SlotId(i as u32), entry) == Visit::Evict {
                *slot = None;
                self.count -= 1;
            }
        }

        visited
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeSet;

    fn conn(priv_port: u16) -> NatConn {
        NatConn {
            private_ip: "10.0.0.5".parse().unwrap(),
            private_port: priv_port,
            target_ip: "93.1.1.1".parse().unwrap(),
            target_port: 80,
            public_ip: "52.10.128.69".parse().unwrap(),
            public_port: priv_port + 20000,
            proto: Protocol::TCP,
            dst_nat: false,
        }
    }

    fn store(limit: u32) -> EntryStore {
        EntryStore::new(NonZeroU32::new(limit).unwrap())
    }

    #[test]
    fn duplicate_rejected() {
        let mut es = store(8);
        let c = conn(4000);
        let slot = es.add(c).unwrap();
        assert!(es.find_duplicate(&c.key()));

        // Same 5-tuple, different translation: still a duplicate.
        let mut c2 = c;
        c2.public_port = 9;
        assert_eq!(es.add(c2), Err(NatError::Duplicate(c.key())));
        assert_eq!(es.len(), 1);
        assert_eq!(es.get(slot).unwrap().conn.public_port, c.public_port);
    }

    #[test]
    fn malformed_rejected() {
        let mut es = store(8);
        let mut c = conn(4000);
        c.private_ip = Ipv4Addr::ANY_ADDR;
        assert_eq!(es.add(c), Err(NatError::MalformedCandidate));
        assert!(es.is_empty());
    }

    #[test]
    fn full_then_reuse_lowest_slot() {
        let mut es = store(2);
        let s0 = es.add(conn(1)).unwrap();
        let s1 = es.add(conn(2)).unwrap();
        assert_eq!((s0.index(), s1.index()), (0, 1));
        assert!(es.is_full());
        assert_eq!(es.add(conn(3)), Err(NatError::CacheFull(2)));
        assert!(es.find(&conn(1).key()).is_some());
        assert!(es.find(&conn(2).key()).is_some());
        assert!(es.find(&conn(3).key()).is_none());

        assert!(es.remove(&conn(1).key()).is_some());
        assert!(es.remove(&conn(1).key()).is_none());
        let s2 = es.add(conn(3)).unwrap();
        assert_eq!(s2, s0);
    }

    #[test]
    fn visit_evicts() {
        let mut es = store(8);
        for p in 1..=4 {
            es.add(conn(p)).unwrap();
        }
        let s = es.find(&conn(2).key()).unwrap();
        es.get_mut(s).unwrap().enable(RuleHdl(7));

        let mut seen = vec![];
        let n = es.for_each_enabled(|slot, _| {
            seen.push(slot);
            Visit::Keep
        });
        assert_eq!(n, 1);
        assert_eq!(seen, vec![s]);

        let ip = "10.0.0.5".parse().unwrap();
        let n = es.for_each_matching_private_ip(ip, |_, e| {
            if e.conn.private_port % 2 == 0 { Visit::Evict } else { Visit::Keep }
        });
        assert_eq!(n, 4);
        assert_eq!(es.len(), 2);

        let other = "93.1.1.2".parse().unwrap();
        assert_eq!(es.for_each_matching_target_ip(other, |_, _| Visit::Evict), 0);
        assert_eq!(es.len(), 2);
    }

    #[test]
    fn disable_drops_mirror() {
        let mut es = store(1);
        let s = es.add(conn(1)).unwrap();
        let e = es.get_mut(s).unwrap();
        e.enable(RuleHdl(3));
        e.set_mirror(Some(MirrorRuleId(NonZeroU32::new(9).unwrap())));
        assert_eq!(e.disable(), Some(RuleHdl(3)));
        assert!(!e.enabled());
        assert!(e.mirror().is_none());
        assert_eq!(e.conn, conn(1));
    }

    // Random add/remove sequences never produce two entries with the
    // same 5-tuple, and the count always matches the occupied slots.
    #[test]
    fn dedup_invariant_random_ops() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut es = store(16);

        for _ in 0..5_000 {
            let c = conn(rng.random_range(1..=24));
            if rng.random_bool(0.6) {
                let was_present = es.find_duplicate(&c.key());
                let was_full = es.is_full();
                match es.add(c) {
                    Ok(slot) => {
                        assert!(!was_present && !was_full);
                        assert_eq!(es.find(&c.key()), Some(slot));
                    }
                    Err(NatError::Duplicate(_)) => assert!(was_present),
                    Err(NatError::CacheFull(_)) => {
                        assert!(was_full && !was_present)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            } else {
                es.remove(&c.key());
                assert!(!es.find_duplicate(&c.key()));
            }

            let keys: BTreeSet<_> = es.iter().map(|(_, e)| e.key()).collect();
            assert_eq!(keys.len(), es.len());
        }
    }
}
