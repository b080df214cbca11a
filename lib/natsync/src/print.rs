// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print cache dumps in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both natsyncadm and integration tests.

use crate::api::CacheEntryDump;
use crate::api::DumpCacheResp;
use crate::api::NatConn;
use crate::engine::conntrack::IdleTimeouts;
use itertools::Itertools;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpCacheResp`].
pub fn print_cache(resp: &DumpCacheResp) -> std::io::Result<()> {
    print_cache_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpCacheResp`] into a given writer.
pub fn print_cache_into(
    writer: &mut impl Write,
    resp: &DumpCacheResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    match &resp.table {
        Some(tbl) => writeln!(
            t,
            "Table {} public IP {} mux {} ({})",
            tbl.hdl, tbl.public_ip, tbl.mux_id, resp.backhaul,
        )?,
        None => match resp.prev_public_ip {
            Some(prev) => writeln!(t, "No table (previous public IP {prev})")?,
            None => writeln!(t, "No table")?,
        },
    }
    write_hrb(&mut t)?;

    writeln!(t, "NAT Cache: {}/{}", resp.entries.len(), resp.limit)?;
    write_hr(&mut t)?;
    print_entry_header(&mut t)?;
    for (slot, entry) in &resp.entries {
        print_entry(&mut t, *slot, entry)?;
    }
    t.flush()?;

    writeln!(t, "\nStaged: {}", resp.staged.len())?;
    write_hr(&mut t)?;
    print_staged_header(&mut t)?;
    for conn in &resp.staged {
        print_staged(&mut t, conn)?;
    }
    t.flush()?;

    if !resp.power_save.is_empty() {
        writeln!(t, "\nPower-save: {}", resp.power_save.iter().join(", "))?;
    }

    writeln!(t)?;
    t.flush()
}

/// Print the counters of a [`DumpCacheResp`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    resp: &DumpCacheResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "STAT\tVALUE")?;
    for (name, val) in &resp.stats {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print [`IdleTimeouts`] into a given writer.
pub fn print_timeouts_into(
    writer: &mut impl Write,
    to: &IdleTimeouts,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "PROTO\tIDLE TIMEOUT (s)")?;
    writeln!(t, "TCP\t{}", to.tcp)?;
    writeln!(t, "UDP\t{}", to.udp)?;
    t.flush()
}

fn print_entry_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(
        t,
        "SLOT\tPROTO\tPRIVATE\tTARGET\tPUBLIC\tDNAT\tENABLED\tRULE\tMIRROR\tTS"
    )
}

fn print_entry(
    t: &mut impl Write,
    slot: u32,
    entry: &CacheEntryDump,
) -> std::io::Result<()> {
    let c = &entry.conn;
    let rule = entry.rule.map(|r| r.to_string());
    let mirror = entry.mirror.map(|m| m.to_string());
    writeln!(
        t,
        "{}\t{}\t{}:{}\t{}:{}\t{}:{}\t{}\t{}\t{}\t{}\t{}",
        slot,
        c.proto,
        c.private_ip,
        c.private_port,
        c.target_ip,
        c.target_port,
        c.public_ip,
        c.public_port,
        c.dst_nat,
        entry.enabled,
        rule.as_deref().unwrap_or("-"),
        mirror.as_deref().unwrap_or("-"),
        entry.timestamp,
    )
}

fn print_staged_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "PROTO\tPRIVATE\tTARGET\tPUBLIC\tDNAT")
}

fn print_staged(t: &mut impl Write, c: &NatConn) -> std::io::Result<()> {
    writeln!(
        t,
        "{}\t{}:{}\t{}:{}\t{}:{}\t{}",
        c.proto,
        c.private_ip,
        c.private_port,
        c.target_ip,
        c.target_port,
        c.public_ip,
        c.public_port,
        c.dst_nat,
    )
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::engine::cache::NatCache;
    use crate::engine::config::NatCfg;
    use crate::engine::sim::SimStack;
    use slog::Logger;

    #[test]
    fn cache_table_renders() {
        let sim = SimStack::new();
        let cfg = NatCfg::from_toml("max_entries = 4").unwrap();
        let log = Logger::root(slog::Discard, slog::o!());
        let mut cache = NatCache::new(&cfg, sim.providers(log)).unwrap();
        let public_ip = "52.10.128.69".parse().unwrap();
        cache.create_table(public_ip, 2).unwrap();
        cache
            .on_new_connection(NatConn {
                private_ip: "10.0.0.5".parse().unwrap(),
                private_port: 4000,
                target_ip: "93.1.1.1".parse().unwrap(),
                target_port: 80,
                public_ip,
                public_port: 31000,
                proto: Protocol::TCP,
                dst_nat: false,
            })
            .unwrap();

        let mut out = Vec::new();
        print_cache_into(&mut out, &cache.dump()).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("public IP 52.10.128.69 mux 2"));
        assert!(out.contains("NAT Cache: 1/4"));
        assert!(out.contains("10.0.0.5:4000"));
        assert!(out.contains("52.10.128.69:31000"));

        let mut out = Vec::new();
        print_stats_into(&mut out, &cache.dump()).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.lines().any(|l| l.starts_with("added") && l.ends_with('1')));
    }
}
