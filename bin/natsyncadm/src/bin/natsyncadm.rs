// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use std::io;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use tabwriter::TabWriter;

use natsync::engine::config::NatCfg;
use natsync::engine::conntrack::ProcfsTimeouts;
use natsync::engine::conntrack::TimeoutSource;
use natsync::print::print_cache_into;
use natsync::print::print_stats_into;
use natsync::print::print_timeouts_into;
use natsync::print::write_hr;
use natsyncadm::Replay;
use natsyncadm::ReplayOpts;
use natsyncadm::ReplayReport;
use natsyncadm::StepResult;
use natsyncadm::UpdaterKind;

/// Administer the NAT cache synchronization engine
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Parse and validate a config file.
    CheckConfig { cfg: PathBuf },

    /// Show the connection tracker's idle timeouts.
    Timeouts {
        /// Read procfs under this directory instead of `/`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Replay a RON script of notifications against the simulated
    /// driver and show the resulting cache.
    Replay {
        cfg: PathBuf,
        script: PathBuf,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,

        /// Where timeout updates go.
        #[arg(long, value_enum, default_value_t = Updater::Sim)]
        updater: Updater,

        /// Run as if there were no companion modem.
        #[arg(long)]
        no_mirror: bool,

        /// Also print the cache counters.
        #[arg(short)]
        stats: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Updater {
    Sim,
    Framework,
    Conntrack,
}

impl From<Updater> for UpdaterKind {
    fn from(u: Updater) -> Self {
        match u {
            Updater::Sim => Self::Sim,
            Updater::Framework => Self::Framework,
            Updater::Conntrack => Self::Tool,
        }
    }
}

fn print_cfg(cfg: &NatCfg) -> io::Result<()> {
    let mut t = TabWriter::new(io::stdout());
    writeln!(t, "max_entries\t{}", cfg.max_entries)?;
    writeln!(t, "mem_type\t{}", cfg.mem_type)?;
    writeln!(t, "timestamp_sync_secs\t{}", cfg.timestamp_sync_secs)?;
    writeln!(t, "timeouts\t{:?}", cfg.timeouts)?;
    writeln!(t, "alg_ports\t{}", cfg.alg_ports.len())?;
    for p in &cfg.alg_ports {
        writeln!(t, "\t{}/{}", p.proto, p.port)?;
    }
    t.flush()
}

fn print_report(report: &ReplayReport, stats: bool) -> io::Result<()> {
    let mut t = TabWriter::new(io::stdout());
    writeln!(t, "STEP\tRESULT")?;
    write_hr(&mut t)?;
    for (step, res) in &report.steps {
        let res = match res {
            StepResult::Applied(out) => format!("{out:?}"),
            StepResult::Failed { err, errno } => {
                format!("error: {err} (errno {errno})")
            }
            StepResult::Sim => "-".to_string(),
            StepResult::NoRule => "no such rule".to_string(),
        };
        writeln!(t, "{step:?}\t{res}")?;
    }
    t.flush()?;

    if !report.forwarded.is_empty() {
        writeln!(t, "\nForwarded timeout updates")?;
        write_hr(&mut t)?;
        writeln!(t, "TUPLE\tTIMEOUT")?;
        for up in &report.forwarded {
            writeln!(t, "{}\t{}", up.tuple, up.timeout)?;
        }
        t.flush()?;
    }

    let mut out = io::stdout();
    writeln!(out)?;
    print_cache_into(&mut out, &report.cache)?;
    if stats {
        print_stats_into(&mut out, &report.cache)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::CheckConfig { cfg } => {
            let cfg = NatCfg::load(&cfg)?;
            print_cfg(&cfg)?;
        }

        Command::Timeouts { root } => {
            let src = match root {
                Some(root) => ProcfsTimeouts::with_root(root),
                None => ProcfsTimeouts::new(),
            };
            print_timeouts_into(&mut io::stdout(), &src.idle_timeouts()?)?;
        }

        Command::Replay { cfg, script, json, updater, no_mirror, stats } => {
            let log = natsyncadm::logger();
            let cfg = NatCfg::load(&cfg)?;
            let script = natsyncadm::load_script(&script)?;
            let opts = ReplayOpts { updater: updater.into(), no_mirror };
            let report = Replay::new(&cfg, opts, &log)?.run(script);

            if json {
                serde_json::to_writer_pretty(io::stdout(), &report)?;
                println!();
            } else {
                print_report(&report, stats)?;
            }
        }
    }

    Ok(())
}
