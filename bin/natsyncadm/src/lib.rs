// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! natsync administration library
//!
//! There is no control node to talk to: the engine lives inside the
//! interface manager. What the operator gets instead is a way to
//! validate configs, inspect the tracker's thresholds, and replay a
//! scripted sequence of notifications against the simulated driver
//! stack to see what the cache would do with them.

use natsync::api::ConnKey;
use natsync::api::DriverOp;
use natsync::api::DumpCacheResp;
use natsync::api::NatError;
use natsync::engine::cache::NatCache;
use natsync::engine::config::CfgError;
use natsync::engine::config::NatCfg;
use natsync::engine::conntrack::ConntrackTool;
use natsync::engine::conntrack::ConntrackUpdater;
use natsync::engine::conntrack::FrameworkUpdater;
use natsync::engine::conntrack::TimeoutUpdate;
use natsync::engine::device::MirrorControl;
use natsync::engine::device::NoMirror;
use natsync::engine::dispatch::EventOutcome;
use natsync::engine::dispatch::NatEvent;
use natsync::engine::dispatch::NatSync;
use natsync::engine::sim::SimStack;
use natsync::provider::Providers;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {}: {err}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to parse script: {0}")]
    Script(#[from] ron::error::SpannedError),

    #[error(transparent)]
    Cfg(#[from] CfgError),
}

/// Build the logger used by the binary.
///
/// Output goes to stderr and is filtered by `RUST_LOG`, so that it
/// never mixes with what the commands print.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("unit" => "natsyncadm"))
}

/// A single step of a replay script.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Step {
    /// Deliver a notification to the cache.
    Event(NatEvent),
    /// Pretend the hardware saw traffic for a flow.
    Traffic { key: ConnKey, idle: u32 },
    /// Make every following call to `op` fail.
    Fail(DriverOp),
    Heal(DriverOp),
}

/// Where timeout updates go during a replay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UpdaterKind {
    /// Keep them in the simulated tracker.
    #[default]
    Sim,
    /// Hand them to a framework channel and report them.
    Framework,
    /// Push them into the local kernel with `conntrack(8)`.
    Tool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayOpts {
    pub updater: UpdaterKind,
    /// Run without a companion modem filter service.
    pub no_mirror: bool,
}

/// The result of a single step.
#[derive(Clone, Debug, Serialize)]
pub enum StepResult {
    Applied(EventOutcome),
    Failed { err: NatError, errno: i32 },
    /// The step only changed the simulation.
    Sim,
    /// `Traffic` named a flow with no hardware rule.
    NoRule,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<(Step, StepResult)>,
    pub forwarded: Vec<TimeoutUpdate>,
    pub cache: DumpCacheResp,
}

/// A cache wired to the simulated driver stack.
pub struct Replay {
    sim: SimStack,
    sync: NatSync,
    forwarded: Option<mpsc::Receiver<TimeoutUpdate>>,
}

impl Replay {
    pub fn new(
        cfg: &NatCfg,
        opts: ReplayOpts,
        log: &Logger,
    ) -> Result<Self, Error> {
        let sim = SimStack::new();
        let mut providers = sim.providers(log.clone());
        // The config decides where the thresholds come from.
        providers.ct_timeouts = cfg.timeouts.source();

        let mut forwarded = None;
        let updater: Arc<dyn ConntrackUpdater> = match opts.updater {
            UpdaterKind::Sim => sim.ct.clone(),
            UpdaterKind::Framework => {
                let (fw, rx) = FrameworkUpdater::new();
                forwarded = Some(rx);
                Arc::new(fw)
            }
            UpdaterKind::Tool => Arc::new(ConntrackTool::new()),
        };
        providers.ct_updater = updater;

        if opts.no_mirror {
            let mirror: Arc<dyn MirrorControl> = Arc::new(NoMirror);
            providers.mirror = mirror;
        }

        Self::with_providers(cfg, providers, sim, forwarded)
            .map_err(Error::from)
    }

    fn with_providers(
        cfg: &NatCfg,
        providers: Providers,
        sim: SimStack,
        forwarded: Option<mpsc::Receiver<TimeoutUpdate>>,
    ) -> Result<Self, CfgError> {
        let log = providers.log.clone();
        let cache = NatCache::new(cfg, providers)?;
        Ok(Self { sim, sync: NatSync::new(cache, &log), forwarded })
    }

    pub fn step(&self, step: &Step) -> StepResult {
        match step {
            Step::Event(ev) => match self.sync.handle(ev.clone()) {
                Ok(out) => StepResult::Applied(out),
                Err(err) => {
                    let errno = err.to_errno();
                    StepResult::Failed { err, errno }
                }
            },

            Step::Traffic { key, idle } => {
                if self.sim.device.set_idle(key, *idle) {
                    StepResult::Sim
                } else {
                    StepResult::NoRule
                }
            }

            Step::Fail(op) => {
                self.fail(*op);
                StepResult::Sim
            }

            Step::Heal(op) => {
                self.heal(*op);
                StepResult::Sim
            }
        }
    }

    /// Run every step of `script` and report what happened.
    pub fn run(self, script: Vec<Step>) -> ReplayReport {
        let steps = script
            .into_iter()
            .map(|s| {
                let res = self.step(&s);
                (s, res)
            })
            .collect();

        let forwarded = match &self.forwarded {
            Some(rx) => rx.try_iter().collect(),
            None => vec![],
        };

        ReplayReport {
            steps,
            forwarded,
            cache: self.sync.with_cache(|c| c.dump()),
        }
    }

    fn fail(&self, op: DriverOp) {
        match op {
            DriverOp::InstallMirror | DriverOp::RemoveMirror => {
                self.sim.mirror.fail(op)
            }
            DriverOp::UpdateTimeout | DriverOp::ReadTimeouts => {
                self.sim.ct.fail(op)
            }
            _ => self.sim.device.fail(op),
        }
    }

    fn heal(&self, op: DriverOp) {
        match op {
            DriverOp::InstallMirror | DriverOp::RemoveMirror => {
                self.sim.mirror.heal(op)
            }
            DriverOp::UpdateTimeout | DriverOp::ReadTimeouts => {
                self.sim.ct.heal(op)
            }
            _ => self.sim.device.heal(op),
        }
    }
}

/// Parse a RON replay script.
pub fn parse_script(s: &str) -> Result<Vec<Step>, Error> {
    Ok(ron::from_str(s)?)
}

pub fn load_script<P: AsRef<Path>>(path: P) -> Result<Vec<Step>, Error> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|err| Error::Read { path: path.to_path_buf(), err })?;
    parse_script(&raw)
}
