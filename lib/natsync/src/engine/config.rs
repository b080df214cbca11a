// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Cache configuration.
//!
//! ```toml
//! max_entries = 500
//! mem_type = "HYBRID"
//! timestamp_sync_secs = 30
//! alg_ports = [
//!     { proto = "tcp", port = 21 },
//!     { proto = "udp", port = 5060 },
//! ]
//!
//! [timeouts]
//! source = "fixed"
//! tcp = 432000
//! udp = 120
//! ```

use super::conntrack::FixedTimeouts;
use super::conntrack::IdleTimeouts;
use super::conntrack::ProcfsTimeouts;
use super::conntrack::TimeoutSource;
use super::policy::AlgPort;
use super::policy::AlgPorts;
use crate::api::MemPlacement;
use core::num::NonZeroU32;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_SYNC_SECS: u64 = 30;

fn default_sync_secs() -> u64 {
    DEFAULT_SYNC_SECS
}

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("failed to read {}: {err}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("max_entries must be non-zero")]
    ZeroEntries,

    #[error("timestamp_sync_secs must be non-zero")]
    ZeroSyncPeriod,

    #[error("alg_ports[{0}] has port zero")]
    ZeroAlgPort(usize),

    #[error("fixed {0} timeout must be non-zero")]
    ZeroTimeout(&'static str),
}

/// Where the connection tracker's idle thresholds come from.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TimeoutCfg {
    /// Read them from procfs, optionally rooted somewhere other than
    /// `/`.
    Procfs {
        #[serde(default)]
        root: Option<PathBuf>,
    },

    Fixed { tcp: u32, udp: u32 },
}

impl Default for TimeoutCfg {
    fn default() -> Self {
        Self::Procfs { root: None }
    }
}

impl TimeoutCfg {
    pub fn source(&self) -> Arc<dyn TimeoutSource> {
        match self {
            Self::Procfs { root: Some(root) } => {
                Arc::new(ProcfsTimeouts::with_root(root))
            }
            Self::Procfs { root: None } => Arc::new(ProcfsTimeouts::new()),
            Self::Fixed { tcp, udp } => {
                Arc::new(FixedTimeouts(IdleTimeouts { tcp: *tcp, udp: *udp }))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NatCfg {
    /// The capacity of both the entry store and the hardware table.
    pub max_entries: u32,

    #[serde(default)]
    pub mem_type: MemPlacement,

    #[serde(default)]
    pub alg_ports: Vec<AlgPort>,

    #[serde(default = "default_sync_secs")]
    pub timestamp_sync_secs: u64,

    #[serde(default)]
    pub timeouts: TimeoutCfg,
}

impl NatCfg {
    /// Parse and validate a config.
    pub fn from_toml(s: &str) -> Result<Self, CfgError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load, parse and validate the config at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CfgError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| CfgError::Read { path: path.to_path_buf(), err })?;
        Self::from_toml(&raw)
    }

    pub fn alg(&self) -> AlgPorts {
        AlgPorts::new(self.alg_ports.clone())
    }

    pub fn limit(&self) -> Result<NonZeroU32, CfgError> {
        NonZeroU32::new(self.max_entries).ok_or(CfgError::ZeroEntries)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.timestamp_sync_secs)
    }

    pub fn validate(&self) -> Result<(), CfgError> {
        self.limit()?;

        if self.timestamp_sync_secs == 0 {
            return Err(CfgError::ZeroSyncPeriod);
        }

        if let Some(idx) = self.alg_ports.iter().position(|p| p.port == 0) {
            return Err(CfgError::ZeroAlgPort(idx));
        }

        if let TimeoutCfg::Fixed { tcp, udp } = self.timeouts {
            if tcp == 0 {
                return Err(CfgError::ZeroTimeout("tcp"));
            }
            if udp == 0 {
                return Err(CfgError::ZeroTimeout("udp"));
            }
        }

        Ok(())
    }
}
