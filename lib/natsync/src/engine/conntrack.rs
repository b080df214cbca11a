// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The connection tracker side of idle timer reconciliation.
//!
//! There are two things we need from the tracker: its idle timeout
//! thresholds, and a way to push a fresh timeout for a flow which the
//! hardware says is still alive. Where these come from depends on the
//! platform. A plain Linux host exposes the thresholds in procfs and
//! accepts updates through the `conntrack(8)` tool, while a managed
//! platform hands both to a framework service which is fixed at the
//! framework defaults and consumes updates over a channel.

use super::device::DriverResult;
use crate::api::CtTuple;
use crate::api::DriverError;
use crate::api::DriverOp;
use crate::api::Protocol;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc;

pub const UDP_TIMEOUT_PATH: &str =
    "proc/sys/net/netfilter/nf_conntrack_udp_timeout_stream";
pub const TCP_TIMEOUT_PATH: &str =
    "proc/sys/net/netfilter/nf_conntrack_tcp_timeout_established";

/// The tracker's idle timeout thresholds, in seconds.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdleTimeouts {
    pub tcp: u32,
    pub udp: u32,
}

impl IdleTimeouts {
    /// The thresholds used by the managed framework, which does not
    /// expose its own.
    pub const FRAMEWORK_DEFAULT: Self = Self { tcp: 432_000, udp: 120 };

    /// The threshold to apply to a flow of protocol `proto`. Anything
    /// that isn't UDP gets the TCP threshold.
    pub fn for_proto(&self, proto: Protocol) -> u32 {
        match proto {
            Protocol::UDP => self.udp,
            _ => self.tcp,
        }
    }
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self::FRAMEWORK_DEFAULT
    }
}

/// A source of the tracker's idle timeout thresholds.
pub trait TimeoutSource: Send + Sync {
    fn idle_timeouts(&self) -> DriverResult<IdleTimeouts>;
}

/// A sink for idle timeout updates.
pub trait ConntrackUpdater: Send + Sync {
    /// Set the idle timeout of the flow identified by `tuple` to
    /// `timeout` seconds from now.
    fn update_idle_timeout(
        &self,
        tuple: &CtTuple,
        timeout: u32,
    ) -> DriverResult<()>;
}

fn io_err(op: DriverOp, e: &io::Error) -> DriverError {
    DriverError::new(op, e.raw_os_error().unwrap_or(libc::EIO))
}

/// Read the thresholds from procfs.
#[derive(Clone, Debug)]
pub struct ProcfsTimeouts {
    root: PathBuf,
}

impl ProcfsTimeouts {
    /// Read from the host's procfs.
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Read from the procfs tree rooted at `root`. This is mostly
    /// useful for pointing at a fake tree in tests.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn read_one(&self, rel: &str) -> DriverResult<u32> {
        let path = self.root.join(rel);
        let raw = fs::read_to_string(&path)
            .map_err(|e| io_err(DriverOp::ReadTimeouts, &e))?;
        raw.trim()
            .parse()
            .map_err(|_| DriverError::new(DriverOp::ReadTimeouts, libc::EINVAL))
    }
}

impl Default for ProcfsTimeouts {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutSource for ProcfsTimeouts {
    fn idle_timeouts(&self) -> DriverResult<IdleTimeouts> {
        let udp = self.read_one(UDP_TIMEOUT_PATH)?;
        let tcp = self.read_one(TCP_TIMEOUT_PATH)?;
        Ok(IdleTimeouts { tcp, udp })
    }
}

/// Thresholds fixed at construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedTimeouts(pub IdleTimeouts);

impl TimeoutSource for FixedTimeouts {
    fn idle_timeouts(&self) -> DriverResult<IdleTimeouts> {
        Ok(self.0)
    }
}

/// A single timeout update handed to the framework.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimeoutUpdate {
    pub tuple: CtTuple,
    pub timeout: u32,
}

/// Forward timeout updates to the managed framework over a channel.
///
/// An update fails only when the framework end of the channel has
/// gone away.
#[derive(Debug)]
pub struct FrameworkUpdater {
    tx: mpsc::Sender<TimeoutUpdate>,
}

impl FrameworkUpdater {
    pub fn new() -> (Self, mpsc::Receiver<TimeoutUpdate>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl ConntrackUpdater for FrameworkUpdater {
    fn update_idle_timeout(
        &self,
        tuple: &CtTuple,
        timeout: u32,
    ) -> DriverResult<()> {
        self.tx
            .send(TimeoutUpdate { tuple: *tuple, timeout })
            .map_err(|_| DriverError::new(DriverOp::UpdateTimeout, libc::EPIPE))
    }
}

/// Update timeouts in the local kernel by way of `conntrack(8)`.
#[derive(Clone, Debug)]
pub struct ConntrackTool {
    bin: PathBuf,
}

impl ConntrackTool {
    pub fn new() -> Self {
        Self::with_bin("conntrack")
    }

    pub fn with_bin<P: AsRef<Path>>(bin: P) -> Self {
        Self { bin: bin.as_ref().to_path_buf() }
    }

    /// The arguments passed to the tool to update `tuple`.
    pub fn args(tuple: &CtTuple, timeout: u32) -> Vec<String> {
        vec![
            "-U".to_string(),
            "-p".to_string(),
            u8::from(tuple.proto).to_string(),
            "-s".to_string(),
            tuple.src_ip.to_string(),
            "-d".to_string(),
            tuple.dst_ip.to_string(),
            "--sport".to_string(),
            tuple.src_port.to_string(),
            "--dport".to_string(),
            tuple.dst_port.to_string(),
            "--timeout".to_string(),
            timeout.to_string(),
        ]
    }
}

impl Default for ConntrackTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConntrackUpdater for ConntrackTool {
    fn update_idle_timeout(
        &self,
        tuple: &CtTuple,
        timeout: u32,
    ) -> DriverResult<()> {
        let out = Command::new(&self.bin)
            .args(Self::args(tuple, timeout))
            .output()
            .map_err(|e| io_err(DriverOp::UpdateTimeout, &e))?;

        // The tool exits non-zero when no flow matched the tuple,
        // which for us means the tracker already forgot about it.
        if !out.status.success() {
            return Err(DriverError::new(DriverOp::UpdateTimeout, libc::ENOENT));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;

    fn tuple() -> CtTuple {
        CtTuple {
            src_ip: "10.0.0.5".parse().unwrap(),
            src_port: 4000,
            dst_ip: "93.1.1.1".parse().unwrap(),
            dst_port: 53,
            proto: Protocol::UDP,
        }
    }

    fn scratch_root(tag: &str) -> PathBuf {
        let nanos =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!(
            "natsync-{tag}-{}-{nanos}",
            std::process::id()
        ))
    }

    #[test]
    fn procfs_reads_both() {
        let root = scratch_root("procfs");
        let dir = root.join("proc/sys/net/netfilter");
        fs::create_dir_all(&dir).unwrap();
        fs::write(root.join(UDP_TIMEOUT_PATH), "180\n").unwrap();
        fs::write(root.join(TCP_TIMEOUT_PATH), "7440\n").unwrap();

        let src = ProcfsTimeouts::with_root(&root);
        let to = src.idle_timeouts().unwrap();
        assert_eq!(to, IdleTimeouts { tcp: 7440, udp: 180 });
        assert_eq!(to.for_proto(Protocol::UDP), 180);
        assert_eq!(to.for_proto(Protocol::TCP), 7440);

        fs::write(root.join(TCP_TIMEOUT_PATH), "soon").unwrap();
        let err = src.idle_timeouts().unwrap_err();
        assert_eq!(err, DriverError::new(DriverOp::ReadTimeouts, libc::EINVAL));

        fs::remove_dir_all(&root).unwrap();
        let err = src.idle_timeouts().unwrap_err();
        assert_eq!(err.op, DriverOp::ReadTimeouts);
    }

    #[test]
    fn framework_defaults() {
        let src = FixedTimeouts::default();
        assert_eq!(
            src.idle_timeouts().unwrap(),
            IdleTimeouts { tcp: 432_000, udp: 120 }
        );
    }

    #[test]
    fn framework_updater_channel() {
        let (up, rx) = FrameworkUpdater::new();
        up.update_idle_timeout(&tuple(), 120).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TimeoutUpdate { tuple: tuple(), timeout: 120 }
        );

        drop(rx);
        let err = up.update_idle_timeout(&tuple(), 120).unwrap_err();
        assert_eq!(err.op, DriverOp::UpdateTimeout);
    }

    #[test]
    fn conntrack_tool_args() {
        let args = ConntrackTool::args(&tuple(), 120);
        assert_eq!(
            args.join(" "),
            "-U -p 17 -s 10.0.0.5 -d 93.1.1.1 --sport 4000 --dport 53 \
             --timeout 120"
        );
    }

    #[test]
    fn conntrack_tool_missing_bin() {
        let tool = ConntrackTool::with_bin("/nonexistent/conntrack");
        let err = tool.update_idle_timeout(&tuple(), 120).unwrap_err();
        assert_eq!(err, DriverError::new(DriverOp::UpdateTimeout, libc::ENOENT));
    }
}
