// Shared utilities for Linux TC (traffic control) and IFB operations

use super::RuleExecutor;
use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::process::Command;

/// Handle major of the root HTB qdisc on every shaped device
pub const ROOT_HANDLE: u16 = 1;

/// Handle of the ingress qdisc used for the mirred redirect
pub const INGRESS_HANDLE: &str = "ffff:";

/// Prefix of the IFB mirror device derived from an interface name
pub const MIRROR_PREFIX: &str = "rl-";

/// fq_codel parameters for every leaf class (latency over throughput)
pub const FQ_CODEL_FLOWS: u32 = 128;
pub const FQ_CODEL_LIMIT: u32 = 800;
pub const FQ_CODEL_QUANTUM: u32 = 300;

/// Which address of a frame a classifier matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacMatch {
    Source,
    Destination,
}

impl MacMatch {
    fn keyword(self) -> &'static str {
        match self {
            MacMatch::Source => "src",
            MacMatch::Destination => "dst",
        }
    }
}

/// One `tc` or `ip` invocation
///
/// Class minors are plain numbers here and rendered in hex, the way tc
/// parses handles. Filter priorities are decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcCommand {
    /// `ip link add <dev> type ifb`
    AddIfb { dev: String },
    /// `ip link set dev <dev> up`
    LinkUp { dev: String },
    /// `ip link del <dev>`
    DeleteLink { dev: String },
    /// `tc qdisc replace dev <dev> root handle 1: htb default <default_minor>`
    ReplaceRootQdisc { dev: String, default_minor: u16 },
    /// `tc qdisc del dev <dev> root`
    DeleteRootQdisc { dev: String },
    /// `tc qdisc replace dev <dev> handle ffff: ingress`
    ReplaceIngressQdisc { dev: String },
    /// `tc qdisc del dev <dev> handle ffff: ingress`
    DeleteIngressQdisc { dev: String },
    /// Redirect everything arriving on `dev` to egress of `target`
    AddRedirectFilter { dev: String, target: String },
    /// `tc class replace dev <dev> parent 1:<parent> classid 1:<minor> htb rate <rate> ceil <rate>`
    ReplaceClass {
        dev: String,
        parent: u16,
        minor: u16,
        rate: String,
    },
    /// `tc class del dev <dev> classid 1:<minor>`
    DeleteClass { dev: String, minor: u16 },
    /// fq_codel below class `1:<minor>`, with handle `<minor>:`
    ReplaceLeafQdisc { dev: String, minor: u16 },
    /// u32 filter sending frames with the given MAC to class `1:<minor>`
    AddMacFilter {
        dev: String,
        prio: u16,
        mac: String,
        matches: MacMatch,
        minor: u16,
    },
    /// `tc filter del dev <dev> parent 1: prio <prio>`
    DeleteFilter { dev: String, prio: u16 },
}

impl TcCommand {
    /// Device the command operates on
    pub fn dev(&self) -> &str {
        match self {
            TcCommand::AddIfb { dev }
            | TcCommand::LinkUp { dev }
            | TcCommand::DeleteLink { dev }
            | TcCommand::ReplaceRootQdisc { dev, .. }
            | TcCommand::DeleteRootQdisc { dev }
            | TcCommand::ReplaceIngressQdisc { dev }
            | TcCommand::DeleteIngressQdisc { dev }
            | TcCommand::AddRedirectFilter { dev, .. }
            | TcCommand::ReplaceClass { dev, .. }
            | TcCommand::DeleteClass { dev, .. }
            | TcCommand::ReplaceLeafQdisc { dev, .. }
            | TcCommand::AddMacFilter { dev, .. }
            | TcCommand::DeleteFilter { dev, .. } => dev,
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            TcCommand::AddIfb { .. } | TcCommand::LinkUp { .. } | TcCommand::DeleteLink { .. } => {
                "ip"
            }
            _ => "tc",
        }
    }

    pub fn args(&self) -> Vec<String> {
        let root = format!("{:x}:", ROOT_HANDLE);
        let class = |minor: u16| format!("{:x}:{:x}", ROOT_HANDLE, minor);

        match self {
            TcCommand::AddIfb { dev } => to_args(&["link", "add", dev.as_str(), "type", "ifb"]),
            TcCommand::LinkUp { dev } => to_args(&["link", "set", "dev", dev.as_str(), "up"]),
            TcCommand::DeleteLink { dev } => to_args(&["link", "del", dev.as_str()]),
            TcCommand::ReplaceRootQdisc { dev, default_minor } => vec![
                "qdisc".into(),
                "replace".into(),
                "dev".into(),
                dev.clone(),
                "root".into(),
                "handle".into(),
                root,
                "htb".into(),
                "default".into(),
                format!("{:x}", default_minor),
            ],
            TcCommand::DeleteRootQdisc { dev } => {
                to_args(&["qdisc", "del", "dev", dev.as_str(), "root"])
            }
            TcCommand::ReplaceIngressQdisc { dev } => to_args(&[
                "qdisc",
                "replace",
                "dev",
                dev.as_str(),
                "handle",
                INGRESS_HANDLE,
                "ingress",
            ]),
            TcCommand::DeleteIngressQdisc { dev } => to_args(&[
                "qdisc",
                "del",
                "dev",
                dev.as_str(),
                "handle",
                INGRESS_HANDLE,
                "ingress",
            ]),
            // Match everything, hand it to the mirror's egress path
            TcCommand::AddRedirectFilter { dev, target } => to_args(&[
                "filter",
                "add",
                "dev",
                dev.as_str(),
                "parent",
                INGRESS_HANDLE,
                "protocol",
                "all",
                "prio",
                "1",
                "u32",
                "match",
                "u32",
                "0",
                "0",
                "action",
                "mirred",
                "egress",
                "redirect",
                "dev",
                target.as_str(),
            ]),
            TcCommand::ReplaceClass {
                dev,
                parent,
                minor,
                rate,
            } => vec![
                "class".into(),
                "replace".into(),
                "dev".into(),
                dev.clone(),
                "parent".into(),
                if *parent == 0 { root } else { class(*parent) },
                "classid".into(),
                class(*minor),
                "htb".into(),
                "rate".into(),
                rate.clone(),
                "ceil".into(),
                rate.clone(), // Ceiling = no bursting above rate
            ],
            TcCommand::DeleteClass { dev, minor } => vec![
                "class".into(),
                "del".into(),
                "dev".into(),
                dev.clone(),
                "classid".into(),
                class(*minor),
            ],
            TcCommand::ReplaceLeafQdisc { dev, minor } => vec![
                "qdisc".into(),
                "replace".into(),
                "dev".into(),
                dev.clone(),
                "parent".into(),
                class(*minor),
                "handle".into(),
                format!("{:x}:", minor),
                "fq_codel".into(),
                "flows".into(),
                FQ_CODEL_FLOWS.to_string(),
                "limit".into(),
                FQ_CODEL_LIMIT.to_string(),
                "quantum".into(),
                FQ_CODEL_QUANTUM.to_string(),
                "noecn".into(),
            ],
            TcCommand::AddMacFilter {
                dev,
                prio,
                mac,
                matches,
                minor,
            } => vec![
                "filter".into(),
                "add".into(),
                "dev".into(),
                dev.clone(),
                "parent".into(),
                root,
                "protocol".into(),
                "all".into(),
                "prio".into(),
                prio.to_string(),
                "u32".into(),
                "match".into(),
                "ether".into(),
                matches.keyword().into(),
                mac.clone(),
                "flowid".into(),
                class(*minor),
            ],
            TcCommand::DeleteFilter { dev, prio } => vec![
                "filter".into(),
                "del".into(),
                "dev".into(),
                dev.clone(),
                "parent".into(),
                root,
                "prio".into(),
                prio.to_string(),
            ],
        }
    }
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl fmt::Display for TcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program(), self.args().join(" "))
    }
}

/// Name of the IFB device that carries `interface`'s ingress traffic
///
/// Deterministic, so a reinstall reuses the same mirror, and truncated to
/// fit the kernel's interface name limit.
pub fn mirror_name(interface: &str) -> String {
    let max_len = libc::IFNAMSIZ - 1;
    let mut name = format!("{}{}", MIRROR_PREFIX, interface);

    if name.len() > max_len {
        let mut cut = max_len;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }

    name
}

/// Check if TC (traffic control) is available
pub fn check_tc_available() -> bool {
    Command::new("tc").arg("qdisc").arg("show").output().is_ok()
}

/// Check if IFB module is available
pub fn check_ifb_available() -> bool {
    // Try to load the module first
    let _ = Command::new("modprobe")
        .arg("ifb")
        .arg("numifbs=0")
        .output();

    std::path::Path::new("/sys/module/ifb").exists()
}

/// Executor that runs the real `tc` and `ip` binaries
#[derive(Debug, Default)]
pub struct TcExecutor;

impl RuleExecutor for TcExecutor {
    fn name(&self) -> &'static str {
        "tc"
    }

    fn execute(&mut self, cmd: &TcCommand) -> Result<()> {
        let output = Command::new(cmd.program())
            .args(cmd.args())
            .output()
            .context(format!("Failed to execute {}", cmd.program()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "`{}` exited with {}: {}",
                cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(())
    }
}
