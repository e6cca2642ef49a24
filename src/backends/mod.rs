// Rule executor trait and implementations

use anyhow::Result;

pub mod dry_run;
pub mod linux_tc_utils;

#[cfg(test)]
pub mod kernel_model;

pub use linux_tc_utils::{MacMatch, TcCommand};

/// Programs kernel shaping state, one command at a time
///
/// Implementations are synchronous: `execute` returns once the kernel has
/// accepted or rejected the command. Whether a failure matters is decided
/// by the caller, not the executor.
pub trait RuleExecutor: Send {
    /// Executor name (e.g., "tc", "dry_run")
    fn name(&self) -> &'static str;

    /// Run a single shaping command
    fn execute(&mut self, cmd: &TcCommand) -> Result<()>;
}

impl<E: RuleExecutor + ?Sized> RuleExecutor for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn execute(&mut self, cmd: &TcCommand) -> Result<()> {
        (**self).execute(cmd)
    }
}

/// Select the executor for this run
pub fn create_executor(dry_run: bool) -> Box<dyn RuleExecutor> {
    if dry_run {
        log::info!("Using dry-run executor, no kernel state will be changed");
        Box::new(dry_run::DryRunExecutor::default())
    } else {
        if !linux_tc_utils::check_tc_available() {
            log::warn!("'tc' does not appear to be runnable, shaping requests will fail");
        }
        if !linux_tc_utils::check_ifb_available() {
            log::warn!("IFB kernel module not found, ingress shaping will fail");
        }
        Box::new(linux_tc_utils::TcExecutor)
    }
}
