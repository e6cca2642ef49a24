// Dry-run executor: logs commands instead of running them

use super::{RuleExecutor, TcCommand};
use anyhow::Result;

/// Accepts every command and only logs it
///
/// Useful for checking what the daemon would program on a host without
/// touching its qdiscs.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    executed: u64,
}

impl DryRunExecutor {
    #[cfg(test)]
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl RuleExecutor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    fn execute(&mut self, cmd: &TcCommand) -> Result<()> {
        self.executed += 1;
        log::info!("[dry-run #{}] {}", self.executed, cmd);
        Ok(())
    }
}
