// Enforcement engine: turns registry state into tc commands

use crate::backends::{MacMatch, RuleExecutor, TcCommand};
use crate::rate::{Rate, Rates};
use crate::registry::{Client, Device};
use anyhow::{Context, Result, anyhow};

/// Class under which every client leaf hangs
pub const BASE_CLASS: u16 = 1;

/// Leaf that absorbs traffic no filter matched
pub const DEFAULT_CLASS: u16 = 2;

/// Class minors 0..3 belong to the qdisc, base and default classes
pub const CLIENT_CLASS_OFFSET: u16 = 3;

/// Largest usable client leaf minor; leaf qdisc handles reuse the minor and
/// must stay clear of `ffff:`
pub const MAX_CLIENT_MINOR: u16 = 0xfff0;

/// Rate of the base and default classes (effectively uncapped)
pub const LINK_RATE: &str = "10gbit";

/// Direction of traffic relative to the client
///
/// Egress is shaped on the interface itself and matched on destination
/// MAC; ingress is redirected to the IFB mirror and matched on source MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Egress,
    Ingress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Egress, Direction::Ingress];

    /// Device the leaf class and filter live on
    pub fn target(self, device: &Device) -> &str {
        match self {
            Direction::Egress => &device.name,
            Direction::Ingress => &device.mirror,
        }
    }

    pub fn mac_match(self) -> MacMatch {
        match self {
            Direction::Egress => MacMatch::Destination,
            Direction::Ingress => MacMatch::Source,
        }
    }

    pub fn rate(self, rates: &Rates) -> Option<&Rate> {
        match self {
            Direction::Egress => rates.egress.as_ref(),
            Direction::Ingress => rates.ingress.as_ref(),
        }
    }
}

/// Leaf class minor (and filter priority) for a client id
pub fn client_minor(id: usize) -> Result<u16> {
    u16::try_from(id)
        .ok()
        .and_then(|id| id.checked_add(CLIENT_CLASS_OFFSET))
        .filter(|minor| *minor <= MAX_CLIENT_MINOR)
        .ok_or_else(|| anyhow!("Client id {} exceeds the class id space", id))
}

/// Issues shaping commands through a rule executor
///
/// Calls are either strict (failure propagates) or lenient (failure is
/// logged and ignored). Teardown and pre-clean steps are lenient; install
/// and apply steps are strict.
#[derive(Debug)]
pub struct Engine<E> {
    executor: E,
}

impl<E: RuleExecutor> Engine<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    #[cfg(test)]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    #[cfg(test)]
    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn run_strict(&mut self, cmd: TcCommand) -> Result<()> {
        log::debug!("{}: {}", self.executor.name(), cmd);
        self.executor
            .execute(&cmd)
            .with_context(|| format!("Failed to run `{}`", cmd))
    }

    pub fn run_lenient(&mut self, cmd: TcCommand) {
        log::debug!("{}: {} (errors ignored)", self.executor.name(), cmd);
        if let Err(e) = self.executor.execute(&cmd) {
            log::debug!("Ignoring failure of `{}`: {:#}", cmd, e);
        }
    }

    /// (Re)build the shaping infrastructure of interface `name`
    ///
    /// Anything previously installed is torn down first. On failure the
    /// partial installation is torn down again and the error returned.
    pub fn install(&mut self, name: &str, mirror: &str) -> Result<()> {
        log::info!("Installing shaping hierarchy on {} (mirror {})", name, mirror);
        self.uninstall(name, mirror);

        if let Err(e) = self.install_steps(name, mirror) {
            log::warn!("Install on {} failed, rolling back: {:#}", name, e);
            self.uninstall(name, mirror);
            return Err(e.context(format!("Failed to install shaping on {}", name)));
        }

        log::info!("✅ Shaping hierarchy ready on {}", name);
        Ok(())
    }

    fn install_steps(&mut self, name: &str, mirror: &str) -> Result<()> {
        self.install_root_hierarchy(name)?;

        // Ingress can only be shaped as egress of the IFB mirror
        self.run_strict(TcCommand::AddIfb {
            dev: mirror.to_string(),
        })?;
        self.run_strict(TcCommand::LinkUp {
            dev: mirror.to_string(),
        })?;
        self.run_strict(TcCommand::ReplaceIngressQdisc {
            dev: name.to_string(),
        })?;
        self.run_strict(TcCommand::AddRedirectFilter {
            dev: name.to_string(),
            target: mirror.to_string(),
        })?;

        self.install_root_hierarchy(mirror)
    }

    fn install_root_hierarchy(&mut self, dev: &str) -> Result<()> {
        self.run_strict(TcCommand::ReplaceRootQdisc {
            dev: dev.to_string(),
            default_minor: DEFAULT_CLASS,
        })?;
        self.run_strict(TcCommand::ReplaceClass {
            dev: dev.to_string(),
            parent: 0,
            minor: BASE_CLASS,
            rate: LINK_RATE.to_string(),
        })?;
        self.run_strict(TcCommand::ReplaceClass {
            dev: dev.to_string(),
            parent: BASE_CLASS,
            minor: DEFAULT_CLASS,
            rate: LINK_RATE.to_string(),
        })?;
        self.run_strict(TcCommand::ReplaceLeafQdisc {
            dev: dev.to_string(),
            minor: DEFAULT_CLASS,
        })
    }

    /// Tear down everything installed for `name`; never fails
    pub fn uninstall(&mut self, name: &str, mirror: &str) {
        self.run_lenient(TcCommand::DeleteIngressQdisc {
            dev: name.to_string(),
        });
        self.run_lenient(TcCommand::DeleteLink {
            dev: mirror.to_string(),
        });
        self.run_lenient(TcCommand::DeleteRootQdisc {
            dev: name.to_string(),
        });
    }

    /// Enforce `client.rates` on `device`, replacing whatever was there
    ///
    /// Either every requested rule ends up installed, or none of the
    /// client's rules remain and an error is returned.
    pub fn apply(&mut self, device: &Device, client: &Client) -> Result<()> {
        let minor = client_minor(client.id)?;

        self.clear_client(device, minor);

        let result = Direction::ALL.into_iter().try_for_each(|dir| {
            match dir.rate(&client.rates) {
                Some(rate) => self.apply_direction(device, client, dir, minor, rate),
                None => Ok(()),
            }
        });

        if let Err(e) = result {
            log::warn!(
                "Applying {} for {} on {} failed, rolling back: {:#}",
                client.rates,
                client.address,
                device.name,
                e
            );
            self.clear_client(device, minor);
            return Err(e);
        }

        log::info!(
            "Applied {} for {} (id {}) on {}",
            client.rates,
            client.address,
            client.id,
            device.name
        );
        Ok(())
    }

    fn apply_direction(
        &mut self,
        device: &Device,
        client: &Client,
        dir: Direction,
        minor: u16,
        rate: &Rate,
    ) -> Result<()> {
        let dev = dir.target(device);

        self.run_strict(TcCommand::ReplaceClass {
            dev: dev.to_string(),
            parent: BASE_CLASS,
            minor,
            rate: rate.to_string(),
        })?;
        self.run_strict(TcCommand::ReplaceLeafQdisc {
            dev: dev.to_string(),
            minor,
        })?;
        self.run_strict(TcCommand::AddMacFilter {
            dev: dev.to_string(),
            prio: minor,
            mac: client.address.to_string(),
            matches: dir.mac_match(),
            minor,
        })
    }

    fn remove_direction(&mut self, device: &Device, dir: Direction, minor: u16) {
        let dev = dir.target(device);

        self.run_lenient(TcCommand::DeleteFilter {
            dev: dev.to_string(),
            prio: minor,
        });
        self.run_lenient(TcCommand::DeleteClass {
            dev: dev.to_string(),
            minor,
        });
    }

    /// Remove any rules for the client slot in both directions
    fn clear_client(&mut self, device: &Device, minor: u16) {
        for dir in Direction::ALL {
            self.remove_direction(device, dir, minor);
        }
    }

    /// Remove a client's rules for the directions it has rates for; never fails
    pub fn remove(&mut self, device: &Device, client: &Client) {
        let Ok(minor) = client_minor(client.id) else {
            return;
        };

        for dir in Direction::ALL {
            if dir.rate(&client.rates).is_some() {
                self.remove_direction(device, dir, minor);
            }
        }

        log::info!("Removed rules for {} on {}", client.address, device.name);
    }
}
