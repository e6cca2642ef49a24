// Reconciler: keeps the registry and the kernel in agreement

use crate::backends::RuleExecutor;
use crate::engine::{Engine, client_minor};
use crate::mac::MacAddr;
use crate::rate::Rates;
use crate::registry::{Client, Device, DeviceRegistry};
use anyhow::{Result, anyhow, bail};
use serde::Serialize;

/// Outcome of a full replay
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub devices: usize,
    pub clients: usize,
    /// Devices that could not be reinstalled; their clients stay recorded
    /// but are not enforced
    pub degraded: Vec<String>,
    /// Clients dropped because their rules could not be replayed
    pub evicted: Vec<String>,
}

/// Owns the device registry and the engine that enforces it
///
/// The registry is the source of truth; kernel state can always be thrown
/// away and rebuilt from it.
pub struct Reconciler<E: RuleExecutor> {
    engine: Engine<E>,
    registry: DeviceRegistry,
}

impl<E: RuleExecutor> Reconciler<E> {
    pub fn new(executor: E) -> Self {
        Self {
            engine: Engine::new(executor),
            registry: DeviceRegistry::default(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn executor(&self) -> &E {
        self.engine.executor()
    }

    #[cfg(test)]
    pub fn executor_mut(&mut self) -> &mut E {
        self.engine.executor_mut()
    }

    /// Make sure `name` has its shaping hierarchy installed
    ///
    /// Unknown devices are installed and registered; degraded ones are
    /// reinstalled and their clients replayed. On failure no record of the
    /// device is left behind.
    ///
    /// A new device whose name or mirror clashes with a registered device's
    /// name or mirror is refused before anything is installed.
    pub fn ensure_device(&mut self, name: &str) -> Result<()> {
        match self.registry.get(name).map(|d| d.degraded) {
            Some(false) => Ok(()),
            Some(true) => {
                log::info!("Device {} is degraded, reinstalling", name);
                self.reset_device(name, None)
            }
            None => {
                let device = Device::new(name);
                if let Some(other) = self.registry.clashing(&device) {
                    bail!(
                        "Device {} (mirror {}) clashes with {} (mirror {})",
                        device.name,
                        device.mirror,
                        other.name,
                        other.mirror
                    );
                }
                self.engine.install(&device.name, &device.mirror)?;
                self.registry.insert(device);
                Ok(())
            }
        }
    }

    /// Set the rates of a client on an installed device, creating the
    /// client if needed; returns the client id
    ///
    /// If the rates cannot be enforced even after a device reset, the
    /// client is evicted and an error returned.
    pub fn set_client(
        &mut self,
        device: &str,
        address: &MacAddr,
        desired: Rates,
    ) -> Result<usize> {
        if desired.is_empty() {
            bail!("No rate given for {}", address);
        }

        let dev = self
            .registry
            .get_mut(device)
            .ok_or_else(|| anyhow!("Device {} is not installed", device))?;
        let (client, created) = dev.get_or_create_client(address);
        let id = client.id;

        // Out of class ids: no reset can fix that
        if created {
            if let Err(e) = client_minor(id) {
                dev.remove_client(address);
                return Err(e.context(format!("Cannot add {} on {}", address, device)));
            }
        }

        if client.rates == desired {
            log::debug!(
                "{} on {} already at {}, nothing to do",
                address,
                device,
                desired
            );
            return Ok(id);
        }

        if created {
            log::info!("New client {} on {} with id {}", address, device, id);
        }
        client.rates = desired;

        let err = match self.apply_client(device, address) {
            Ok(()) => return Ok(id),
            Err(e) => e,
        };

        log::warn!(
            "Failed to apply rates for {} on {}, resetting device: {:#}",
            address,
            device,
            err
        );

        if let Err(e) = self.reset_device(device, Some(address)) {
            log::error!("Reset of {} failed, device dropped: {:#}", device, e);
            return Err(e.context(format!("Failed to recover {}", device)));
        }

        if let Err(e) = self.apply_client(device, address) {
            log::error!(
                "Retry failed for {} on {}, evicting client: {:#}",
                address,
                device,
                e
            );
            self.evict(device, address);
            return Err(e.context(format!("Failed to enforce rates for {}", address)));
        }

        Ok(id)
    }

    fn apply_client(&mut self, device: &str, address: &MacAddr) -> Result<()> {
        let dev = self
            .registry
            .get(device)
            .ok_or_else(|| anyhow!("Device {} is not installed", device))?;
        let client = dev
            .client(address)
            .ok_or_else(|| anyhow!("Client {} not found on {}", address, device))?;

        self.engine.apply(dev, client)
    }

    fn evict(&mut self, device: &str, address: &MacAddr) -> Option<Client> {
        self.registry.get_mut(device)?.remove_client(address)
    }

    /// Reinstall a known device and replay its clients (all but `skip`)
    ///
    /// Reinstalling wipes every rule on the device, so the other clients
    /// must be applied again to stay enforced. If the install itself fails
    /// the device and its clients are forgotten.
    fn reset_device(&mut self, name: &str, skip: Option<&MacAddr>) -> Result<()> {
        let mirror = self
            .registry
            .get(name)
            .map(|d| d.mirror.clone())
            .ok_or_else(|| anyhow!("Device {} is not installed", name))?;

        if let Err(e) = self.engine.install(name, &mirror) {
            self.registry.remove(name);
            return Err(e);
        }

        if let Some(device) = self.registry.get_mut(name) {
            device.degraded = false;
        }

        let evicted = self.replay_clients(name, skip);
        if !evicted.is_empty() {
            log::warn!(
                "{} client(s) evicted from {} during reset",
                evicted.len(),
                name
            );
        }

        Ok(())
    }

    /// Apply every recorded client of `name` again, evicting any that fail
    fn replay_clients(&mut self, name: &str, skip: Option<&MacAddr>) -> Vec<MacAddr> {
        let addresses = match self.registry.get(name) {
            Some(device) => device.addresses(),
            None => return Vec::new(),
        };

        let mut evicted = Vec::new();
        for address in addresses.iter().filter(|a| Some(*a) != skip) {
            if let Err(e) = self.apply_client(name, address) {
                log::error!(
                    "Replay of {} on {} failed, evicting client: {:#}",
                    address,
                    name,
                    e
                );
                self.evict(name, address);
                evicted.push(address.clone());
            }
        }

        evicted
    }

    /// Remove a client from one device
    pub fn delete_client(&mut self, device: &str, address: &MacAddr) -> Option<Client> {
        let dev = self.registry.get_mut(device)?;
        let client = dev.remove_client(address)?;
        self.engine.remove(dev, &client);
        Some(client)
    }

    /// Remove a client from every device it is known on; returns the
    /// number of devices it was removed from
    pub fn delete_client_everywhere(&mut self, address: &MacAddr) -> usize {
        let mut removed = 0;
        for name in self.registry.names() {
            if self.delete_client(&name, address).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Uninstall a device and forget it with all its clients
    pub fn delete_device(&mut self, name: &str) -> Option<Device> {
        let device = self.registry.remove(name)?;
        self.engine.uninstall(&device.name, &device.mirror);
        log::info!(
            "Deleted device {} with {} client(s)",
            name,
            device.client_count()
        );
        Some(device)
    }

    /// Rebuild all kernel state from the registry
    pub fn reload(&mut self) -> ReloadReport {
        let mut report = ReloadReport::default();

        for name in self.registry.names() {
            let Some(device) = self.registry.get(&name) else {
                continue;
            };
            let mirror = device.mirror.clone();
            report.devices += 1;

            if let Err(e) = self.engine.install(&name, &mirror) {
                let device = self.registry.get_mut(&name);
                let clients = device.as_ref().map_or(0, |d| d.client_count());
                if let Some(device) = device {
                    device.degraded = true;
                }
                log::warn!(
                    "Reload could not reinstall {}, {} client(s) left unenforced: {:#}",
                    name,
                    clients,
                    e
                );
                report.degraded.push(name);
                continue;
            }

            if let Some(device) = self.registry.get_mut(&name) {
                device.degraded = false;
            }

            for address in self.replay_clients(&name, None) {
                report.evicted.push(format!("{}@{}", address, name));
            }
            report.clients += self.registry.get(&name).map_or(0, |d| d.client_count());
        }

        log::info!(
            "Reload complete: {} device(s), {} client(s) enforced, {} degraded, {} evicted",
            report.devices,
            report.clients,
            report.degraded.len(),
            report.evicted.len()
        );
        report
    }

    /// Tear down every device; used on exit
    pub fn shutdown(&mut self) {
        if self.registry.is_empty() {
            return;
        }

        log::info!("Removing shaping from {} device(s)", self.registry.len());
        for name in self.registry.names() {
            self.delete_device(&name);
        }
    }
}

impl<E: RuleExecutor> Drop for Reconciler<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
