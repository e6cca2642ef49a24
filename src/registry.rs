// Device and client registry

use crate::backends::linux_tc_utils::mirror_name;
use crate::mac::MacAddr;
use crate::rate::Rates;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Dense per-device client id allocator
///
/// Freed ids go onto an ordered free list and the smallest one is handed
/// out first, so ids (and the kernel class ids derived from them) stay
/// small under churn. The slot sequence never shrinks.
#[derive(Debug, Default)]
pub struct SlotArena {
    slots: Vec<Option<MacAddr>>,
    free: BTreeSet<usize>,
}

impl SlotArena {
    /// Claim the smallest free id for `owner`
    pub fn allocate(&mut self, owner: MacAddr) -> usize {
        match self.free.pop_first() {
            Some(id) => {
                self.slots[id] = Some(owner);
                id
            }
            None => {
                self.slots.push(Some(owner));
                self.slots.len() - 1
            }
        }
    }

    /// Release `id`; releasing an empty or unknown slot is a no-op
    pub fn free(&mut self, id: usize) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.take().is_some() {
                self.free.insert(id);
            }
        }
    }

    #[cfg(test)]
    pub fn owner(&self, id: usize) -> Option<&MacAddr> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Length of the slot sequence, occupied or not
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn occupied(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// One rate-limited endpoint on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub address: MacAddr,
    pub id: usize,
    /// Last rates fully applied to the kernel
    pub rates: Rates,
}

/// A managed interface, its IFB mirror and its clients
#[derive(Debug)]
pub struct Device {
    pub name: String,
    pub mirror: String,
    /// Reinstall failed during a reload: clients are recorded but not
    /// enforced until the device is installed again
    pub degraded: bool,
    clients: HashMap<MacAddr, Client>,
    slots: SlotArena,
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mirror: mirror_name(name),
            degraded: false,
            clients: HashMap::new(),
            slots: SlotArena::default(),
        }
    }

    pub fn client(&self, address: &MacAddr) -> Option<&Client> {
        self.clients.get(address)
    }

    /// Look up a client, creating it with a fresh id and no rates if needed
    ///
    /// Returns the client and whether it was just created.
    pub fn get_or_create_client(&mut self, address: &MacAddr) -> (&mut Client, bool) {
        let created = !self.clients.contains_key(address);
        let slots = &mut self.slots;
        let client = self.clients.entry(address.clone()).or_insert_with(|| {
            let id = slots.allocate(address.clone());
            log::debug!("Allocated client id {} for {}", id, address);
            Client {
                address: address.clone(),
                id,
                rates: Rates::default(),
            }
        });
        (client, created)
    }

    /// Forget a client and release its id
    pub fn remove_client(&mut self, address: &MacAddr) -> Option<Client> {
        let client = self.clients.remove(address)?;
        self.slots.free(client.id);
        Some(client)
    }

    /// Clients ordered by id
    pub fn clients(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.clients.values().collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Client addresses ordered by id
    pub fn addresses(&self) -> Vec<MacAddr> {
        self.clients().into_iter().map(|c| c.address.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn slots(&self) -> &SlotArena {
        &self.slots
    }

    #[cfg(test)]
    pub fn slots_mut(&mut self) -> &mut SlotArena {
        &mut self.slots
    }
}

/// All devices whose shaping hierarchy is believed installed
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Register `device`, replacing any record with the same name
    pub fn insert(&mut self, device: Device) {
        self.devices.insert(device.name.clone(), device);
    }

    /// A registered device that would share interface names with `device`
    ///
    /// Two devices clash when their mirrors coincide (truncated names) or
    /// when one's name is the other's mirror.
    pub fn clashing(&self, device: &Device) -> Option<&Device> {
        self.devices.values().find(|d| {
            d.name != device.name
                && (d.mirror == device.mirror
                    || d.mirror == device.name
                    || d.name == device.mirror)
        })
    }

    pub fn remove(&mut self, name: &str) -> Option<Device> {
        self.devices.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
