//! Device address binding cache
//!
//! Upper layers address peers by device instance number; the wire wants a
//! network number and a MAC. This cache holds the mapping learned from
//! I-Am announcements (or entered by hand), together with the peer's
//! maximum APDU size, and ages entries out on a coarse seconds clock
//! driven by the application's timer task.
//!
//! Rules of the house:
//! - an I-Am may only refresh the address and max-APDU of an entry; a
//!   manual bind keeps its values until its TTL has run out,
//! - static binds never expire,
//! - capacity is bounded; when full, the stalest dynamic entry makes room.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::{debug, trace};

use crate::datalink::DataLinkAddress;
use crate::network::NetworkAddress;

/// Default entry lifetime.
pub const DEFAULT_TTL_SECONDS: u32 = 60;
/// Default number of entries the cache can hold.
pub const DEFAULT_CAPACITY: usize = 64;

/// How an entry got into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingOrigin {
    /// Learned from an I-Am; refreshed by later I-Ams.
    Learned,
    /// Entered by the application; I-Ams may not overwrite it until its
    /// TTL has expired.
    Manual,
    /// Entered by the application; never ages.
    Static,
}

/// One device-instance binding.
#[derive(Debug, Clone)]
pub struct AddressBinding {
    pub device_instance: u32,
    pub max_apdu: usize,
    pub network_address: NetworkAddress,
    pub datalink_address: DataLinkAddress,
    ttl_seconds: u32,
    origin: BindingOrigin,
}

impl AddressBinding {
    /// Seconds until this entry expires; static entries report their
    /// configured TTL forever.
    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub fn is_static(&self) -> bool {
        self.origin == BindingOrigin::Static
    }
}

/// Bounded device-instance → address cache with TTL aging.
pub struct AddressBindingCache {
    entries: Vec<AddressBinding>,
    capacity: usize,
    default_ttl: u32,
}

impl AddressBindingCache {
    pub fn new(capacity: usize, default_ttl: u32) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            default_ttl,
        }
    }

    /// Record what an I-Am told us. Creates or refreshes a learned entry;
    /// for manual entries only the TTL clock matters, their contents win
    /// until they expire.
    pub fn observed(
        &mut self,
        device_instance: u32,
        max_apdu: usize,
        network_address: NetworkAddress,
        datalink_address: DataLinkAddress,
    ) {
        let default_ttl = self.default_ttl;
        if let Some(entry) = self.find_mut(device_instance) {
            match entry.origin {
                BindingOrigin::Learned => {
                    trace!("binding: refreshed device {}", device_instance);
                    entry.max_apdu = max_apdu;
                    entry.network_address = network_address;
                    entry.datalink_address = datalink_address;
                    entry.ttl_seconds = default_ttl;
                }
                BindingOrigin::Manual | BindingOrigin::Static => {
                    trace!(
                        "binding: device {} manually bound, I-Am ignored",
                        device_instance
                    );
                }
            }
            return;
        }
        self.insert(AddressBinding {
            device_instance,
            max_apdu,
            network_address,
            datalink_address,
            ttl_seconds: self.default_ttl,
            origin: BindingOrigin::Learned,
        });
    }

    /// Bind a device by hand. Wins over I-Ams until the TTL runs out.
    pub fn bind(
        &mut self,
        device_instance: u32,
        max_apdu: usize,
        network_address: NetworkAddress,
        datalink_address: DataLinkAddress,
        ttl_seconds: u32,
    ) {
        self.remove(device_instance);
        self.insert(AddressBinding {
            device_instance,
            max_apdu,
            network_address,
            datalink_address,
            ttl_seconds,
            origin: BindingOrigin::Manual,
        });
    }

    /// Bind a device permanently; the entry never ages out.
    pub fn bind_static(
        &mut self,
        device_instance: u32,
        max_apdu: usize,
        network_address: NetworkAddress,
        datalink_address: DataLinkAddress,
    ) {
        self.remove(device_instance);
        self.insert(AddressBinding {
            device_instance,
            max_apdu,
            network_address,
            datalink_address,
            ttl_seconds: self.default_ttl,
            origin: BindingOrigin::Static,
        });
    }

    /// Look a device up. Expired entries are gone; a hit says nothing
    /// about freshness beyond "TTL has not run out".
    pub fn lookup(&self, device_instance: u32) -> Option<&AddressBinding> {
        self.entries
            .iter()
            .find(|e| e.device_instance == device_instance)
    }

    /// Age every entry by `seconds`; drop the dynamic ones that reach
    /// zero.
    pub fn tick(&mut self, seconds: u32) {
        self.entries.retain_mut(|entry| {
            if entry.origin == BindingOrigin::Static {
                return true;
            }
            entry.ttl_seconds = entry.ttl_seconds.saturating_sub(seconds);
            if entry.ttl_seconds == 0 {
                debug!("binding: device {} expired", entry.device_instance);
                false
            } else {
                true
            }
        });
    }

    /// Drop a device's entry, static or not.
    pub fn remove(&mut self, device_instance: u32) {
        self.entries.retain(|e| e.device_instance != device_instance);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_mut(&mut self, device_instance: u32) -> Option<&mut AddressBinding> {
        self.entries
            .iter_mut()
            .find(|e| e.device_instance == device_instance)
    }

    fn insert(&mut self, binding: AddressBinding) {
        if self.entries.len() >= self.capacity {
            // Evict the dynamic entry closest to expiry.
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.origin != BindingOrigin::Static)
                .min_by_key(|(_, e)| e.ttl_seconds)
                .map(|(i, _)| i);
            match victim {
                Some(index) => {
                    let evicted = self.entries.swap_remove(index);
                    debug!(
                        "binding: cache full, evicted device {}",
                        evicted.device_instance
                    );
                }
                None => {
                    debug!("binding: cache full of static entries, dropping new binding");
                    return;
                }
            }
        }
        self.entries.push(binding);
    }
}

impl Default for AddressBindingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL_SECONDS)
    }
}
