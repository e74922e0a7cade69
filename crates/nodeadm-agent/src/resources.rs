//! Host-wide shared state: container name registry and resource ledger.
//!
//! Agents run concurrently and meet here. Container names are claimed by one
//! hostname at a time, mutations on one container are serialized by a
//! per-name async lock, and resource reservations are checked against the
//! host's capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use nodeadm_core::error::{ConvergenceError, ConvergenceResult};
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::ResourceAllocation;

#[derive(Default)]
struct Registry {
    owners: HashMap<ContainerName, String>,
    reservations: HashMap<String, ResourceAllocation>,
    locks: HashMap<ContainerName, Arc<AsyncMutex<()>>>,
}

pub struct HostResources {
    capacity: ResourceAllocation,
    registry: Mutex<Registry>,
}

impl HostResources {
    pub fn new(capacity: ResourceAllocation) -> Self {
        Self {
            capacity,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> ResourceAllocation {
        self.capacity
    }

    /// Claim `name` for `hostname`. Re-claiming by the same hostname is a
    /// no-op; a claim by a different hostname is a conflict.
    pub fn claim_name(&self, name: &ContainerName, hostname: &str) -> ConvergenceResult<()> {
        let mut registry = self.registry();
        match registry.owners.get(name) {
            Some(owner) if owner != hostname => Err(ConvergenceError::conflict(format!(
                "container name {} is claimed by {}, not {}",
                name, owner, hostname
            ))),
            Some(_) => Ok(()),
            None => {
                registry.owners.insert(name.clone(), hostname.to_string());
                Ok(())
            }
        }
    }

    /// Drop the claim if `hostname` holds it.
    pub fn release_name(&self, name: &ContainerName, hostname: &str) {
        let mut registry = self.registry();
        if registry.owners.get(name).map(String::as_str) == Some(hostname) {
            registry.owners.remove(name);
        }
    }

    pub fn owner_of(&self, name: &ContainerName) -> Option<String> {
        self.registry().owners.get(name).cloned()
    }

    /// Serialize mutations on one container. Held for the duration of a
    /// mutation group.
    pub async fn lock_container(&self, name: &ContainerName) -> OwnedMutexGuard<()> {
        let lock = self
            .registry()
            .locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Reserve `resources` for `hostname`, replacing any earlier reservation
    /// it held. Fails without changing the ledger if the host would be
    /// oversubscribed.
    pub fn reserve(&self, hostname: &str, resources: ResourceAllocation) -> ConvergenceResult<()> {
        let mut registry = self.registry();
        let others = registry
            .reservations
            .iter()
            .filter(|(h, _)| h.as_str() != hostname)
            .fold(ResourceAllocation::ZERO, |acc, (_, r)| acc.add(r));
        let total = others.add(&resources);
        if !total.fits_within(&self.capacity) {
            return Err(ConvergenceError::non_retryable(format!(
                "{} for {} exceeds host capacity {} ({} already reserved)",
                resources, hostname, self.capacity, others
            )));
        }
        debug!(hostname = %hostname, resources = %resources, "Reserved resources");
        registry.reservations.insert(hostname.to_string(), resources);
        Ok(())
    }

    pub fn release(&self, hostname: &str) {
        if self.registry().reservations.remove(hostname).is_some() {
            debug!(hostname = %hostname, "Released resources");
        }
    }

    pub fn reservation(&self, hostname: &str) -> Option<ResourceAllocation> {
        self.registry().reservations.get(hostname).copied()
    }

    /// Sum of all reservations.
    pub fn allocated(&self) -> ResourceAllocation {
        self.registry()
            .reservations
            .values()
            .fold(ResourceAllocation::ZERO, |acc, r| acc.add(r))
    }
}
