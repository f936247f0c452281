//! Explicit device registry.
//!
//! Maps a device name (a PCI address, an interface name, whatever the
//! process driver uses) to a shared device handle. This is a plain object
//! with an explicit lifecycle instead of a process-wide table: create it,
//! pass it by reference to whoever needs lookups, drop it at teardown.
//! Tests run several simulated devices side by side through separate
//! registries.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(name) => {
                write!(f, "device {:?} is already registered", name)
            }
        }
    }
}

impl Error for RegistryError {}

/// Registry of live device handles.
pub struct DeviceRegistry<D> {
    devices: Mutex<HashMap<String, Arc<D>>>,
}

impl<D> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> DeviceRegistry<D> {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a device under `name`; refuses duplicates.
    pub fn register(&self, name: impl Into<String>, dev: Arc<D>) -> Result<(), RegistryError> {
        let name = name.into();
        let mut devices = lock(&self.devices);
        if devices.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        devices.insert(name, dev);
        Ok(())
    }

    /// Shared handle to a registered device.
    pub fn lookup(&self, name: &str) -> Option<Arc<D>> {
        lock(&self.devices).get(name).cloned()
    }

    /// Removes and returns a device; outstanding handles stay valid.
    pub fn unregister(&self, name: &str) -> Option<Arc<D>> {
        lock(&self.devices).remove(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let reg: DeviceRegistry<&'static str> = DeviceRegistry::new();
        reg.register("0000:5e:00.0", Arc::new("a")).unwrap();
        reg.register("0000:5e:00.1", Arc::new("b")).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(*reg.lookup("0000:5e:00.0").unwrap(), "a");
        assert!(reg.lookup("0000:5e:00.2").is_none());

        let removed = reg.unregister("0000:5e:00.0").unwrap();
        assert_eq!(*removed, "a");
        assert!(reg.lookup("0000:5e:00.0").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let reg: DeviceRegistry<u32> = DeviceRegistry::new();
        reg.register("eth0", Arc::new(1)).unwrap();
        let err = reg.register("eth0", Arc::new(2)).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("eth0".into()));
        // The original registration is untouched.
        assert_eq!(*reg.lookup("eth0").unwrap(), 1);
    }
}
