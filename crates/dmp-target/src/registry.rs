//! Volume table
//!
//! Registration builds a [`VolumeDescriptor`] from the table arguments and
//! keeps it under the volume's name; unregistration drops it. Request
//! delivery looks a volume up once and then maps through the returned
//! handle, so the table lock is never taken per request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::SECTOR_SIZE;
use crate::bio::Bio;
use crate::descriptor::VolumeDescriptor;
use crate::device::TableMode;
use crate::error::{TargetError, TargetResult};
use crate::remap::{MapOutcome, Remapper};

/// A registered volume
#[derive(Debug)]
pub struct MappedVolume {
    name: String,
    len_sectors: u64,
    descriptor: VolumeDescriptor,
}

impl MappedVolume {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in sectors
    pub const fn len_sectors(&self) -> u64 {
        self.len_sectors
    }

    /// Length in bytes
    pub const fn size_bytes(&self) -> u64 {
        self.len_sectors.saturating_mul(SECTOR_SIZE)
    }

    pub const fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn read_only(&self) -> bool {
        !self.descriptor.device().mode().access.is_writable()
    }
}

/// Registered volumes by name
pub struct TargetRegistry {
    volumes: RwLock<HashMap<String, Arc<MappedVolume>>>,
    remapper: Remapper,
}

impl TargetRegistry {
    pub fn new(remapper: Remapper) -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            remapper,
        }
    }

    pub const fn remapper(&self) -> &Remapper {
        &self.remapper
    }

    /// Register a volume.
    ///
    /// A `len_sectors` of 0 maps the whole device.
    pub fn create<S: AsRef<str>>(
        &self,
        name: &str,
        len_sectors: u64,
        args: &[S],
        mode: TableMode,
    ) -> TargetResult<Arc<MappedVolume>> {
        if self.volumes.read().contains_key(name) {
            return Err(TargetError::VolumeExists(name.to_string()));
        }
        self.volumes
            .write()
            .try_reserve(1)
            .map_err(|_| TargetError::AllocationFailure)?;

        let descriptor = VolumeDescriptor::construct(args, mode)?;
        let len_sectors = if len_sectors == 0 {
            descriptor.device().size_sectors()
        } else {
            len_sectors
        };
        let volume = Arc::new(MappedVolume {
            name: name.to_string(),
            len_sectors,
            descriptor,
        });

        let mut volumes = self.volumes.write();
        if volumes.contains_key(name) {
            // Lost a race with another registration of the same name
            return Err(TargetError::VolumeExists(name.to_string()));
        }
        volumes.insert(name.to_string(), Arc::clone(&volume));
        info!(volume = name, len_sectors, "volume registered");
        Ok(volume)
    }

    /// Unregister a volume.
    ///
    /// The descriptor is destroyed once the last outstanding handle to the
    /// volume is dropped.
    pub fn remove(&self, name: &str) -> TargetResult<()> {
        let volume = self
            .volumes
            .write()
            .remove(name)
            .ok_or_else(|| TargetError::VolumeNotFound(name.to_string()))?;
        info!(volume = name, "volume unregistered");
        if let Ok(volume) = Arc::try_unwrap(volume) {
            volume.descriptor.destroy();
        }
        Ok(())
    }

    /// Unregister every volume
    pub fn clear(&self) {
        let names: Vec<String> = self.volumes.read().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove(&name) {
                // Already removed by a concurrent caller
                debug!(volume = %name, error = %e, "skipping volume during clear");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<MappedVolume>> {
        self.volumes.read().get(name).cloned()
    }

    /// Names and lengths of registered volumes, sorted by name
    pub fn list(&self) -> Vec<(String, u64)> {
        let mut list: Vec<_> = self
            .volumes
            .read()
            .values()
            .map(|v| (v.name.clone(), v.len_sectors))
            .collect();
        list.sort();
        list
    }

    /// Map a request through the named volume
    pub fn map(&self, name: &str, bio: Bio) -> TargetResult<MapOutcome> {
        let volume = self
            .get(name)
            .ok_or_else(|| TargetError::VolumeNotFound(name.to_string()))?;
        Ok(self.remapper.map(volume.descriptor(), bio))
    }
}
