//! Per-volume target state

use std::sync::Arc;

use tracing::{error, info};

use crate::device::{BlockDevice, TableMode};
use crate::error::{TargetError, TargetResult};

/// Maps one logical volume onto its underlying device.
///
/// Built from the table arguments when a volume is registered and dropped
/// when it is unregistered; dropping releases this descriptor's reference
/// to the device.
#[derive(Debug)]
pub struct VolumeDescriptor {
    device: Arc<BlockDevice>,
    /// First sector of the volume on the device
    start: u64,
}

impl VolumeDescriptor {
    /// Construct from table arguments.
    ///
    /// Exactly one argument is accepted: the underlying device, as a path or
    /// `MAJOR:MINOR`. The volume always starts at sector 0 of the device.
    pub fn construct<S: AsRef<str>>(args: &[S], mode: TableMode) -> TargetResult<Self> {
        let [device] = args else {
            error!(argc = args.len(), "invalid number of arguments");
            return Err(TargetError::InvalidArguments(args.len()));
        };
        let device = device.as_ref();

        let handle = BlockDevice::open(device, mode).map_err(|source| {
            error!(device, error = %source, "device lookup failed");
            TargetError::DeviceLookupFailed {
                device: device.to_string(),
                source,
            }
        })?;

        let descriptor = Self {
            device: Arc::new(handle),
            start: 0,
        };
        info!(
            device,
            dev_id = descriptor.device.id(),
            start = descriptor.start,
            "volume descriptor constructed"
        );
        Ok(descriptor)
    }

    /// Underlying device
    pub const fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    /// First sector of the volume on the device
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Release the descriptor and its device reference
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for VolumeDescriptor {
    fn drop(&mut self) {
        info!(
            dev_id = self.device.id(),
            path = %self.device.path().display(),
            "volume descriptor destroyed"
        );
    }
}
