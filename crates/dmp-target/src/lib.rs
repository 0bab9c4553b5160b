//! dmp Target
//!
//! A linear remapping block target that keeps one process-wide set of
//! read/write traffic statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   Host framework │  (NBD gateway, tests)
//! └────────┬─────────┘
//!          │ Bio
//! ┌────────▼─────────┐      ┌──────────────┐
//! │     Remapper     │─────▶│ IoStatistics │  (atomic counters)
//! │ - device/sector  │      └──────────────┘
//! └────────┬─────────┘
//!          │ submit (one-way)
//! ┌────────▼─────────┐
//! │   IoDispatcher   │  (worker pool, completes the Bio)
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │   BlockDevice    │
//! └──────────────────┘
//! ```

pub mod attr;
pub mod bio;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod remap;
pub mod stats;

pub use attr::VolumesAttribute;
pub use bio::{Bio, BioOp, BioResult, DataDir};
pub use descriptor::VolumeDescriptor;
pub use device::{AccessMode, BlockDevice, TableMode};
pub use dispatch::IoDispatcher;
pub use error::{TargetError, TargetResult};
pub use metrics::PrometheusExporter;
pub use registry::{MappedVolume, TargetRegistry};
pub use remap::{BioSubmitter, MapOutcome, Remapper};
pub use stats::{Direction, DirectionSnapshot, IoStatistics, OpSummary, StatsReport, StatsSnapshot};

/// Name the target type registers under
pub const TARGET_NAME: &str = "dmp";

/// Target type version (major, minor, patch)
pub const TARGET_VERSION: (u32, u32, u32) = (1, 0, 0);

/// Sector size in bytes (standard 512-byte sectors)
pub const SECTOR_SIZE: u64 = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;
