//! Request remapping
//!
//! Rewrites a request from volume coordinates to device coordinates, counts
//! it, and hands it off. The hand-off is one-way: the remapper never waits
//! for or observes completion.

use std::sync::Arc;

use tracing::trace;

use crate::bio::{Bio, BioOp, DataDir};
use crate::descriptor::VolumeDescriptor;
use crate::stats::{Direction, IoStatistics};

/// Receives remapped requests and owns their completion.
///
/// `submit` must not block: it runs on the request delivery path.
pub trait BioSubmitter: Send + Sync {
    fn submit(&self, bio: Bio);
}

/// What the remapper did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// Handed off; completion belongs to the submitter
    Submitted,
}

/// Point `bio` at the descriptor's device, shifted by its start sector
pub fn remap(descriptor: &VolumeDescriptor, bio: &mut Bio) {
    bio.set_device(Arc::clone(descriptor.device()));
    bio.set_sector(bio.sector().saturating_add(descriptor.start()));
}

/// Which counter set a request belongs to, if any
pub fn classify(bio: &Bio) -> Option<Direction> {
    if bio.op() == BioOp::Read && bio.data_dir() == DataDir::Read {
        Some(Direction::Read)
    } else if bio.has_data() && bio.data_dir() == DataDir::Write {
        Some(Direction::Write)
    } else {
        None
    }
}

/// Remaps requests and feeds the shared statistics
pub struct Remapper {
    stats: Arc<IoStatistics>,
    submitter: Arc<dyn BioSubmitter>,
}

impl Remapper {
    pub fn new(stats: Arc<IoStatistics>, submitter: Arc<dyn BioSubmitter>) -> Self {
        Self { stats, submitter }
    }

    /// Statistics this remapper records into
    pub const fn stats(&self) -> &Arc<IoStatistics> {
        &self.stats
    }

    /// Remap, count and submit one request
    pub fn map(&self, descriptor: &VolumeDescriptor, mut bio: Bio) -> MapOutcome {
        remap(descriptor, &mut bio);
        trace!(
            op = bio.op().as_str(),
            sector = bio.sector(),
            size = bio.size(),
            dev_id = descriptor.device().id(),
            "new request"
        );

        if let Some(direction) = classify(&bio) {
            self.stats.record(direction, u64::from(bio.size()));
        }

        self.submitter.submit(bio);
        MapOutcome::Submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TableMode;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tempfile::NamedTempFile;

    /// Keeps submitted requests for inspection
    #[derive(Default)]
    struct Captured(Mutex<Vec<Bio>>);

    impl BioSubmitter for Captured {
        fn submit(&self, bio: Bio) {
            self.0.lock().push(bio);
        }
    }

    fn setup() -> (NamedTempFile, VolumeDescriptor, Arc<Captured>, Remapper) {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let descriptor = VolumeDescriptor::construct(&[path], TableMode::default()).unwrap();
        let captured = Arc::new(Captured::default());
        let remapper = Remapper::new(Arc::new(IoStatistics::new()), captured.clone());
        (file, descriptor, captured, remapper)
    }

    #[test]
    fn test_read_is_remapped_and_counted() {
        let (_file, descriptor, captured, remapper) = setup();

        let outcome = remapper.map(&descriptor, Bio::read(10, 4096));
        assert_eq!(outcome, MapOutcome::Submitted);

        let bios = captured.0.lock();
        assert_eq!(bios.len(), 1);
        assert_eq!(bios[0].sector(), 10);
        assert!(Arc::ptr_eq(bios[0].device().unwrap(), descriptor.device()));

        let report = remapper.stats().report();
        assert_eq!(report.read.ops, 1);
        assert_eq!(report.read.avg_size, 4096);
        assert_eq!(report.write.ops, 0);
    }

    #[test]
    fn test_writes_counted_only_as_writes() {
        let (_file, descriptor, _captured, remapper) = setup();
        for size in [100usize, 200, 300] {
            remapper.map(&descriptor, Bio::write(0, Bytes::from(vec![1u8; size])));
        }
        let report = remapper.stats().report();
        assert_eq!(report.write.ops, 3);
        assert_eq!(report.write.avg_size, 200);
        assert_eq!(report.read.ops, 0);
    }

    #[test]
    fn test_control_requests_not_counted() {
        let (_file, descriptor, captured, remapper) = setup();
        remapper.map(&descriptor, Bio::flush());
        remapper.map(&descriptor, Bio::discard(0, 4096));
        remapper.map(&descriptor, Bio::write_zeroes(8, 512));
        remapper.map(&descriptor, Bio::write(0, Bytes::new()));

        assert_eq!(remapper.stats().report().total.ops, 0);
        // Still forwarded
        assert_eq!(captured.0.lock().len(), 4);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&Bio::read(0, 512)), Some(Direction::Read));
        assert_eq!(classify(&Bio::read(0, 0)), Some(Direction::Read));
        assert_eq!(
            classify(&Bio::write(0, Bytes::from_static(b"x"))),
            Some(Direction::Write)
        );
        assert_eq!(classify(&Bio::flush()), None);
        assert_eq!(classify(&Bio::discard(0, 512)), None);
    }

    #[test]
    fn test_remap_adds_start_sector() {
        let (_file, descriptor, _captured, _remapper) = setup();
        for sector in [0, 1, 4095, u64::MAX - 1] {
            let mut bio = Bio::read(sector, 512);
            remap(&descriptor, &mut bio);
            assert_eq!(bio.sector(), sector + descriptor.start());
            assert!(Arc::ptr_eq(bio.device().unwrap(), descriptor.device()));
        }
    }
}
