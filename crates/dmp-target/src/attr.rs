//! The `stat/volumes` attribute

use std::sync::Arc;

use crate::stats::IoStatistics;

/// Directory the attribute is published under
pub const STAT_DIR: &str = "stat";

/// Attribute file name
pub const ATTR_NAME: &str = "volumes";

/// Text view of the global statistics
#[derive(Debug, Clone)]
pub struct VolumesAttribute {
    stats: Arc<IoStatistics>,
}

impl VolumesAttribute {
    pub const fn new(stats: Arc<IoStatistics>) -> Self {
        Self { stats }
    }

    /// Path of the attribute relative to the publisher root
    pub fn path() -> String {
        format!("{STAT_DIR}/{ATTR_NAME}")
    }

    /// Render the current report
    pub fn show(&self) -> String {
        self.stats.report().to_string()
    }

    /// Accept and discard a write; reports the whole buffer as consumed
    pub const fn store(&self, buf: &[u8]) -> usize {
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Direction;

    #[test]
    fn test_show_reflects_counters() {
        let stats = Arc::new(IoStatistics::new());
        let attr = VolumesAttribute::new(Arc::clone(&stats));
        assert!(attr.show().starts_with("read:\n\treqs: 0\n\tavg size: 0\n"));

        stats.record(Direction::Write, 512);
        assert!(attr.show().contains("write:\n\treqs: 1\n\tavg size: 512\n"));
    }

    #[test]
    fn test_store_is_a_no_op() {
        let stats = Arc::new(IoStatistics::new());
        stats.record(Direction::Read, 100);
        let attr = VolumesAttribute::new(Arc::clone(&stats));

        assert_eq!(attr.store(b"0\n"), 2);
        assert_eq!(stats.report().read.ops, 1);
    }

    #[test]
    fn test_path() {
        assert_eq!(VolumesAttribute::path(), "stat/volumes");
    }
}
