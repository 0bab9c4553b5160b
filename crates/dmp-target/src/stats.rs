//! Process-wide I/O statistics
//!
//! One [`IoStatistics`] is created at startup and shared by every remap call
//! site. Each direction keeps an operation count and a byte total; averages
//! are derived on demand.
//!
//! Counters never wrap. The operation count saturates at `u64::MAX`. When a
//! new sample would overflow the byte total, whole multiples of the current
//! average are removed from the total first, so the newest sample is always
//! kept and the average stays close to its previous value.
//!
//! Updates are lock-free: each counter is an atomic and the byte total is
//! advanced with a compare-and-swap loop. A report may observe a combination
//! of counters from different moments; it is best-effort by contract.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Traffic direction of a recorded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Rounding used when sizing a rescale.
    ///
    /// Reads always leave strict headroom below `u64::MAX`, writes may fill
    /// it exactly. The two only differ when the excess is an exact multiple
    /// of the average.
    const fn rounding(self) -> Rounding {
        match self {
            Self::Read => Rounding::Down,
            Self::Write => Rounding::Up,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rounding {
    /// `floor(excess / average) + 1`
    Down,
    /// `ceil(excess / average)`
    Up,
}

/// `bytes / ops`, or 0 when nothing has been counted
const fn average(bytes: u64, ops: u64) -> u64 {
    if ops == 0 { 0 } else { bytes / ops }
}

/// Add `size` to `total`, rescaling by whole averages when it would overflow.
///
/// `ops` is the operation count including the sample being added. Returns the
/// new total and whether a rescale happened.
fn accumulate(total: u64, size: u64, ops: u64, rounding: Rounding) -> (u64, bool) {
    if let Some(sum) = total.checked_add(size) {
        return (sum, false);
    }

    // total + size - u64::MAX, without leaving u64
    let excess = size - (u64::MAX - total);
    // A zero average cannot shrink anything; step by single bytes instead.
    let avg = average(total, ops).max(1);
    let k = match rounding {
        Rounding::Down => (excess / avg).saturating_add(1),
        Rounding::Up => excess.div_ceil(avg),
    };
    let kept = total.saturating_sub(k.saturating_mul(avg));
    (kept.saturating_add(size), true)
}

#[derive(Debug)]
struct DirectionCounters {
    ops: AtomicU64,
    bytes: AtomicU64,
}

impl DirectionCounters {
    const fn new() -> Self {
        Self {
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Returns true when the byte total had to be rescaled
    fn record(&self, size: u64, rounding: Rounding) -> bool {
        let prev = match self
            .ops
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |ops| {
                Some(ops.saturating_add(1))
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        let ops = prev.saturating_add(1);

        let mut rescaled = false;
        match self
            .bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                let (next, did_rescale) = accumulate(total, size, ops, rounding);
                rescaled = did_rescale;
                Some(next)
            }) {
            Ok(_) | Err(_) => rescaled,
        }
    }

    fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Raw counters of one direction at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionSnapshot {
    pub ops: u64,
    pub bytes: u64,
}

impl DirectionSnapshot {
    /// Average request size in bytes (0 before the first request)
    pub const fn avg_size(&self) -> u64 {
        average(self.bytes, self.ops)
    }
}

/// Raw counters of both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read: DirectionSnapshot,
    pub write: DirectionSnapshot,
}

impl StatsSnapshot {
    /// Combined operation count, saturating
    pub const fn total_ops(&self) -> u64 {
        self.read.ops.saturating_add(self.write.ops)
    }

    /// Combined byte total, brought into range when the sum would overflow.
    ///
    /// Both sides give up the same number of their own averages until the
    /// sum fits.
    pub fn total_bytes(&self) -> u64 {
        let (read, write) = (self.read, self.write);
        if let Some(sum) = read.bytes.checked_add(write.bytes) {
            return sum;
        }

        let excess = write.bytes - (u64::MAX - read.bytes);
        let step = read.avg_size().saturating_add(write.avg_size());
        if step == 0 {
            return u64::MAX;
        }
        let rounds = excess.div_ceil(step);
        let read_bytes = read
            .bytes
            .saturating_sub(rounds.saturating_mul(read.avg_size()));
        let write_bytes = write
            .bytes
            .saturating_sub(rounds.saturating_mul(write.avg_size()));
        read_bytes.saturating_add(write_bytes)
    }
}

/// Request count and average size of one report line group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSummary {
    pub ops: u64,
    pub avg_size: u64,
}

/// The published statistics report.
///
/// `Display` renders the text served by the `volumes` attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub read: OpSummary,
    pub write: OpSummary,
    pub total: OpSummary,
}

impl From<StatsSnapshot> for StatsReport {
    fn from(snapshot: StatsSnapshot) -> Self {
        let total_ops = snapshot.total_ops();
        Self {
            read: OpSummary {
                ops: snapshot.read.ops,
                avg_size: snapshot.read.avg_size(),
            },
            write: OpSummary {
                ops: snapshot.write.ops,
                avg_size: snapshot.write.avg_size(),
            },
            total: OpSummary {
                ops: total_ops,
                avg_size: average(snapshot.total_bytes(), total_ops),
            },
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, summary) in [
            ("read", self.read),
            ("write", self.write),
            ("total", self.total),
        ] {
            writeln!(f, "{label}:")?;
            writeln!(f, "\treqs: {}", summary.ops)?;
            writeln!(f, "\tavg size: {}", summary.avg_size)?;
        }
        Ok(())
    }
}

/// Global read/write counters
#[derive(Debug)]
pub struct IoStatistics {
    read: DirectionCounters,
    write: DirectionCounters,
}

impl IoStatistics {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            read: DirectionCounters::new(),
            write: DirectionCounters::new(),
        }
    }

    /// Count one request of `size_bytes` in `direction`
    pub fn record(&self, direction: Direction, size_bytes: u64) {
        let counters = match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        };
        if counters.record(size_bytes, direction.rounding()) {
            debug!(
                direction = direction.as_str(),
                size_bytes, "byte total rescaled to avoid overflow"
            );
        }
    }

    /// Current raw counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read: self.read.snapshot(),
            write: self.write.snapshot(),
        }
    }

    /// Current report; has no effect on the counters
    pub fn report(&self) -> StatsReport {
        StatsReport::from(self.snapshot())
    }

    #[cfg(test)]
    pub(crate) fn preset(read: DirectionSnapshot, write: DirectionSnapshot) -> Self {
        let stats = Self::new();
        stats.read.ops.store(read.ops, Ordering::Relaxed);
        stats.read.bytes.store(read.bytes, Ordering::Relaxed);
        stats.write.ops.store(write.ops, Ordering::Relaxed);
        stats.write.bytes.store(write.bytes, Ordering::Relaxed);
        stats
    }
}

impl Default for IoStatistics {
    fn default() -> Self {
        Self::new()
    }
}
