//! Prometheus exporter for the global statistics
//!
//! # Prometheus Metrics
//!
//! - `dmp_read_requests_total` / `dmp_write_requests_total` - Requests counted
//! - `dmp_read_bytes` / `dmp_write_bytes` - Byte totals (rescaled near overflow)
//! - `dmp_read_avg_size_bytes` / `dmp_write_avg_size_bytes` - Average request size
//! - `dmp_requests_total` - Reads plus writes, saturating
//! - `dmp_avg_size_bytes` - Average size over both directions
//! - `dmp_volumes` - Registered volumes

use std::fmt::Write;

use crate::stats::{StatsReport, StatsSnapshot};

/// Prometheus exporter
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "dmp")
    prefix: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export counters in Prometheus text format
    pub fn export(&self, snapshot: &StatsSnapshot, volumes: usize) -> String {
        let mut output = String::with_capacity(2048);
        let report = StatsReport::from(*snapshot);

        for (dir, side, summary) in [
            ("read", snapshot.read, report.read),
            ("write", snapshot.write, report.write),
        ] {
            let name = format!("{dir}_requests_total");
            self.write_help(&mut output, &name, &format!("Total {dir} requests"));
            self.write_type(&mut output, &name, "counter");
            self.write_metric(&mut output, &name, summary.ops);

            let name = format!("{dir}_bytes");
            self.write_help(&mut output, &name, &format!("Bytes accounted to {dir}s"));
            self.write_type(&mut output, &name, "gauge");
            self.write_metric(&mut output, &name, side.bytes);

            let name = format!("{dir}_avg_size_bytes");
            self.write_help(&mut output, &name, &format!("Average {dir} request size"));
            self.write_type(&mut output, &name, "gauge");
            self.write_metric(&mut output, &name, summary.avg_size);
        }

        self.write_help(&mut output, "requests_total", "Total requests");
        self.write_type(&mut output, "requests_total", "counter");
        self.write_metric(&mut output, "requests_total", report.total.ops);

        self.write_help(&mut output, "avg_size_bytes", "Average request size");
        self.write_type(&mut output, "avg_size_bytes", "gauge");
        self.write_metric(&mut output, "avg_size_bytes", report.total.avg_size);

        self.write_help(&mut output, "volumes", "Registered volumes");
        self.write_type(&mut output, "volumes", "gauge");
        self.write_metric(&mut output, "volumes", volumes as u64);

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: u64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new(crate::TARGET_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Direction, IoStatistics};

    #[test]
    fn test_export() {
        let stats = IoStatistics::new();
        stats.record(Direction::Read, 4096);
        stats.record(Direction::Write, 100);
        stats.record(Direction::Write, 300);

        let output = PrometheusExporter::default().export(&stats.snapshot(), 2);
        assert!(output.contains("# TYPE dmp_read_requests_total counter\n"));
        assert!(output.contains("dmp_read_requests_total 1\n"));
        assert!(output.contains("dmp_write_avg_size_bytes 200\n"));
        assert!(output.contains("dmp_write_bytes 400\n"));
        assert!(output.contains("dmp_requests_total 3\n"));
        assert!(output.contains("dmp_volumes 2\n"));
    }

    #[test]
    fn test_custom_prefix() {
        let output = PrometheusExporter::new("blk").export(&StatsSnapshot::default(), 0);
        assert!(output.contains("blk_avg_size_bytes 0\n"));
    }
}
