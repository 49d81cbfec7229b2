//! Counters describing spill writes and restores of one operator.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{AddAssign, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    /// Number of times an operator spilled its state.
    pub spill_runs: u64,
    /// In-memory size of the batches handed to the spiller.
    pub spilled_input_bytes: u64,
    /// Bytes written to spill files.
    pub spilled_bytes: u64,
    pub spilled_rows: u64,
    pub spilled_partitions: u64,
    pub spilled_files: u64,
    /// Time spent gathering rows into spill batches.
    pub spill_fill_time_nanos: u64,
    pub spill_serialization_time_nanos: u64,
    pub spill_writes: u64,
    pub spill_flush_time_nanos: u64,
    pub spill_write_time_nanos: u64,
    /// Spill attempts abandoned because the partition was already at the deepest level.
    pub spill_max_level_exceeded_count: u64,
    pub spill_read_bytes: u64,
    pub spill_reads: u64,
    pub spill_read_time_nanos: u64,
    pub spill_deserialization_time_nanos: u64,
}

impl SpillStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn counters(&self) -> [u64; 16] {
        [
            self.spill_runs,
            self.spilled_input_bytes,
            self.spilled_bytes,
            self.spilled_rows,
            self.spilled_partitions,
            self.spilled_files,
            self.spill_fill_time_nanos,
            self.spill_serialization_time_nanos,
            self.spill_writes,
            self.spill_flush_time_nanos,
            self.spill_write_time_nanos,
            self.spill_max_level_exceeded_count,
            self.spill_read_bytes,
            self.spill_reads,
            self.spill_read_time_nanos,
            self.spill_deserialization_time_nanos,
        ]
    }
}

impl AddAssign<&SpillStats> for SpillStats {
    fn add_assign(&mut self, other: &SpillStats) {
        self.spill_runs += other.spill_runs;
        self.spilled_input_bytes += other.spilled_input_bytes;
        self.spilled_bytes += other.spilled_bytes;
        self.spilled_rows += other.spilled_rows;
        self.spilled_partitions += other.spilled_partitions;
        self.spilled_files += other.spilled_files;
        self.spill_fill_time_nanos += other.spill_fill_time_nanos;
        self.spill_serialization_time_nanos += other.spill_serialization_time_nanos;
        self.spill_writes += other.spill_writes;
        self.spill_flush_time_nanos += other.spill_flush_time_nanos;
        self.spill_write_time_nanos += other.spill_write_time_nanos;
        self.spill_max_level_exceeded_count += other.spill_max_level_exceeded_count;
        self.spill_read_bytes += other.spill_read_bytes;
        self.spill_reads += other.spill_reads;
        self.spill_read_time_nanos += other.spill_read_time_nanos;
        self.spill_deserialization_time_nanos += other.spill_deserialization_time_nanos;
    }
}

/// Growth between two snapshots of the same operator. Counters that went
/// backwards saturate at zero.
impl Sub for &SpillStats {
    type Output = SpillStats;

    fn sub(self, earlier: &SpillStats) -> SpillStats {
        SpillStats {
            spill_runs: self.spill_runs.saturating_sub(earlier.spill_runs),
            spilled_input_bytes: self
                .spilled_input_bytes
                .saturating_sub(earlier.spilled_input_bytes),
            spilled_bytes: self.spilled_bytes.saturating_sub(earlier.spilled_bytes),
            spilled_rows: self.spilled_rows.saturating_sub(earlier.spilled_rows),
            spilled_partitions: self
                .spilled_partitions
                .saturating_sub(earlier.spilled_partitions),
            spilled_files: self.spilled_files.saturating_sub(earlier.spilled_files),
            spill_fill_time_nanos: self
                .spill_fill_time_nanos
                .saturating_sub(earlier.spill_fill_time_nanos),
            spill_serialization_time_nanos: self
                .spill_serialization_time_nanos
                .saturating_sub(earlier.spill_serialization_time_nanos),
            spill_writes: self.spill_writes.saturating_sub(earlier.spill_writes),
            spill_flush_time_nanos: self
                .spill_flush_time_nanos
                .saturating_sub(earlier.spill_flush_time_nanos),
            spill_write_time_nanos: self
                .spill_write_time_nanos
                .saturating_sub(earlier.spill_write_time_nanos),
            spill_max_level_exceeded_count: self
                .spill_max_level_exceeded_count
                .saturating_sub(earlier.spill_max_level_exceeded_count),
            spill_read_bytes: self.spill_read_bytes.saturating_sub(earlier.spill_read_bytes),
            spill_reads: self.spill_reads.saturating_sub(earlier.spill_reads),
            spill_read_time_nanos: self
                .spill_read_time_nanos
                .saturating_sub(earlier.spill_read_time_nanos),
            spill_deserialization_time_nanos: self
                .spill_deserialization_time_nanos
                .saturating_sub(earlier.spill_deserialization_time_nanos),
        }
    }
}

/// Snapshots are ordered only when every counter moved in the same direction.
impl PartialOrd for SpillStats {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for (a, b) in self.counters().iter().zip(other.counters().iter()) {
            match a.cmp(b) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

impl fmt::Display for SpillStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spill_runs[{}] spilled_input_bytes[{}] spilled_bytes[{}] spilled_rows[{}] \
             spilled_partitions[{}] spilled_files[{}] spill_fill_time[{}] \
             spill_serialization_time[{}] spill_writes[{}] spill_flush_time[{}] \
             spill_write_time[{}] max_spill_level_exceeded_count[{}] spill_read_bytes[{}] \
             spill_reads[{}] spill_read_time[{}] spill_deserialization_time[{}]",
            self.spill_runs,
            succinct_bytes(self.spilled_input_bytes),
            succinct_bytes(self.spilled_bytes),
            self.spilled_rows,
            self.spilled_partitions,
            self.spilled_files,
            succinct_nanos(self.spill_fill_time_nanos),
            succinct_nanos(self.spill_serialization_time_nanos),
            self.spill_writes,
            succinct_nanos(self.spill_flush_time_nanos),
            succinct_nanos(self.spill_write_time_nanos),
            self.spill_max_level_exceeded_count,
            succinct_bytes(self.spill_read_bytes),
            self.spill_reads,
            succinct_nanos(self.spill_read_time_nanos),
            succinct_nanos(self.spill_deserialization_time_nanos),
        )
    }
}

/// Render a byte count with two decimals in the largest fitting binary unit.
pub fn succinct_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

/// Render a nanosecond duration with two decimals in the largest fitting unit.
pub fn succinct_nanos(nanos: u64) -> String {
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    let value = nanos as f64;
    if nanos < 1_000_000 {
        format!("{:.2}us", value / 1e3)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", value / 1e6)
    } else {
        format!("{:.2}s", value / 1e9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(base: u64) -> SpillStats {
        SpillStats {
            spill_runs: 100,
            spilled_input_bytes: 2048,
            spilled_bytes: 1024,
            spilled_rows: base + 8,
            spilled_partitions: base + 1,
            spilled_files: base + 3,
            spill_fill_time_nanos: base + 7,
            spill_serialization_time_nanos: base + 9,
            spill_writes: base + 5,
            spill_flush_time_nanos: base + 4,
            spill_write_time_nanos: base + 3,
            spill_max_level_exceeded_count: 4,
            spill_read_bytes: 2048,
            spill_reads: 10,
            spill_read_time_nanos: 100,
            spill_deserialization_time_nanos: 100,
        }
    }

    #[test]
    fn orders_only_consistent_snapshots() {
        let mut earlier = sample(1000);
        earlier.spill_max_level_exceeded_count = 3;
        earlier.spill_read_bytes = 1024;
        let later = sample(1023);
        assert!(!earlier.is_empty());
        assert!(earlier < later);
        assert!(earlier <= later);
        assert!(!(earlier > later));
        assert!(earlier != later);
        assert_eq!(earlier.partial_cmp(&earlier), Some(Ordering::Equal));

        let delta = &later - &earlier;
        assert_eq!(delta.spilled_partitions, 23);
        assert_eq!(delta.spill_read_bytes, 1024);
        assert_eq!(delta.spill_max_level_exceeded_count, 1);
        assert_eq!(delta.spill_runs, 0);

        earlier.spilled_bytes = 4096;
        assert_eq!(earlier.partial_cmp(&later), None);
        assert!(!(earlier < later));
        assert!(!(earlier > later));

        earlier.reset();
        assert!(earlier.is_empty());
    }

    #[test]
    fn accumulates() {
        let mut total = SpillStats::default();
        total += &sample(0);
        total += &sample(0);
        assert_eq!(total.spill_runs, 200);
        assert_eq!(total.spilled_rows, 16);
    }

    #[test]
    fn renders_succinct_units() {
        let text = sample(1023).to_string();
        assert!(text.starts_with("spill_runs[100] spilled_input_bytes[2.00KB] spilled_bytes[1.00KB]"));
        assert!(text.contains("spill_fill_time[1.03us]"));
        assert!(text.contains("spill_read_time[100ns]"));
        assert_eq!(succinct_bytes(512), "512B");
        assert_eq!(succinct_bytes(3 * 1024 * 1024), "3.00MB");
        assert_eq!(succinct_nanos(2_500_000), "2.50ms");
    }
}
