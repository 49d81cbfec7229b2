use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Width in bits of the hash values used to derive spill partitions.
pub const HASH_BITS: u8 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size_rows: usize,
    pub mem_budget_bytes: usize,
    pub spill: SpillConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            mem_budget_bytes: 512 * 1024 * 1024,
            spill: SpillConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_rows == 0 {
            return Err(StrataError::InvalidConfig(
                "batch_size_rows must be positive".to_string(),
            ));
        }
        self.spill.validate()
    }
}

/// Spill settings shared by every spilling operator of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    pub enabled: bool,
    pub spill_dir: String,
    /// First hash bit used to pick the level-0 spill partition.
    pub start_partition_bit: u8,
    /// Number of hash bits consumed per spill level.
    pub num_partition_bits: u8,
    /// Deepest level a restored partition may be re-spilled at. `None` is unbounded.
    pub max_spill_level: Option<u8>,
    /// Roll over to a new spill file once the current one exceeds this size. 0 is unbounded.
    pub max_file_size: u64,
    /// Upper bound on rows written per spill batch.
    pub max_spill_run_rows: usize,
    pub read_buffer_size: usize,
    pub min_spillable_reservation_pct: u32,
    pub spillable_reservation_growth_pct: u32,
    /// Forces a spill on the next reservation check. Test-only.
    pub testing_trigger_spill: bool,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spill_dir: ".strata_spill".to_string(),
            start_partition_bit: 29,
            num_partition_bits: 3,
            max_spill_level: Some(4),
            max_file_size: 0,
            max_spill_run_rows: 64 * 1024,
            read_buffer_size: 1024 * 1024,
            min_spillable_reservation_pct: 5,
            spillable_reservation_growth_pct: 10,
            testing_trigger_spill: false,
        }
    }
}

impl SpillConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_partition_bits == 0 {
            return Err(StrataError::InvalidConfig(
                "num_partition_bits must be positive".to_string(),
            ));
        }
        if self.num_partition_bits > 16 {
            return Err(StrataError::InvalidConfig(format!(
                "num_partition_bits {} exceeds 16",
                self.num_partition_bits
            )));
        }
        if u16::from(self.start_partition_bit) + u16::from(self.num_partition_bits)
            > u16::from(HASH_BITS)
        {
            return Err(StrataError::InvalidConfig(format!(
                "partition bits [{}, {}) exceed hash width {HASH_BITS}",
                self.start_partition_bit,
                u16::from(self.start_partition_bit) + u16::from(self.num_partition_bits)
            )));
        }
        if self.max_spill_run_rows == 0 {
            return Err(StrataError::InvalidConfig(
                "max_spill_run_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Spill level of a partition whose bits start at `start_bit`.
    pub fn spill_level(&self, start_bit: u8) -> u8 {
        let bits = self.num_partition_bits.max(1);
        start_bit.saturating_sub(self.start_partition_bit) / bits
    }

    /// True when spilling at `start_bit` would exceed the level limit or run out of hash bits.
    pub fn exceed_spill_level_limit(&self, start_bit: u8) -> bool {
        if u16::from(start_bit) + u16::from(self.num_partition_bits) > u16::from(HASH_BITS) {
            return true;
        }
        match self.max_spill_level {
            Some(max_level) => self.spill_level(start_bit) > max_level,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_levels_follow_partition_bits() {
        let cfg = SpillConfig {
            start_partition_bit: 20,
            num_partition_bits: 2,
            max_spill_level: Some(1),
            ..SpillConfig::default()
        };
        assert_eq!(cfg.spill_level(20), 0);
        assert_eq!(cfg.spill_level(22), 1);
        assert_eq!(cfg.spill_level(24), 2);
        assert!(!cfg.exceed_spill_level_limit(22));
        assert!(cfg.exceed_spill_level_limit(24));
    }

    #[test]
    fn unbounded_level_still_limited_by_hash_width() {
        let cfg = SpillConfig {
            start_partition_bit: 60,
            num_partition_bits: 3,
            max_spill_level: None,
            ..SpillConfig::default()
        };
        assert!(!cfg.exceed_spill_level_limit(60));
        assert!(cfg.exceed_spill_level_limit(63));
    }

    #[test]
    fn rejects_zero_partition_bits() {
        let cfg = SpillConfig {
            num_partition_bits: 0,
            ..SpillConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"batch_size_rows": 128, "spill": {"num_partition_bits": 2}}"#)
                .expect("config");
        assert_eq!(cfg.batch_size_rows, 128);
        assert_eq!(cfg.spill.num_partition_bits, 2);
        assert_eq!(cfg.spill.start_partition_bit, 29);
        cfg.validate().expect("valid");
    }
}
