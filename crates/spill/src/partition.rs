//! Hash-bit partitioning of spilled rows.
//!
//! A spill level consumes `num_partition_bits` bits of the 64-bit row hash,
//! starting at `start_partition_bit`. A partition restored at level `n` that
//! spills again partitions its rows by the next `num_partition_bits` bits, so
//! every [`SpillPartitionId`] names a disjoint slice of the hash space.

use std::collections::btree_map::Entry;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use strata_common::{Result, SpillConfig, SpillStats, StrataError, HASH_BITS};

use crate::layout::SpillFile;
use crate::reader::UnorderedSpillReader;

/// Spill statistics shared between an operator and its spillers and readers.
pub type SpillStatsHandle = Arc<Mutex<SpillStats>>;

pub(crate) fn update_stats(stats: &SpillStatsHandle, f: impl FnOnce(&mut SpillStats)) {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

/// Half-open range `[begin, end)` of hash bits selecting a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashBitRange {
    begin: u8,
    end: u8,
}

impl HashBitRange {
    pub fn new(begin: u8, end: u8) -> Result<Self> {
        if begin >= end || end > HASH_BITS || end - begin > 16 {
            return Err(StrataError::InvalidConfig(format!(
                "invalid hash bit range [{begin}, {end})"
            )));
        }
        Ok(Self { begin, end })
    }

    /// Bits used by the children of `parent`, or the level-0 bits without a parent.
    pub fn for_partition(config: &SpillConfig, parent: Option<&SpillPartitionId>) -> Result<Self> {
        let begin = match parent {
            Some(parent) => {
                u16::from(parent.partition_bit_offset(config))
                    + u16::from(config.num_partition_bits)
            }
            None => u16::from(config.start_partition_bit),
        };
        let end = begin + u16::from(config.num_partition_bits);
        if end > u16::from(HASH_BITS) {
            return Err(StrataError::InvalidConfig(format!(
                "spill partition bits [{begin}, {end}) exceed hash width {HASH_BITS}"
            )));
        }
        Self::new(begin as u8, end as u8)
    }

    pub fn begin(&self) -> u8 {
        self.begin
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    pub fn num_bits(&self) -> u8 {
        self.end - self.begin
    }

    pub fn num_partitions(&self) -> usize {
        1 << self.num_bits()
    }

    pub fn partition(&self, hash: u64) -> u32 {
        let mask = (1_u64 << self.num_bits()) - 1;
        ((hash >> self.begin) & mask) as u32
    }
}

/// Path of partition numbers from level 0 down to the partition itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpillPartitionId {
    path: Vec<u32>,
}

impl SpillPartitionId {
    /// Level-0 partition.
    pub fn new(partition_number: u32) -> Self {
        Self {
            path: vec![partition_number],
        }
    }

    /// Partition `partition_number` of the next level below `self`.
    pub fn child(&self, partition_number: u32) -> Self {
        let mut path = self.path.clone();
        path.push(partition_number);
        Self { path }
    }

    pub fn spill_level(&self) -> u8 {
        (self.path.len() - 1) as u8
    }

    pub fn partition_number(&self) -> u32 {
        self.path.last().copied().unwrap_or_default()
    }

    /// First hash bit that selected this partition.
    pub fn partition_bit_offset(&self, config: &SpillConfig) -> u8 {
        config
            .start_partition_bit
            .saturating_add(self.spill_level().saturating_mul(config.num_partition_bits))
    }

    pub(crate) fn file_tag(&self) -> String {
        self.path
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for SpillPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.spill_level(), self.partition_number())
    }
}

/// All files spilled for one partition, in write order.
#[derive(Debug, Clone)]
pub struct SpillPartition {
    id: SpillPartitionId,
    files: Vec<SpillFile>,
}

impl SpillPartition {
    pub fn new(id: SpillPartitionId, files: Vec<SpillFile>) -> Self {
        Self { id, files }
    }

    pub fn id(&self) -> &SpillPartitionId {
        &self.id
    }

    pub fn files(&self) -> &[SpillFile] {
        &self.files
    }

    pub fn num_rows(&self) -> u64 {
        self.files.iter().map(|f| f.rows).sum()
    }

    pub fn num_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    /// Reader that yields every batch of the partition and deletes each file once read.
    pub fn into_reader(self, read_buffer_size: usize, stats: SpillStatsHandle) -> UnorderedSpillReader {
        UnorderedSpillReader::new(self, read_buffer_size, stats)
    }

    pub(crate) fn into_files(self) -> Vec<SpillFile> {
        self.files
    }

    /// Remove the partition's files without reading them.
    pub fn delete_files(self) {
        for file in self.files {
            let _ = std::fs::remove_file(&file.path);
        }
    }
}

/// Spilled partitions keyed by id; ids never overlap in hash space.
#[derive(Debug, Default)]
pub struct SpillPartitionSet {
    partitions: BTreeMap<SpillPartitionId, SpillPartition>,
}

impl SpillPartitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition, appending its files when the id is already present.
    pub fn insert(&mut self, partition: SpillPartition) {
        match self.partitions.entry(partition.id.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().files.extend(partition.files),
            Entry::Vacant(slot) => {
                slot.insert(partition);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn contains(&self, id: &SpillPartitionId) -> bool {
        self.partitions.contains_key(id)
    }

    pub fn get(&self, id: &SpillPartitionId) -> Option<&SpillPartition> {
        self.partitions.get(id)
    }

    pub fn ids(&self) -> BTreeSet<SpillPartitionId> {
        self.partitions.keys().cloned().collect()
    }

    /// Take the lowest id; children of a restored partition come before its siblings.
    pub fn pop_first(&mut self) -> Option<SpillPartition> {
        self.partitions.pop_first().map(|(_, p)| p)
    }

    pub fn remove(&mut self, id: &SpillPartitionId) -> Option<SpillPartition> {
        self.partitions.remove(id)
    }

    /// Drop partitions that ended up without rows.
    pub fn remove_empty(&mut self) {
        let empty = self
            .partitions
            .iter()
            .filter(|(_, p)| p.num_rows() == 0)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in empty {
            if let Some(p) = self.partitions.remove(&id) {
                p.delete_files();
            }
        }
    }

    pub fn num_rows(&self) -> u64 {
        self.partitions.values().map(SpillPartition::num_rows).sum()
    }

    /// Delete every remaining file.
    pub fn clear(&mut self) {
        while let Some(p) = self.pop_first() {
            p.delete_files();
        }
    }
}

/// Hashes the key columns of a batch and maps every row to a partition of a [`HashBitRange`].
///
/// Keys are normalized with an Arrow [`RowConverter`], so the same key values
/// hash identically regardless of their column position in the batch.
#[derive(Debug)]
pub struct HashPartitionFunction {
    bits: HashBitRange,
    key_channels: Vec<usize>,
    converter: RowConverter,
}

impl HashPartitionFunction {
    pub fn new(bits: HashBitRange, schema: &Schema, key_channels: Vec<usize>) -> Result<Self> {
        if key_channels.is_empty() {
            return Err(StrataError::InvalidConfig(
                "hash partitioning needs at least one key column".to_string(),
            ));
        }
        let fields = key_channels
            .iter()
            .map(|&i| {
                schema
                    .fields()
                    .get(i)
                    .map(|f| SortField::new(f.data_type().clone()))
                    .ok_or_else(|| {
                        StrataError::InvalidConfig(format!(
                            "key channel {i} out of range for schema with {} fields",
                            schema.fields().len()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let converter = RowConverter::new(fields)
            .map_err(|e| StrataError::Execution(format!("row converter init failed: {e}")))?;
        Ok(Self {
            bits,
            key_channels,
            converter,
        })
    }

    pub fn bits(&self) -> HashBitRange {
        self.bits
    }

    pub fn num_partitions(&self) -> usize {
        self.bits.num_partitions()
    }

    pub fn key_channels(&self) -> &[usize] {
        &self.key_channels
    }

    /// 64-bit hash of every row's key columns.
    pub fn hash_rows(&self, batch: &RecordBatch) -> Result<Vec<u64>> {
        let keys = self
            .key_channels
            .iter()
            .map(|&i| batch.column(i).clone())
            .collect::<Vec<_>>();
        let rows = self
            .converter
            .convert_columns(&keys)
            .map_err(|e| StrataError::Execution(format!("key row conversion failed: {e}")))?;
        Ok(rows.iter().map(|row| hash_key_bytes(row.as_ref())).collect())
    }

    /// Fill `partitions` with one partition per row. Returns the partition
    /// when every row landed in the same one.
    pub fn partition(&self, batch: &RecordBatch, partitions: &mut Vec<u32>) -> Result<Option<u32>> {
        partitions.clear();
        partitions.extend(self.hash_rows(batch)?.into_iter().map(|h| self.bits.partition(h)));
        let single = match partitions.first() {
            Some(&first) if partitions.iter().all(|&p| p == first) => Some(first),
            _ => None,
        };
        Ok(single)
    }
}

/// Deterministic hash of normalized key bytes.
pub fn hash_key_bytes(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    bytes.hash(&mut h);
    h.finish()
}
