//! Hash-table and input spillers.
//!
//! Both spillers partition rows with a [`HashPartitionFunction`] over the
//! same key values and the same [`HashBitRange`], so partition `p` of the
//! hash-table spill and partition `p` of the input spill always cover the
//! same slice of the key space.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use arrow::array::UInt32Array;
use arrow::compute::take;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use strata_common::{global_metrics, Result, SpillConfig, StrataError};
use tracing::{debug, info};

use crate::partition::{
    update_stats, HashBitRange, HashPartitionFunction, SpillPartitionId, SpillPartitionSet,
    SpillStatsHandle,
};
use crate::writer::SpillWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillerKind {
    HashTable,
    Input,
}

impl SpillerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashTable => "hash_table",
            Self::Input => "input",
        }
    }
}

struct SpillerCore {
    kind: SpillerKind,
    operator: String,
    parent: Option<SpillPartitionId>,
    partition_fn: HashPartitionFunction,
    writer: SpillWriter,
    max_run_rows: usize,
    stats: SpillStatsHandle,
    partitions: Vec<u32>,
    started: Instant,
}

impl SpillerCore {
    fn new(
        kind: SpillerKind,
        operator: &str,
        schema: SchemaRef,
        key_channels: Vec<usize>,
        parent: Option<SpillPartitionId>,
        config: &SpillConfig,
        stats: SpillStatsHandle,
    ) -> Result<Self> {
        if !config.enabled {
            return Err(StrataError::InvalidConfig(format!(
                "{} spiller created for {operator} with spilling disabled",
                kind.as_str()
            )));
        }
        let bits = HashBitRange::for_partition(config, parent.as_ref())?;
        let partition_fn = HashPartitionFunction::new(bits, &schema, key_channels)?;
        let writer = SpillWriter::new(
            PathBuf::from(&config.spill_dir),
            &format!("{operator}-{}", kind.as_str()),
            schema,
            config.max_file_size,
            stats.clone(),
        );
        Ok(Self {
            kind,
            operator: operator.to_string(),
            parent,
            partition_fn,
            writer,
            max_run_rows: config.max_spill_run_rows.max(1),
            stats,
            partitions: Vec::new(),
            started: Instant::now(),
        })
    }

    fn partition_id(&self, partition: u32) -> SpillPartitionId {
        match &self.parent {
            Some(parent) => parent.child(partition),
            None => SpillPartitionId::new(partition),
        }
    }

    fn spill_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let fill_start = Instant::now();
        let mut partitions = std::mem::take(&mut self.partitions);
        let single = self.partition_fn.partition(batch, &mut partitions)?;

        let runs = match single {
            Some(p) => vec![(p, batch.clone())],
            None => {
                let mut indices = vec![Vec::<u32>::new(); self.partition_fn.num_partitions()];
                for (row, &p) in partitions.iter().enumerate() {
                    indices[p as usize].push(row as u32);
                }
                let mut runs = Vec::new();
                for (p, rows) in indices.into_iter().enumerate() {
                    if rows.is_empty() {
                        continue;
                    }
                    runs.push((p as u32, take_rows(batch, rows)?));
                }
                runs
            }
        };
        self.partitions = partitions;
        let fill_nanos = fill_start.elapsed().as_nanos() as u64;
        update_stats(&self.stats, |s| s.spill_fill_time_nanos += fill_nanos);

        for (p, run) in runs {
            let id = self.partition_id(p);
            let mut offset = 0;
            while offset < run.num_rows() {
                let len = self.max_run_rows.min(run.num_rows() - offset);
                self.writer.write(&id, &run.slice(offset, len))?;
                offset += len;
            }
        }
        Ok(())
    }

    fn finish(self, set: &mut SpillPartitionSet) -> Result<BTreeSet<SpillPartitionId>> {
        let kind = self.kind;
        let operator = self.operator.clone();
        let started = self.started;
        let partitions = self.writer.finish()?;
        let mut ids = BTreeSet::new();
        let mut bytes = 0;
        let mut rows = 0;
        for partition in partitions {
            bytes += partition.num_bytes();
            rows += partition.num_rows();
            ids.insert(partition.id().clone());
            set.insert(partition);
        }
        let secs = started.elapsed().as_secs_f64();
        global_metrics().record_spill(&operator, kind.as_str(), bytes, rows, secs);
        info!(
            operator = %operator,
            kind = kind.as_str(),
            partitions = ids.len(),
            rows,
            bytes,
            "spill finished"
        );
        Ok(ids)
    }
}

fn take_rows(batch: &RecordBatch, rows: Vec<u32>) -> Result<RecordBatch> {
    let indices = UInt32Array::from(rows);
    let columns = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StrataError::Execution(format!("spill partition take failed: {e}")))?;
    RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| StrataError::Execution(format!("spill partition batch failed: {e}")))
}

/// Spills the rows of an operator hash table.
///
/// Rows are `(key columns..., accumulator columns...)`, with the keys in the
/// first `num_keys` columns.
pub struct HashTableSpiller {
    core: SpillerCore,
}

impl HashTableSpiller {
    pub fn new(
        operator: &str,
        table_schema: SchemaRef,
        num_keys: usize,
        parent: Option<SpillPartitionId>,
        config: &SpillConfig,
        stats: SpillStatsHandle,
    ) -> Result<Self> {
        let core = SpillerCore::new(
            SpillerKind::HashTable,
            operator,
            table_schema,
            (0..num_keys).collect(),
            parent,
            config,
            stats,
        )?;
        Ok(Self { core })
    }

    pub fn hash_bits(&self) -> HashBitRange {
        self.core.partition_fn.bits()
    }

    /// Spill the whole table in one run.
    pub fn spill(&mut self, rows: impl IntoIterator<Item = RecordBatch>) -> Result<()> {
        update_stats(&self.core.stats, |s| s.spill_runs += 1);
        for batch in rows {
            self.core.spill_batch(&batch)?;
        }
        debug!(operator = %self.core.operator, "hash table spilled");
        Ok(())
    }

    /// Close all files, merge them into `set`, and return the spilled ids.
    pub fn finish_spill(self, set: &mut SpillPartitionSet) -> Result<BTreeSet<SpillPartitionId>> {
        self.core.finish(set)
    }
}

/// Spills raw input batches by the same partitioning as the hash table.
pub struct InputSpiller {
    core: SpillerCore,
}

impl InputSpiller {
    pub fn new(
        operator: &str,
        input_schema: SchemaRef,
        key_channels: Vec<usize>,
        parent: Option<SpillPartitionId>,
        config: &SpillConfig,
        stats: SpillStatsHandle,
    ) -> Result<Self> {
        let core = SpillerCore::new(
            SpillerKind::Input,
            operator,
            input_schema,
            key_channels,
            parent,
            config,
            stats,
        )?;
        Ok(Self { core })
    }

    pub fn hash_bits(&self) -> HashBitRange {
        self.core.partition_fn.bits()
    }

    pub fn spill(&mut self, input: &RecordBatch) -> Result<()> {
        self.core.spill_batch(input)
    }

    pub fn finish_spill(self, set: &mut SpillPartitionSet) -> Result<BTreeSet<SpillPartitionId>> {
        self.core.finish(set)
    }
}
