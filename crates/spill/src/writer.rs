use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use strata_common::{Result, StrataError};
use tracing::debug;

use crate::layout::{spill_file_path, SpillFile};
use crate::partition::{update_stats, SpillPartition, SpillPartitionId, SpillStatsHandle};

pub(crate) const SPILL_FILE_MAGIC: &[u8; 4] = b"STSP";
pub(crate) const SPILL_FILE_VERSION: u32 = 1;
pub(crate) const SPILL_FILE_HEADER_LEN: usize = 8;

static NEXT_SPILL_RUN: AtomicU64 = AtomicU64::new(0);

struct OpenSpillFile {
    writer: StreamWriter<BufWriter<File>>,
    path: PathBuf,
    rows: u64,
    batches: u64,
}

impl OpenSpillFile {
    fn size(&self) -> Result<u64> {
        let buffered = self.writer.get_ref();
        Ok(buffered.get_ref().metadata()?.len() + buffered.buffer().len() as u64)
    }
}

/// Appends batches to per-partition spill files.
///
/// Each file starts with a magic/version header followed by an Arrow IPC
/// stream. A file is closed and a new one started once it reaches
/// `max_file_size` bytes (0 disables the limit).
pub struct SpillWriter {
    root_dir: PathBuf,
    prefix: String,
    schema: SchemaRef,
    max_file_size: u64,
    open: BTreeMap<SpillPartitionId, OpenSpillFile>,
    closed: BTreeMap<SpillPartitionId, Vec<SpillFile>>,
    next_seq: u32,
    stats: SpillStatsHandle,
}

impl SpillWriter {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        prefix: &str,
        schema: SchemaRef,
        max_file_size: u64,
        stats: SpillStatsHandle,
    ) -> Self {
        let run = NEXT_SPILL_RUN.fetch_add(1, Ordering::Relaxed);
        Self {
            root_dir: root_dir.into(),
            prefix: format!("{prefix}-{}-{run}", std::process::id()),
            schema,
            max_file_size,
            open: BTreeMap::new(),
            closed: BTreeMap::new(),
            next_seq: 0,
            stats,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Append `batch` to the current file of `partition`.
    pub fn write(&mut self, partition: &SpillPartitionId, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if batch.schema() != self.schema {
            return Err(StrataError::Internal(format!(
                "spill batch schema {:?} does not match spill file schema {:?}",
                batch.schema(),
                self.schema
            )));
        }
        if !self.open.contains_key(partition) {
            let file = self.create_file(partition)?;
            self.open.insert(partition.clone(), file);
        }
        let Some(file) = self.open.get_mut(partition) else {
            return Err(StrataError::Internal(format!(
                "spill file for partition {partition} is not open"
            )));
        };

        let start = Instant::now();
        file.writer
            .write(batch)
            .map_err(|e| StrataError::Execution(format!("spill ipc write failed: {e}")))?;
        let write_nanos = start.elapsed().as_nanos() as u64;
        file.rows += batch.num_rows() as u64;
        file.batches += 1;
        update_stats(&self.stats, |s| {
            s.spill_writes += 1;
            s.spilled_rows += batch.num_rows() as u64;
            s.spilled_input_bytes += batch.get_array_memory_size() as u64;
            s.spill_serialization_time_nanos += write_nanos;
            s.spill_write_time_nanos += write_nanos;
        });

        if self.max_file_size > 0 && file.size()? >= self.max_file_size {
            if let Some(full) = self.open.remove(partition) {
                let closed = self.close_file(partition, full)?;
                self.closed.entry(partition.clone()).or_default().push(closed);
            }
        }
        Ok(())
    }

    /// Close all open files and return the spilled partitions.
    pub fn finish(mut self) -> Result<Vec<SpillPartition>> {
        let open = std::mem::take(&mut self.open);
        for (id, file) in open {
            let closed = self.close_file(&id, file)?;
            self.closed.entry(id).or_default().push(closed);
        }
        let partitions = std::mem::take(&mut self.closed)
            .into_iter()
            .map(|(id, files)| SpillPartition::new(id, files))
            .collect::<Vec<_>>();
        update_stats(&self.stats, |s| {
            s.spilled_partitions += partitions.len() as u64;
        });
        Ok(partitions)
    }

    fn create_file(&mut self, partition: &SpillPartitionId) -> Result<OpenSpillFile> {
        fs::create_dir_all(&self.root_dir)?;
        let path = spill_file_path(&self.root_dir, &self.prefix, partition, self.next_seq);
        self.next_seq += 1;

        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(SPILL_FILE_MAGIC)?;
        out.write_all(&SPILL_FILE_VERSION.to_le_bytes())?;
        let writer = StreamWriter::try_new(out, self.schema.as_ref())
            .map_err(|e| StrataError::Execution(format!("spill ipc writer init failed: {e}")))?;
        update_stats(&self.stats, |s| s.spilled_files += 1);
        debug!(path = %path.display(), partition = %partition, "opened spill file");
        Ok(OpenSpillFile {
            writer,
            path,
            rows: 0,
            batches: 0,
        })
    }

    fn close_file(&self, partition: &SpillPartitionId, file: OpenSpillFile) -> Result<SpillFile> {
        let start = Instant::now();
        let mut out = file
            .writer
            .into_inner()
            .map_err(|e| StrataError::Execution(format!("spill ipc finish failed: {e}")))?;
        out.flush()?;
        let flush_nanos = start.elapsed().as_nanos() as u64;
        let bytes = fs::metadata(&file.path)?.len();
        update_stats(&self.stats, |s| {
            s.spilled_bytes += bytes;
            s.spill_flush_time_nanos += flush_nanos;
        });
        Ok(SpillFile {
            partition: partition.clone(),
            path: file.path,
            bytes,
            rows: file.rows,
            batches: file.batches,
        })
    }
}

impl Drop for SpillWriter {
    // Files of an abandoned writer are never read back.
    fn drop(&mut self) {
        for file in self.open.values() {
            let _ = fs::remove_file(&file.path);
        }
        for file in self.closed.values().flatten() {
            let _ = fs::remove_file(&file.path);
        }
    }
}
