use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::time::Instant;

use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use strata_common::{global_metrics, Result, StrataError};
use tracing::debug;

use crate::layout::SpillFile;
use crate::partition::{update_stats, SpillPartition, SpillStatsHandle};
use crate::writer::{SPILL_FILE_HEADER_LEN, SPILL_FILE_MAGIC, SPILL_FILE_VERSION};

struct CurrentFile {
    reader: StreamReader<BufReader<File>>,
    file: SpillFile,
}

/// Reads back every batch of one spilled partition, file by file, in no
/// particular row order. Each file is deleted as soon as it has been read
/// in full; unread files are deleted when the reader is dropped.
pub struct UnorderedSpillReader {
    pending: VecDeque<SpillFile>,
    current: Option<CurrentFile>,
    read_buffer_size: usize,
    stats: SpillStatsHandle,
    operator: String,
}

impl UnorderedSpillReader {
    pub fn new(partition: SpillPartition, read_buffer_size: usize, stats: SpillStatsHandle) -> Self {
        Self {
            pending: partition.into_files().into(),
            current: None,
            read_buffer_size: read_buffer_size.max(SPILL_FILE_HEADER_LEN),
            stats,
            operator: "spill".to_string(),
        }
    }

    /// Operator label for the spill read metrics.
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    /// Next spilled batch, or `None` once the partition is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if self.current.is_none() {
                let Some(file) = self.pending.pop_front() else {
                    return Ok(None);
                };
                self.current = Some(self.open(file)?);
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };

            let start = Instant::now();
            match current.reader.next() {
                Some(Ok(batch)) => {
                    let nanos = start.elapsed().as_nanos() as u64;
                    update_stats(&self.stats, |s| {
                        s.spill_deserialization_time_nanos += nanos;
                        s.spill_read_time_nanos += nanos;
                    });
                    return Ok(Some(batch));
                }
                Some(Err(e)) => {
                    return Err(StrataError::Execution(format!(
                        "spill ipc read of {} failed: {e}",
                        current.file.path.display()
                    )));
                }
                None => {
                    if let Some(done) = self.current.take() {
                        debug!(path = %done.file.path.display(), rows = done.file.rows, "consumed spill file");
                        fs::remove_file(&done.file.path)?;
                    }
                }
            }
        }
    }

    fn open(&self, file: SpillFile) -> Result<CurrentFile> {
        let start = Instant::now();
        let mut input = BufReader::with_capacity(self.read_buffer_size, File::open(&file.path)?);
        let mut header = [0_u8; SPILL_FILE_HEADER_LEN];
        input.read_exact(&mut header)?;
        if &header[0..4] != SPILL_FILE_MAGIC {
            return Err(StrataError::Execution(format!(
                "invalid spill file magic in {}",
                file.path.display()
            )));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SPILL_FILE_VERSION {
            return Err(StrataError::Execution(format!(
                "unsupported spill file version {version} in {}",
                file.path.display()
            )));
        }
        let reader = StreamReader::try_new(input, None)
            .map_err(|e| StrataError::Execution(format!("spill ipc reader init failed: {e}")))?;
        let nanos = start.elapsed().as_nanos() as u64;
        update_stats(&self.stats, |s| {
            s.spill_reads += 1;
            s.spill_read_bytes += file.bytes;
            s.spill_read_time_nanos += nanos;
        });
        global_metrics().record_spill_read(&self.operator, file.bytes);
        Ok(CurrentFile { reader, file })
    }
}

impl Iterator for UnorderedSpillReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

impl Drop for UnorderedSpillReader {
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            let _ = fs::remove_file(&current.file.path);
        }
        for file in self.pending.drain(..) {
            let _ = fs::remove_file(&file.path);
        }
    }
}
