//! Load local parquet files into a [`ColumnarTable`].

use std::fs::File;
use std::path::Path;

use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use strata_common::{Result, StrataError};
use tracing::info;

use crate::table::ColumnarTable;

/// Read `path` into a table with one row group per decoded batch of up to
/// `batch_size` rows.
pub fn load_parquet(path: impl AsRef<Path>, batch_size: usize) -> Result<ColumnarTable> {
    let path = path.as_ref();
    if batch_size == 0 {
        return Err(StrataError::InvalidConfig(
            "parquet load batch size must be positive".to_string(),
        ));
    }
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| StrataError::Execution(format!("parquet reader build failed: {e}")))?;
    let schema = builder.schema().clone();
    let reader = builder
        .with_batch_size(batch_size)
        .build()
        .map_err(|e| StrataError::Execution(format!("parquet reader open failed: {e}")))?;

    let batches = reader
        .map(|batch| batch.map_err(|e| StrataError::Execution(format!("parquet decode failed: {e}"))))
        .collect::<Result<Vec<RecordBatch>>>()?;
    let table = ColumnarTable::from_batches(schema, &batches)?;
    info!(
        path = %path.display(),
        rows = table.num_rows(),
        row_groups = table.row_groups().len(),
        "loaded parquet file"
    );
    Ok(table)
}
