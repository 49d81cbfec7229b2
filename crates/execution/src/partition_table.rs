//! Hash table from partition keys to a running row count.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use strata_common::{Result, StrataError};

/// Per-entry bookkeeping on top of the normalized key bytes.
const ENTRY_OVERHEAD_BYTES: usize = 96;

/// Name of the count column in spilled table rows.
pub const COUNT_COLUMN: &str = "count";

/// Groups rows by their partition key columns and stores one `count` per group.
///
/// Keys are normalized with an Arrow [`RowConverter`] and kept in insertion
/// order, so the table can be turned back into `(keys..., count)` batches
/// for spilling.
#[derive(Debug)]
pub struct PartitionTable {
    key_channels: Vec<usize>,
    table_schema: SchemaRef,
    converter: RowConverter,
    groups: HashMap<Arc<[u8]>, usize>,
    keys: Vec<Arc<[u8]>>,
    counts: Vec<i64>,
    key_bytes: usize,
}

impl PartitionTable {
    /// Table keyed by `key_channels` of `input_schema`.
    pub fn try_new(input_schema: &Schema, key_channels: Vec<usize>) -> Result<Self> {
        let mut fields = Vec::with_capacity(key_channels.len() + 1);
        let mut sort_fields = Vec::with_capacity(key_channels.len());
        for &k in &key_channels {
            let field = input_schema.fields().get(k).ok_or_else(|| {
                StrataError::InvalidConfig(format!("partition key {k} out of range"))
            })?;
            sort_fields.push(SortField::new(field.data_type().clone()));
            fields.push(field.clone());
        }
        fields.push(Arc::new(Field::new(COUNT_COLUMN, DataType::Int64, false)));
        let converter = RowConverter::new(sort_fields)
            .map_err(|e| StrataError::Execution(format!("row converter init failed: {e}")))?;
        Ok(Self {
            key_channels,
            table_schema: Arc::new(Schema::new(fields)),
            converter,
            groups: HashMap::new(),
            keys: Vec::new(),
            counts: Vec::new(),
            key_bytes: 0,
        })
    }

    /// Number of partition key columns.
    pub fn num_keys(&self) -> usize {
        self.key_channels.len()
    }

    /// Input column indices of the keys.
    pub fn key_channels(&self) -> &[usize] {
        &self.key_channels
    }

    /// Schema of spilled table rows: key columns followed by `count`.
    pub fn table_schema(&self) -> &SchemaRef {
        &self.table_schema
    }

    /// Number of distinct keys seen.
    pub fn num_distinct(&self) -> usize {
        self.counts.len()
    }

    /// Find or insert the group of every row of `input`. New groups start at count 0.
    pub fn group_probe(&mut self, input: &RecordBatch) -> Result<Vec<usize>> {
        let keys = self
            .key_channels
            .iter()
            .map(|&i| input.column(i).clone())
            .collect::<Vec<_>>();
        self.probe_keys(&keys)
    }

    /// Same as [`Self::group_probe`] over the key columns alone.
    pub fn probe_keys(&mut self, keys: &[ArrayRef]) -> Result<Vec<usize>> {
        let rows = self
            .converter
            .convert_columns(keys)
            .map_err(|e| StrataError::Execution(format!("key row conversion failed: {e}")))?;
        let mut hits = Vec::with_capacity(rows.num_rows());
        for row in rows.iter() {
            let bytes = row.as_ref();
            let group = match self.groups.get(bytes) {
                Some(&group) => group,
                None => {
                    let key: Arc<[u8]> = Arc::from(bytes);
                    let group = self.counts.len();
                    self.key_bytes += key.len();
                    self.groups.insert(key.clone(), group);
                    self.keys.push(key);
                    self.counts.push(0);
                    group
                }
            };
            hits.push(group);
        }
        Ok(hits)
    }

    /// Rows numbered so far in `group`.
    pub fn count(&self, group: usize) -> i64 {
        self.counts[group]
    }

    /// Overwrite the count of `group`.
    pub fn set_count(&mut self, group: usize, count: i64) {
        self.counts[group] = count;
    }

    /// Merge spilled `(keys..., count)` rows back into the table.
    pub fn restore(&mut self, rows: &RecordBatch) -> Result<()> {
        let num_keys = self.num_keys();
        if rows.num_columns() != num_keys + 1 {
            return Err(StrataError::Internal(format!(
                "spilled table rows have {} columns, expected {}",
                rows.num_columns(),
                num_keys + 1
            )));
        }
        let counts = rows
            .column(num_keys)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| {
                StrataError::Internal("spilled table count column is not Int64".to_string())
            })?
            .clone();
        let hits = self.probe_keys(&rows.columns()[..num_keys])?;
        for (row, group) in hits.into_iter().enumerate() {
            self.counts[group] = counts.value(row);
        }
        Ok(())
    }

    /// Estimated bytes held by the table.
    pub fn memory_bytes(&self) -> usize {
        self.key_bytes
            + self.counts.len() * (ENTRY_OVERHEAD_BYTES + std::mem::size_of::<i64>())
    }

    /// Upper bound of growth when `num_rows` new rows all start new groups.
    pub fn size_increase(&self, num_rows: usize) -> usize {
        let avg_key_bytes = if self.counts.is_empty() {
            0
        } else {
            self.key_bytes.div_ceil(self.counts.len())
        };
        num_rows * (avg_key_bytes + ENTRY_OVERHEAD_BYTES + std::mem::size_of::<i64>())
    }

    /// Table contents as `(keys..., count)` batches of at most `max_rows` rows.
    pub fn to_batches(&self, max_rows: usize) -> Result<Vec<RecordBatch>> {
        let max_rows = max_rows.max(1);
        let parser = self.converter.parser();
        let mut batches = Vec::new();
        let mut start = 0;
        while start < self.keys.len() {
            let end = (start + max_rows).min(self.keys.len());
            let mut columns = self
                .converter
                .convert_rows(self.keys[start..end].iter().map(|k| parser.parse(k)))
                .map_err(|e| StrataError::Execution(format!("key row decode failed: {e}")))?;
            columns.push(Arc::new(Int64Array::from(self.counts[start..end].to_vec())));
            let batch = RecordBatch::try_new(self.table_schema.clone(), columns)
                .map_err(|e| StrataError::Execution(format!("table batch failed: {e}")))?;
            batches.push(batch);
            start = end;
        }
        Ok(batches)
    }

    /// Drop every group and free the storage.
    pub fn clear(&mut self) {
        self.groups = HashMap::new();
        self.keys = Vec::new();
        self.counts = Vec::new();
        self.key_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, StringArray};

    use super::*;

    fn input() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("v", DataType::Int64, false),
            Field::new("k", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1_i64, 2, 3, 4, 5])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None, Some("a"), None])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn probe_groups_rows_including_null_keys() {
        let batch = input();
        let mut table = PartitionTable::try_new(&batch.schema(), vec![1]).expect("table");
        let hits = table.group_probe(&batch).expect("probe");
        assert_eq!(hits, vec![0, 1, 2, 0, 2]);
        assert_eq!(table.num_distinct(), 3);
        assert!(hits.iter().all(|&g| table.count(g) == 0));
        assert!(table.memory_bytes() >= 3 * ENTRY_OVERHEAD_BYTES);
        assert!(table.size_increase(10) > table.size_increase(1));
    }

    #[test]
    fn spilled_rows_restore_counts() {
        let batch = input();
        let mut table = PartitionTable::try_new(&batch.schema(), vec![1]).expect("table");
        let hits = table.group_probe(&batch).expect("probe");
        for (i, g) in hits.iter().enumerate() {
            table.set_count(*g, i as i64 + 1);
        }
        let spilled = table.to_batches(2).expect("batches");
        assert_eq!(spilled.len(), 2);
        assert_eq!(spilled[0].schema().field(1).name(), COUNT_COLUMN);
        let keys = spilled[1]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert!(keys.is_null(0));

        table.clear();
        assert_eq!(table.num_distinct(), 0);
        assert_eq!(table.memory_bytes(), 0);

        for b in &spilled {
            table.restore(b).expect("restore");
        }
        let hits = table.group_probe(&batch).expect("probe");
        assert_eq!(table.count(hits[0]), 4);
        assert_eq!(table.count(hits[1]), 2);
        assert_eq!(table.count(hits[2]), 5);
    }
}
