//! Selective table scan.
//!
//! [`TableScan`] is a source operator over a [`ColumnarTable`]. Each output
//! batch covers up to `batch_size_rows` rows of one row group: filtering
//! columns are read first and narrow the row set, value hooks then see the
//! surviving rows, and projected columns are materialized last.

use std::any::Any;
use std::sync::Arc;

use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{Field, Schema, SchemaRef};
use strata_common::{global_metrics, OperatorId, Result, StrataError};
use strata_execution::{
    downcast_node, DriverContext, ExecNode, Operator, OperatorFactory, OperatorRegistry,
    PipelineExec, PlanNode, SendableRecordBatchStream, TaskContext,
};
use tracing::{debug, trace};

use crate::reader::{build_reader, ColumnReader, ColumnReaderStats};
use crate::scan_spec::ScanSpec;
use crate::table::ColumnarTable;

const OPERATOR_NAME: &str = "TableScan";

/// Position of the scan inside the current row group.
#[derive(Debug, Clone, Copy)]
struct RowGroupCursor {
    index: usize,
    num_rows: usize,
    offset: usize,
}

/// Source operator reading a [`ColumnarTable`] through a [`ScanSpec`].
pub struct TableScan {
    table: Arc<ColumnarTable>,
    /// One reader per spec column, in read order.
    readers: Vec<Box<dyn ColumnReader>>,
    projection: Vec<usize>,
    schema: SchemaRef,
    batch_size: usize,
    next_row_group: usize,
    cursor: Option<RowGroupCursor>,
    finished: bool,
    rows_out: u64,
}

impl TableScan {
    pub fn try_new(table: Arc<ColumnarTable>, spec: &ScanSpec, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(StrataError::InvalidConfig(
                "table scan batch size must be positive".to_string(),
            ));
        }
        let table_schema = table.schema();
        let readers = spec
            .columns()
            .iter()
            .map(|column| {
                let index = table_schema.index_of(&column.name).map_err(|_| {
                    StrataError::InvalidConfig(format!("table has no column {}", column.name))
                })?;
                build_reader(&table, vec![index], table_schema.field(index), column)
            })
            .collect::<Result<Vec<_>>>()?;
        let schema = Arc::new(Schema::new(
            spec.projection()
                .iter()
                .map(|i| Field::new(readers[*i].name(), readers[*i].output_type(), true))
                .collect::<Vec<_>>(),
        ));
        Ok(Self {
            table,
            readers,
            projection: spec.projection().to_vec(),
            schema,
            batch_size,
            next_row_group: 0,
            cursor: None,
            finished: false,
            rows_out: 0,
        })
    }

    /// Counters summed over all columns.
    pub fn stats(&self) -> ColumnReaderStats {
        let mut stats = ColumnReaderStats::default();
        for reader in &self.readers {
            stats += reader.stats();
        }
        stats
    }

    /// Counters of column `name`.
    pub fn column_stats(&self, name: &str) -> Option<ColumnReaderStats> {
        self.readers
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.stats())
    }

    fn row_group_can_match(&self, index: usize) -> bool {
        self.readers.iter().all(|r| r.can_match_row_group(index))
    }

    /// Row groups whose statistics admit a row passing every filter.
    pub fn filter_row_groups(&self) -> Vec<usize> {
        (0..self.table.row_groups().len())
            .filter(|i| self.row_group_can_match(*i))
            .collect()
    }

    /// Seek every reader to the next row group some row of which may pass
    /// all filters. Returns false when the table is exhausted.
    fn open_next_row_group(&mut self) -> Result<bool> {
        while self.next_row_group < self.table.row_groups().len() {
            let index = self.next_row_group;
            self.next_row_group += 1;
            if !self.row_group_can_match(index) {
                debug!(row_group = index, "statistics exclude row group");
                self.readers.iter_mut().for_each(|r| r.skip_row_group());
                continue;
            }
            for reader in &mut self.readers {
                reader.seek_to_row_group(index)?;
            }
            self.cursor = Some(RowGroupCursor {
                index,
                num_rows: self.table.row_group(index)?.num_rows,
                offset: 0,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Skip every reader to the end of the current row group.
    fn close_row_group(&mut self) -> Result<()> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(());
        };
        for reader in &mut self.readers {
            let at = reader.read_offset();
            if at < cursor.num_rows {
                reader.skip_rows(cursor.num_rows - at, None)?;
            }
            reader.check_row_group_consumed()?;
        }
        trace!(row_group = cursor.index, "row group done");
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        for reader in &self.readers {
            let stats = reader.stats();
            global_metrics().record_scan(
                reader.name(),
                stats.values_decoded,
                stats.row_groups_skipped,
                stats.compactions,
                stats.upcasts,
            );
        }
        debug!(
            rows_out = self.rows_out,
            row_groups = self.table.row_groups().len(),
            "table scan finished"
        );
    }

    /// Read the next batch of the current row group. `None` when every row
    /// of the batch was filtered out.
    fn read_batch(&mut self, cursor: RowGroupCursor) -> Result<Option<RecordBatch>> {
        let num_rows = self.batch_size.min(cursor.num_rows - cursor.offset);
        let mut rows = (0..num_rows).collect::<Vec<_>>();
        for reader in &mut self.readers {
            if rows.is_empty() {
                break;
            }
            reader.read(cursor.offset, &rows, None)?;
            if reader.has_filter() {
                rows = reader.output_rows().to_vec();
            }
        }
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.offset += num_rows;
        }
        if rows.is_empty() || self.projection.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(self.projection.len());
        for (i, field) in self.projection.iter().zip(self.schema.fields()) {
            let vector = self.readers[*i].get_values(&rows, true)?;
            columns.push(vector.into_array_of(field.data_type())?);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
        let batch = RecordBatch::try_new_with_options(self.schema.clone(), columns, &options)
            .map_err(|e| StrataError::Execution(format!("table scan batch: {e}")))?;
        self.rows_out += batch.num_rows() as u64;
        Ok(Some(batch))
    }
}

impl Operator for TableScan {
    fn name(&self) -> &str {
        OPERATOR_NAME
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _input: RecordBatch) -> Result<()> {
        Err(StrataError::Internal(
            "TableScan is a source operator and takes no input".to_string(),
        ))
    }

    fn no_more_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        while !self.finished {
            let cursor = match self.cursor {
                Some(cursor) if cursor.offset < cursor.num_rows => cursor,
                _ => {
                    self.close_row_group()?;
                    if !self.open_next_row_group()? {
                        self.finish();
                    }
                    continue;
                }
            };
            if let Some(batch) = self.read_batch(cursor)? {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Plan node of a [`TableScan`].
#[derive(Debug, Clone)]
pub struct TableScanNode {
    id: String,
    table: Arc<ColumnarTable>,
    spec: ScanSpec,
    schema: SchemaRef,
}

impl TableScanNode {
    /// Node kind of [`TableScanNode`].
    pub const KIND: &'static str = "TableScan";

    /// Scan of `table` through `spec`; fails when `spec` does not fit the table.
    pub fn try_new(id: impl Into<String>, table: Arc<ColumnarTable>, spec: ScanSpec) -> Result<Self> {
        let schema = TableScan::try_new(table.clone(), &spec, 1)?.output_schema();
        Ok(Self {
            id: id.into(),
            table,
            spec,
            schema,
        })
    }

    pub fn table(&self) -> &Arc<ColumnarTable> {
        &self.table
    }

    pub fn spec(&self) -> &ScanSpec {
        &self.spec
    }
}

impl PlanNode for TableScanNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TableScanFactory;

impl OperatorFactory for TableScanFactory {
    fn kind(&self) -> &str {
        TableScanNode::KIND
    }

    fn create(
        &self,
        node: &dyn PlanNode,
        _operator_id: OperatorId,
        ctx: &Arc<DriverContext>,
    ) -> Result<Box<dyn Operator>> {
        let scan = downcast_node::<TableScanNode>(node)?;
        Ok(Box::new(TableScan::try_new(
            scan.table.clone(),
            &scan.spec,
            ctx.task.batch_size_rows(),
        )?))
    }
}

/// Add the `TableScan` factory to `registry`.
pub fn register_table_scan(registry: &OperatorRegistry) {
    registry.register(Arc::new(TableScanFactory));
}

/// Registry with the execution built-ins and `TableScan`.
pub fn scan_registry() -> Arc<OperatorRegistry> {
    let registry = OperatorRegistry::with_builtins();
    register_table_scan(&registry);
    Arc::new(registry)
}

/// [`ExecNode`] streaming a table scan followed by optional downstream nodes.
pub struct SelectiveScanNode {
    pipeline: PipelineExec,
}

impl SelectiveScanNode {
    /// Scan alone.
    pub fn try_new(scan: TableScanNode) -> Result<Self> {
        Self::with_downstream(scan, Vec::new())
    }

    /// Scan feeding `downstream`, source first.
    pub fn with_downstream(scan: TableScanNode, downstream: Vec<Arc<dyn PlanNode>>) -> Result<Self> {
        let mut nodes: Vec<Arc<dyn PlanNode>> = vec![Arc::new(scan)];
        nodes.extend(downstream);
        Ok(Self {
            pipeline: PipelineExec::try_new(nodes, scan_registry())?,
        })
    }
}

impl ExecNode for SelectiveScanNode {
    fn name(&self) -> &'static str {
        "SelectiveScanNode"
    }

    fn schema(&self) -> SchemaRef {
        self.pipeline.schema()
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        self.pipeline.execute(ctx)
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, AsArray, Int32Array, Int64Array};
    use arrow::datatypes::{Int32Type, Int64Type};
    use arrow_schema::DataType;

    use super::*;
    use crate::filter::Filter;
    use crate::scan_spec::ColumnSpec;
    use crate::value_hook::{shared_hook, CountHook, HookResult};

    /// Two row groups of 10 rows: `k = i`, `v = i * 2` with `v` null when `i % 4 == 0`.
    fn table() -> Arc<ColumnarTable> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int32, true),
        ]));
        let batches = [0_i64, 10]
            .iter()
            .map(|start| {
                let k = Int64Array::from_iter_values(*start..start + 10);
                let v = Int32Array::from_iter((*start..start + 10).map(|i| (i % 4 != 0).then_some(i as i32 * 2)));
                RecordBatch::try_new(schema.clone(), vec![Arc::new(k), Arc::new(v)]).expect("batch")
            })
            .collect::<Vec<_>>();
        Arc::new(ColumnarTable::from_batches(schema, &batches).expect("table"))
    }

    fn drain(scan: &mut TableScan) -> Vec<RecordBatch> {
        let mut out = Vec::new();
        while let Some(batch) = scan.get_output().expect("output") {
            out.push(batch);
        }
        assert!(scan.is_finished());
        out
    }

    #[test]
    fn filter_prunes_row_groups_and_rows() {
        let spec = ScanSpec::try_new(vec![
            ColumnSpec::new("v"),
            ColumnSpec::new("k").with_filter(Filter::bigint_range(12, 15)),
        ])
        .expect("spec");
        let mut scan = TableScan::try_new(table(), &spec, 4).expect("scan");
        assert_eq!(scan.filter_row_groups(), [1]);
        let batches = drain(&mut scan);

        let k = batches
            .iter()
            .flat_map(|b| b.column(1).as_primitive::<Int64Type>().values().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(k, [12, 13, 14, 15]);
        let v_nulls = batches.iter().map(|b| b.column(0).null_count()).sum::<usize>();
        assert_eq!(v_nulls, 1);
        assert_eq!(scan.column_stats("k").expect("k").row_groups_skipped, 1);
    }

    #[test]
    fn hook_sees_surviving_rows_only() {
        let hook = shared_hook(CountHook::new(true));
        let spec = ScanSpec::try_new(vec![
            ColumnSpec::new("v").with_value_hook(hook.clone()),
            ColumnSpec::new("k")
                .with_filter(Filter::bigint_values([1, 4, 8, 19]))
                .with_projected(false),
        ])
        .expect("spec");
        let mut scan = TableScan::try_new(table(), &spec, 3).expect("scan");
        assert!(scan.output_schema().fields().is_empty());
        assert!(drain(&mut scan).is_empty());
        assert_eq!(hook.lock().expect("hook").result(), HookResult::Count(4));
    }

    #[test]
    fn output_types_follow_the_spec() {
        let spec = ScanSpec::try_new(vec![
            ColumnSpec::new("v").with_output_type(DataType::Int64),
            ColumnSpec::new("k").with_output_type(DataType::Int32),
        ])
        .expect("spec");
        let mut scan = TableScan::try_new(table(), &spec, 7).expect("scan");
        let batches = drain(&mut scan);
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 20);
        assert_eq!(batches[0].num_rows(), 7);
        let k = batches[1].column(1).as_primitive::<Int32Type>();
        assert_eq!(k.value(0), 7);
        let v = batches[0].column(0).as_primitive::<Int64Type>();
        assert_eq!((v.is_null(0), v.value(1)), (true, 2));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let spec = ScanSpec::try_new(vec![ColumnSpec::new("missing")]).expect("spec");
        assert!(matches!(
            TableScan::try_new(table(), &spec, 4),
            Err(StrataError::InvalidConfig(_))
        ));
    }
}
