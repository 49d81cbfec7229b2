//! Plan nodes translated into operators by the [`OperatorRegistry`](crate::registry::OperatorRegistry).

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use strata_common::{Result, SpillConfig, StrataError};

/// One node of a linear pipeline plan.
pub trait PlanNode: Send + Sync + Debug {
    /// Plan-unique node id.
    fn id(&self) -> &str;

    /// Node kind; the registry looks factories up by this name.
    fn kind(&self) -> &str;

    /// Schema of the rows the node produces.
    fn output_schema(&self) -> SchemaRef;

    /// Downcast hook for factories.
    fn as_any(&self) -> &dyn Any;
}

/// Constant input batches.
#[derive(Debug, Clone)]
pub struct ValuesNode {
    id: String,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl ValuesNode {
    /// Node kind of [`ValuesNode`].
    pub const KIND: &'static str = "Values";

    /// Values node over `batches`, which must all have `schema`.
    pub fn new(id: impl Into<String>, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(bad) = batches.iter().find(|b| b.schema() != schema) {
            return Err(StrataError::InvalidConfig(format!(
                "values batch schema {:?} does not match node schema {:?}",
                bad.schema(),
                schema
            )));
        }
        Ok(Self {
            id: id.into(),
            schema,
            batches,
        })
    }

    /// Batches emitted by the node.
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }
}

impl PlanNode for ValuesNode {
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

/// Numbers rows within partitions of the key columns, optionally keeping
/// only the first `limit` rows of every partition.
#[derive(Debug, Clone)]
pub struct RowNumberNode {
    id: String,
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    partition_keys: Vec<usize>,
    limit: Option<i64>,
    generate_row_number: bool,
}

impl RowNumberNode {
    /// Node kind of [`RowNumberNode`].
    pub const KIND: &'static str = "RowNumber";

    /// Row number node over `input_schema`.
    ///
    /// `partition_keys` are column indices; an empty list numbers all rows as
    /// one partition. The row number column is named `row_number_column`.
    pub fn new(
        id: impl Into<String>,
        input_schema: SchemaRef,
        partition_keys: Vec<usize>,
        limit: Option<i64>,
        generate_row_number: bool,
        row_number_column: &str,
    ) -> Result<Self> {
        if let Some(&bad) = partition_keys
            .iter()
            .find(|&&k| k >= input_schema.fields().len())
        {
            return Err(StrataError::InvalidConfig(format!(
                "partition key {bad} out of range for {} input columns",
                input_schema.fields().len()
            )));
        }
        if let Some(limit) = limit {
            if limit <= 0 {
                return Err(StrataError::InvalidConfig(format!(
                    "row number limit must be positive, got {limit}"
                )));
            }
        }
        if limit.is_none() && !generate_row_number {
            return Err(StrataError::InvalidConfig(
                "row number node without a limit must generate row numbers".to_string(),
            ));
        }
        let mut fields = input_schema.fields().iter().cloned().collect::<Vec<_>>();
        if generate_row_number {
            fields.push(Arc::new(Field::new(row_number_column, DataType::Int64, false)));
        }
        Ok(Self {
            id: id.into(),
            output_schema: Arc::new(Schema::new(fields)),
            input_schema,
            partition_keys,
            limit,
            generate_row_number,
        })
    }

    /// Schema of the input rows.
    pub fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    /// Partition key column indices.
    pub fn partition_keys(&self) -> &[usize] {
        &self.partition_keys
    }

    /// Maximum rows kept per partition.
    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    /// True when the output carries a row number column.
    pub fn generate_row_number(&self) -> bool {
        self.generate_row_number
    }

    /// True when the operator may spill under `config`.
    pub fn can_spill(&self, config: &SpillConfig) -> bool {
        config.enabled && !self.partition_keys.is_empty()
    }
}

impl PlanNode for RowNumberNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        Self::KIND
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
