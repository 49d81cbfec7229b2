//! In-memory encoded columnar table: row groups of encoded column chunks.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, PrimitiveArray, StructArray};
use arrow::buffer::NullBuffer;
use arrow::compute::filter;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Fields, SchemaRef};
use strata_common::{Result, StrataError};
use tracing::debug;

use crate::encoding::{EncodedValues, Encoding};
use crate::native::NativeValue;

/// Min/max of the non-null values of a chunk, as `f64`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColumnStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub null_count: usize,
    pub num_entries: usize,
}

impl ColumnStats {
    pub fn has_nulls(&self) -> bool {
        self.null_count > 0
    }
}

/// One scalar column of one row group.
///
/// `nulls`, when present, covers all `num_entries` entries; `values` holds
/// only the non-null entries.
#[derive(Debug, Clone)]
pub struct ColumnChunk<T> {
    pub num_entries: usize,
    pub nulls: Option<NullBuffer>,
    pub values: Arc<EncodedValues<T>>,
    pub stats: ColumnStats,
}

impl<T: NativeValue> ColumnChunk<T> {
    /// Chunk of `values` with the given validity, encoded with `encoding`
    /// or automatically when `None`.
    pub fn try_new(values: &[Option<T>], encoding: Option<Encoding>) -> Result<Self> {
        let non_null = values.iter().flatten().copied().collect::<Vec<_>>();
        let nulls = (non_null.len() < values.len())
            .then(|| NullBuffer::from(values.iter().map(Option::is_some).collect::<Vec<_>>()));
        Self::from_parts(values.len(), nulls, &non_null, encoding)
    }

    fn from_parts(
        num_entries: usize,
        nulls: Option<NullBuffer>,
        non_null: &[T],
        encoding: Option<Encoding>,
    ) -> Result<Self> {
        let values = match encoding {
            Some(encoding) => EncodedValues::encode(non_null, encoding)?,
            None => EncodedValues::encode_auto(non_null)?,
        };
        let mut stats = ColumnStats {
            min: None,
            max: None,
            null_count: nulls.as_ref().map_or(0, NullBuffer::null_count),
            num_entries,
        };
        for v in non_null.iter().filter_map(|v| v.to_f64()).filter(|v| !v.is_nan()) {
            stats.min = Some(stats.min.map_or(v, |m| m.min(v)));
            stats.max = Some(stats.max.map_or(v, |m| m.max(v)));
        }
        Ok(Self {
            num_entries,
            nulls,
            values: Arc::new(values),
            stats,
        })
    }

    fn from_array(array: &PrimitiveArray<T::Arrow>) -> Result<Self> {
        let nulls = array.nulls().filter(|n| n.null_count() > 0).cloned();
        let non_null = match &nulls {
            Some(n) => n
                .valid_indices()
                .map(|i| array.value(i))
                .collect::<Vec<_>>(),
            None => array.values().to_vec(),
        };
        Self::from_parts(array.len(), nulls, &non_null, None)
    }
}

/// Struct column of one row group.
///
/// Children hold entries only for the rows where the struct is non-null.
#[derive(Debug, Clone)]
pub struct StructChunk {
    pub num_entries: usize,
    pub nulls: Option<NullBuffer>,
    pub fields: Fields,
    pub children: Vec<ColumnData>,
}

/// Type-erased column chunk.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int8(Arc<ColumnChunk<i8>>),
    Int16(Arc<ColumnChunk<i16>>),
    Int32(Arc<ColumnChunk<i32>>),
    Int64(Arc<ColumnChunk<i64>>),
    Float32(Arc<ColumnChunk<f32>>),
    Float64(Arc<ColumnChunk<f64>>),
    Struct(Arc<StructChunk>),
}

macro_rules! scalar_chunk {
    ($self:expr, $chunk:ident => $body:expr) => {
        match $self {
            ColumnData::Int8($chunk) => Some($body),
            ColumnData::Int16($chunk) => Some($body),
            ColumnData::Int32($chunk) => Some($body),
            ColumnData::Int64($chunk) => Some($body),
            ColumnData::Float32($chunk) => Some($body),
            ColumnData::Float64($chunk) => Some($body),
            ColumnData::Struct(_) => None,
        }
    };
}

impl ColumnData {
    /// Encode `array`. Supports the signed integers, the floats and structs of those.
    pub fn from_array(array: &ArrayRef) -> Result<Self> {
        Ok(match array.data_type() {
            DataType::Int8 => i8::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Int16 => i16::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Int32 => i32::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Int64 => i64::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Float32 => f32::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Float64 => f64::into_column_data(ColumnChunk::from_array(array.as_primitive())?),
            DataType::Struct(_) => Self::Struct(Arc::new(struct_chunk(array.as_struct())?)),
            other => {
                return Err(StrataError::Unsupported(format!(
                    "columnar storage of {other}"
                )))
            }
        })
    }

    /// Number of entries, nulls included.
    pub fn num_entries(&self) -> usize {
        match self {
            Self::Struct(chunk) => chunk.num_entries,
            scalar => scalar_chunk!(scalar, c => c.num_entries).unwrap_or_default(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Struct(chunk) => DataType::Struct(chunk.fields.clone()),
        }
    }

    /// Statistics of a scalar chunk.
    pub fn stats(&self) -> Option<ColumnStats> {
        scalar_chunk!(self, c => c.stats)
    }

    /// Encoding of a scalar chunk.
    pub fn encoding(&self) -> Option<Encoding> {
        scalar_chunk!(self, c => c.values.encoding())
    }

    pub fn nulls(&self) -> Option<&NullBuffer> {
        match self {
            Self::Struct(chunk) => chunk.nulls.as_ref(),
            scalar => scalar_chunk!(scalar, c => c.nulls.as_ref()).flatten(),
        }
    }
}

fn struct_chunk(array: &StructArray) -> Result<StructChunk> {
    let nulls = array.nulls().filter(|n| n.null_count() > 0).cloned();
    let valid = nulls
        .as_ref()
        .map(|n| BooleanArray::new(n.inner().clone(), None));
    let children = array
        .columns()
        .iter()
        .map(|child| match &valid {
            Some(valid) => {
                let kept = filter(child.as_ref(), valid)
                    .map_err(|e| StrataError::Execution(format!("struct child filter failed: {e}")))?;
                ColumnData::from_array(&kept)
            }
            None => ColumnData::from_array(child),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(StructChunk {
        num_entries: array.len(),
        nulls,
        fields: array.fields().clone(),
        children,
    })
}

/// Columns of a contiguous range of rows.
#[derive(Debug, Clone)]
pub struct RowGroup {
    pub num_rows: usize,
    pub columns: Vec<ColumnData>,
}

impl RowGroup {
    pub fn from_batch(batch: &RecordBatch) -> Result<Self> {
        Ok(Self {
            num_rows: batch.num_rows(),
            columns: batch
                .columns()
                .iter()
                .map(ColumnData::from_array)
                .collect::<Result<_>>()?,
        })
    }

    /// Chunk at `path`: a top-level column index followed by struct child indices.
    pub fn column_at(&self, path: &[usize]) -> Result<&ColumnData> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| StrataError::Internal("empty column path".to_string()))?;
        let mut data = self.columns.get(*first).ok_or_else(|| {
            StrataError::Internal(format!("column {first} out of range"))
        })?;
        for i in rest {
            data = match data {
                ColumnData::Struct(chunk) => chunk.children.get(*i).ok_or_else(|| {
                    StrataError::Internal(format!("struct child {i} out of range"))
                })?,
                _ => {
                    return Err(StrataError::Internal(format!(
                        "column path {path:?} descends into a scalar"
                    )))
                }
            };
        }
        Ok(data)
    }
}

/// Encoded table held in memory, scanned by [`TableScan`](crate::scan::TableScan).
#[derive(Debug, Clone)]
pub struct ColumnarTable {
    schema: SchemaRef,
    row_groups: Vec<RowGroup>,
}

impl ColumnarTable {
    pub fn new(schema: SchemaRef, row_groups: Vec<RowGroup>) -> Result<Self> {
        for (i, group) in row_groups.iter().enumerate() {
            if group.columns.len() != schema.fields().len() {
                return Err(StrataError::Execution(format!(
                    "row group {i} has {} columns, schema has {}",
                    group.columns.len(),
                    schema.fields().len()
                )));
            }
        }
        Ok(Self { schema, row_groups })
    }

    /// One row group per batch.
    pub fn from_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Self> {
        let row_groups = batches
            .iter()
            .filter(|b| b.num_rows() > 0)
            .map(RowGroup::from_batch)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            row_groups = row_groups.len(),
            columns = schema.fields().len(),
            "encoded columnar table"
        );
        Self::new(schema, row_groups)
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn row_groups(&self) -> &[RowGroup] {
        &self.row_groups
    }

    pub fn row_group(&self, index: usize) -> Result<&RowGroup> {
        self.row_groups.get(index).ok_or_else(|| {
            StrataError::Internal(format!(
                "row group {index} out of range ({} groups)",
                self.row_groups.len()
            ))
        })
    }

    pub fn num_rows(&self) -> usize {
        self.row_groups.iter().map(|g| g.num_rows).sum()
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int32Array, Int64Array};
    use arrow_schema::{Field, Schema};

    use super::*;

    #[test]
    fn struct_children_hold_only_valid_parent_rows() {
        let a: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), Some(2), None, Some(4)]));
        let fields = Fields::from(vec![Field::new("a", DataType::Int32, true)]);
        let s: ArrayRef = Arc::new(StructArray::new(
            fields.clone(),
            vec![a],
            Some(NullBuffer::from(vec![true, false, true, true])),
        ));
        let data = ColumnData::from_array(&s).expect("encode");
        let ColumnData::Struct(chunk) = &data else {
            panic!("expected a struct chunk");
        };
        assert_eq!(chunk.num_entries, 4);
        assert_eq!(chunk.children[0].num_entries(), 3);
        let stats = chunk.children[0].stats().expect("scalar stats");
        assert_eq!((stats.min, stats.max, stats.null_count), (Some(1.0), Some(4.0), 1));
    }

    #[test]
    fn table_from_batches_keeps_stats_per_group() {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        let batches = [vec![Some(3), None], vec![Some(10), Some(20)]]
            .into_iter()
            .map(|v| {
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(v)) as ArrayRef])
                    .expect("batch")
            })
            .collect::<Vec<_>>();
        let table = ColumnarTable::from_batches(schema, &batches).expect("table");
        assert_eq!(table.num_rows(), 4);
        let stats = table.row_groups()[1].columns[0].stats().expect("stats");
        assert_eq!((stats.min, stats.max, stats.has_nulls()), (Some(10.0), Some(20.0), false));
        assert!(table.row_groups()[0].columns[0].nulls().is_some());
        assert!(table.row_group(2).is_err());
    }
}
