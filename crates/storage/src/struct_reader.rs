//! Reader of struct columns.
//!
//! A struct reader owns one reader per requested child. Children are read
//! with the struct's nulls as preset nulls, so a child only consumes entries
//! for rows where every enclosing struct is non-null. Filtering children are
//! read first and narrow the rows handed to the rest.

use std::sync::Arc;

use arrow::array::{ArrayRef, StructArray};
use arrow::buffer::{BooleanBuffer, NullBuffer};
use arrow_schema::{DataType, Field, Fields};
use strata_common::{Result, StrataError};

use crate::format_data::{FormatData, RangeNulls, StructFormatData};
use crate::reader::{build_reader, check_subset, ColumnReader, ColumnReaderStats};
use crate::scan_spec::ColumnSpec;
use crate::table::ColumnarTable;
use crate::vector::ColumnVector;

struct ChildReader {
    /// Position of the child among the struct's fields.
    field_index: usize,
    projected: bool,
    reader: Box<dyn ColumnReader>,
}

pub struct StructColumnReader {
    name: String,
    format: StructFormatData,
    /// `Some(is_null)` when rows are selected on the struct's own nullness.
    null_filter: Option<bool>,
    /// Filtering children first.
    children: Vec<ChildReader>,
    range: RangeNulls,
    read_offset: usize,
    output_rows: Vec<usize>,
    values_closed: bool,
    stats: ColumnReaderStats,
}

impl StructColumnReader {
    pub fn try_new(
        table: &Arc<ColumnarTable>,
        path: Vec<usize>,
        fields: &Fields,
        spec: &ColumnSpec,
    ) -> Result<Self> {
        let null_filter = match &spec.filter {
            None => None,
            Some(filter) => Some(filter.null_only().ok_or_else(|| {
                StrataError::InvalidConfig(format!(
                    "struct column {} only supports IS NULL and IS NOT NULL filters",
                    spec.name
                ))
            })?),
        };
        if let Some(unknown) = spec
            .children
            .iter()
            .find(|c| fields.find(&c.name).is_none())
        {
            return Err(StrataError::InvalidConfig(format!(
                "struct column {} has no field {}",
                spec.name, unknown.name
            )));
        }

        let mut children = Vec::new();
        for (field_index, field) in fields.iter().enumerate() {
            let Some(child_spec) = spec.child(field.name()) else {
                continue;
            };
            let mut child_path = path.clone();
            child_path.push(field_index);
            children.push(ChildReader {
                field_index,
                projected: child_spec.projected,
                reader: build_reader(table, child_path, field, &child_spec)?,
            });
        }
        children.sort_by_key(|c| !c.reader.has_filter());

        Ok(Self {
            name: spec.name.clone(),
            format: StructFormatData::new(table.clone(), path),
            null_filter,
            children,
            range: RangeNulls::default(),
            read_offset: 0,
            output_rows: Vec::new(),
            values_closed: true,
            stats: ColumnReaderStats::default(),
        })
    }

    /// Projected children in field order.
    fn projected_children(&mut self) -> Vec<&mut ChildReader> {
        let mut projected = self
            .children
            .iter_mut()
            .filter(|c| c.projected)
            .collect::<Vec<_>>();
        projected.sort_by_key(|c| c.field_index);
        projected
    }

    fn output_fields(&self) -> Fields {
        let mut projected = self.children.iter().filter(|c| c.projected).collect::<Vec<_>>();
        projected.sort_by_key(|c| c.field_index);
        projected
            .iter()
            .map(|c| Field::new(c.reader.name(), c.reader.output_type(), true))
            .collect()
    }

    /// Bring every child to row `end` of the current range.
    fn align_children(&mut self, offset: usize, end: usize) -> Result<()> {
        let nulls = self.range.nulls.clone();
        for child in &mut self.children {
            let at = child.reader.read_offset();
            if at >= end {
                continue;
            }
            let preset = nulls.as_ref().map(|n| n.slice(at - offset, end - at));
            child.reader.skip_rows(end - at, preset.as_ref())?;
        }
        Ok(())
    }
}

impl ColumnReader for StructColumnReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_type(&self) -> DataType {
        DataType::Struct(self.output_fields())
    }

    fn has_filter(&self) -> bool {
        self.null_filter.is_some() || self.children.iter().any(|c| c.reader.has_filter())
    }

    fn seek_to_row_group(&mut self, index: usize) -> Result<()> {
        self.format.seek_to_row_group(index)?;
        for child in &mut self.children {
            child.reader.seek_to_row_group(index)?;
        }
        self.read_offset = 0;
        self.values_closed = true;
        Ok(())
    }

    fn can_match_row_group(&self, _index: usize) -> bool {
        true
    }

    fn skip_row_group(&mut self) {
        self.stats.row_groups_skipped += 1;
        for child in &mut self.children {
            child.reader.skip_row_group();
        }
    }

    fn check_row_group_consumed(&self) -> Result<()> {
        match self.format.remaining_entries() {
            0 => self
                .children
                .iter()
                .try_for_each(|c| c.reader.check_row_group_consumed()),
            left => Err(StrataError::Internal(format!(
                "struct column {} left {left} entries of the row group unread",
                self.name
            ))),
        }
    }

    fn read_offset(&self) -> usize {
        self.read_offset
    }

    fn skip_rows(&mut self, num_rows: usize, incoming_nulls: Option<&NullBuffer>) -> Result<()> {
        if num_rows == 0 {
            return Ok(());
        }
        let range = self.format.read_nulls(num_rows, incoming_nulls)?;
        self.format.skip(&range)?;
        for child in &mut self.children {
            child.reader.skip_rows(num_rows, range.nulls.as_ref())?;
        }
        self.read_offset += num_rows;
        Ok(())
    }

    fn read(&mut self, offset: usize, rows: &[usize], incoming_nulls: Option<&NullBuffer>) -> Result<()> {
        if offset < self.read_offset {
            return Err(StrataError::Internal(format!(
                "struct column {} asked to read row {offset} after row {}",
                self.name, self.read_offset
            )));
        }
        if offset > self.read_offset {
            if incoming_nulls.is_some() {
                return Err(StrataError::Internal(format!(
                    "struct column {} must be aligned by its parent before a nested read",
                    self.name
                )));
            }
            self.skip_rows(offset - self.read_offset, None)?;
        }
        let Some(last) = rows.last() else {
            return Err(StrataError::Internal(format!(
                "struct column {} read with no rows",
                self.name
            )));
        };
        let end = offset + last + 1;
        self.range = self.format.read_nulls(last + 1, incoming_nulls)?;
        self.format.skip(&self.range)?;
        self.values_closed = false;

        let mut active = match self.null_filter {
            None => rows.to_vec(),
            Some(is_null) => rows
                .iter()
                .copied()
                .filter(|r| self.range.is_null(*r) == is_null)
                .collect(),
        };
        let nulls = self.range.nulls.clone();
        for child in &mut self.children {
            let Some(child_last) = active.last() else {
                break;
            };
            let preset = nulls.as_ref().map(|n| n.slice(0, child_last + 1));
            child.reader.read(offset, &active, preset.as_ref())?;
            if child.reader.has_filter() {
                active = child.reader.output_rows().to_vec();
            }
        }
        self.align_children(offset, end)?;

        self.output_rows = active;
        self.read_offset = end;
        Ok(())
    }

    fn output_rows(&self) -> &[usize] {
        &self.output_rows
    }

    fn get_values(&mut self, rows: &[usize], is_final: bool) -> Result<ColumnVector> {
        if self.values_closed {
            return Err(StrataError::Internal(format!(
                "values of struct column {} requested after the final get_values",
                self.name
            )));
        }
        self.values_closed = is_final;
        if rows.is_empty() {
            return Ok(ColumnVector::ConstantNull {
                data_type: self.output_type(),
                len: 0,
            });
        }
        check_subset(&self.output_rows, rows)?;

        let fields = self.output_fields();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.len());
        for (child, field) in self.projected_children().into_iter().zip(fields.iter()) {
            let vector = child.reader.get_values(rows, is_final)?;
            arrays.push(vector.into_array_of(field.data_type())?);
        }
        let nulls = self.range.nulls.as_ref().and_then(|n| {
            let sampled = NullBuffer::new(BooleanBuffer::collect_bool(rows.len(), |i| {
                n.is_valid(rows[i])
            }));
            (sampled.null_count() > 0).then_some(sampled)
        });

        let array = if fields.is_empty() {
            StructArray::new_empty_fields(rows.len(), nulls)
        } else {
            StructArray::try_new(fields, arrays, nulls).map_err(|e| {
                StrataError::Execution(format!("struct column {}: {e}", self.name))
            })?
        };
        Ok(ColumnVector::Flat(Arc::new(array)))
    }

    fn stats(&self) -> ColumnReaderStats {
        let mut stats = self.stats;
        for child in &self.children {
            stats += child.reader.stats();
        }
        stats
    }
}
