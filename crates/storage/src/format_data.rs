//! Format adapter between row groups of encoded chunks and the row-oriented
//! column readers.
//!
//! A [`FormatData`] tracks the entry position of one column inside the
//! current row group. Nulls of a range are derived first ([`RangeNulls`]),
//! merging the column's own nulls with nulls preset by an enclosing struct;
//! values are then decoded through a caller-supplied [`ValueVisitor`].

use std::sync::Arc;

use arrow::buffer::{BooleanBuffer, NullBuffer};
use strata_common::{Result, StrataError};

use crate::encoding::{Encoding, ValueDecoder};
use crate::filter::Filter;
use crate::native::NativeValue;
use crate::table::{ColumnChunk, ColumnData, ColumnStats, ColumnarTable, StructChunk};

/// Nulls of a range of rows about to be read or skipped.
#[derive(Debug, Clone, Default)]
pub struct RangeNulls {
    /// Rows in the range.
    pub num_rows: usize,
    /// Own entries the range covers; fewer than `num_rows` under preset nulls.
    pub num_entries: usize,
    /// Merged nulls of the range, `None` when no row is null.
    pub nulls: Option<NullBuffer>,
}

impl RangeNulls {
    pub fn null_count(&self) -> usize {
        self.nulls.as_ref().map_or(0, NullBuffer::null_count)
    }

    /// Rows with a value.
    pub fn num_values(&self) -> usize {
        self.num_rows - self.null_count()
    }

    #[inline]
    pub fn is_null(&self, row: usize) -> bool {
        self.nulls.as_ref().is_some_and(|n| n.is_null(row))
    }

    /// True when every row of a non-empty range is null.
    pub fn all_null(&self) -> bool {
        self.num_rows > 0 && self.null_count() == self.num_rows
    }
}

/// Per-row callbacks of a decode.
///
/// Calls arrive in increasing row order, one per requested row.
pub trait ValueVisitor<T> {
    fn on_null(&mut self, row: usize);
    fn on_value(&mut self, row: usize, value: T);
}

/// Positioning and null derivation of one column.
pub trait FormatData: Send {
    fn num_row_groups(&self) -> usize;

    /// Position at the first entry of row group `index`.
    fn seek_to_row_group(&mut self, index: usize) -> Result<()>;

    /// Entries of the current row group not consumed yet.
    fn remaining_entries(&self) -> usize;

    /// Nulls of the next `num_rows` rows without consuming them.
    ///
    /// With `preset`, the enclosing struct's nulls for the same rows, only
    /// rows valid in `preset` own an entry of this column.
    fn read_nulls(&self, num_rows: usize, preset: Option<&NullBuffer>) -> Result<RangeNulls>;

    /// Consume the entries of `range` without decoding.
    fn skip(&mut self, range: &RangeNulls) -> Result<()>;

    /// False when statistics show no row of `row_group` can pass `filter`.
    fn can_match(&self, row_group: usize, filter: &Filter) -> bool;
}

/// [`FormatData`] of a scalar column, decoding values of `Self::Value`.
pub trait ValueFormatData: FormatData {
    type Value: NativeValue;

    /// Encoding of the current row group.
    fn encoding(&self) -> Option<Encoding>;

    /// Dictionary of the current row group, when dictionary encoded.
    fn dictionary(&self) -> Option<Arc<[Self::Value]>>;

    /// Consume `range`, calling `visitor` for each of `rows` (relative to
    /// the start of the range, increasing).
    fn read_with_visitor<V: ValueVisitor<Self::Value>>(
        &mut self,
        range: &RangeNulls,
        rows: &[usize],
        visitor: &mut V,
    ) -> Result<()>;

    /// Like [`read_with_visitor`](Self::read_with_visitor) but hands out
    /// dictionary indices instead of values.
    fn read_indices_with_visitor<V: ValueVisitor<u32>>(
        &mut self,
        range: &RangeNulls,
        rows: &[usize],
        visitor: &mut V,
    ) -> Result<()>;
}

/// Null derivation shared by scalar and struct columns.
fn range_nulls(
    own: Option<&NullBuffer>,
    entry_pos: usize,
    remaining: usize,
    num_rows: usize,
    preset: Option<&NullBuffer>,
) -> Result<RangeNulls> {
    let num_entries = match preset {
        Some(p) if p.len() != num_rows => {
            return Err(StrataError::Internal(format!(
                "preset nulls cover {} rows, range has {num_rows}",
                p.len()
            )))
        }
        Some(p) => num_rows - p.null_count(),
        None => num_rows,
    };
    if num_entries > remaining {
        return Err(StrataError::Internal(format!(
            "range needs {num_entries} entries, {remaining} remain in the row group"
        )));
    }
    let own = own
        .map(|n| n.slice(entry_pos, num_entries))
        .filter(|n| n.null_count() > 0);
    let nulls = match (preset, own) {
        (None, own) => own,
        (Some(p), None) => Some(p.clone()),
        (Some(p), Some(own)) => {
            let mut entry = 0;
            let merged = BooleanBuffer::collect_bool(num_rows, |row| {
                if p.is_null(row) {
                    return false;
                }
                entry += 1;
                own.is_valid(entry - 1)
            });
            Some(NullBuffer::new(merged))
        }
    };
    Ok(RangeNulls {
        num_rows,
        num_entries,
        nulls: nulls.filter(|n| n.null_count() > 0),
    })
}

/// One step of a decode: a requested null row, or a run of requested rows
/// whose values are consecutive in the encoded stream.
enum Step<'a> {
    Null(usize),
    Run { value_index: usize, rows: &'a [usize] },
}

/// Split `rows` into [`Step`]s in row order.
fn for_each_step(
    range: &RangeNulls,
    rows: &[usize],
    mut f: impl FnMut(Step<'_>) -> Result<()>,
) -> Result<()> {
    let Some(nulls) = range.nulls.as_ref() else {
        let mut i = 0;
        while i < rows.len() {
            let mut j = i + 1;
            while j < rows.len() && rows[j] == rows[j - 1] + 1 {
                j += 1;
            }
            f(Step::Run {
                value_index: rows[i],
                rows: &rows[i..j],
            })?;
            i = j;
        }
        return Ok(());
    };
    // non-null rows before `scanned`
    let mut scanned = 0;
    let mut valid_before = 0;
    let mut value_index_of = |row: usize| {
        valid_before += nulls.inner().slice(scanned, row - scanned).count_set_bits();
        scanned = row;
        valid_before
    };
    let mut i = 0;
    while i < rows.len() {
        if nulls.is_null(rows[i]) {
            f(Step::Null(rows[i]))?;
            i += 1;
            continue;
        }
        let first = value_index_of(rows[i]);
        let mut j = i + 1;
        while j < rows.len()
            && nulls.is_valid(rows[j])
            && value_index_of(rows[j]) == first + (j - i)
        {
            j += 1;
        }
        f(Step::Run {
            value_index: first,
            rows: &rows[i..j],
        })?;
        i = j;
    }
    Ok(())
}

/// Scalar column of a [`ColumnarTable`], addressed by column path.
pub struct ColumnFormatData<T: NativeValue> {
    table: Arc<ColumnarTable>,
    path: Vec<usize>,
    chunk: Option<Arc<ColumnChunk<T>>>,
    decoder: Option<ValueDecoder<T>>,
    entry_pos: usize,
}

impl<T: NativeValue> ColumnFormatData<T> {
    pub fn new(table: Arc<ColumnarTable>, path: Vec<usize>) -> Self {
        Self {
            table,
            path,
            chunk: None,
            decoder: None,
            entry_pos: 0,
        }
    }

    fn chunk_at(&self, row_group: usize) -> Result<Arc<ColumnChunk<T>>> {
        let data = self.table.row_group(row_group)?.column_at(&self.path)?;
        T::chunk(data).cloned().ok_or_else(|| {
            StrataError::Internal(format!(
                "column {:?} is {}, reader expects {}",
                self.path,
                data.data_type(),
                T::data_type()
            ))
        })
    }

    fn decoder_mut(&mut self) -> Result<&mut ValueDecoder<T>> {
        let path = &self.path;
        self.decoder.as_mut().ok_or_else(|| {
            StrataError::Internal(format!("column {path:?} read before seeking to a row group"))
        })
    }

    fn check_rows(range: &RangeNulls, rows: &[usize]) -> Result<()> {
        match rows.last() {
            Some(last) if *last >= range.num_rows => Err(StrataError::Internal(format!(
                "row {last} outside a range of {} rows",
                range.num_rows
            ))),
            _ => Ok(()),
        }
    }

    /// Statistics of the current row group.
    pub fn stats(&self) -> Option<ColumnStats> {
        self.chunk.as_ref().map(|c| c.stats)
    }
}

impl<T: NativeValue> FormatData for ColumnFormatData<T> {
    fn num_row_groups(&self) -> usize {
        self.table.row_groups().len()
    }

    fn seek_to_row_group(&mut self, index: usize) -> Result<()> {
        let chunk = self.chunk_at(index)?;
        self.decoder = Some(ValueDecoder::new(chunk.values.clone()));
        self.chunk = Some(chunk);
        self.entry_pos = 0;
        Ok(())
    }

    fn remaining_entries(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(0, |c| c.num_entries - self.entry_pos)
    }

    fn read_nulls(&self, num_rows: usize, preset: Option<&NullBuffer>) -> Result<RangeNulls> {
        let chunk = self.chunk.as_ref().ok_or_else(|| {
            StrataError::Internal(format!("column {:?} has no row group", self.path))
        })?;
        range_nulls(
            chunk.nulls.as_ref(),
            self.entry_pos,
            self.remaining_entries(),
            num_rows,
            preset,
        )
    }

    fn skip(&mut self, range: &RangeNulls) -> Result<()> {
        self.decoder_mut()?.skip(range.num_values())?;
        self.entry_pos += range.num_entries;
        Ok(())
    }

    fn can_match(&self, row_group: usize, filter: &Filter) -> bool {
        let Ok(chunk) = self.chunk_at(row_group) else {
            return true;
        };
        match chunk.stats {
            ColumnStats {
                min: Some(min),
                max: Some(max),
                null_count,
                ..
            } => filter.test_range(min, max, null_count > 0),
            // Without bounds the non-null values, if any, are all NaN.
            ColumnStats {
                null_count,
                num_entries,
                ..
            } if null_count == num_entries => filter.null_allowed(),
            ColumnStats { .. } => true,
        }
    }
}

impl<T: NativeValue> ValueFormatData for ColumnFormatData<T> {
    type Value = T;

    fn encoding(&self) -> Option<Encoding> {
        self.chunk.as_ref().map(|c| c.values.encoding())
    }

    fn dictionary(&self) -> Option<Arc<[T]>> {
        self.chunk
            .as_ref()
            .and_then(|c| c.values.dictionary())
            .map(Arc::from)
    }

    fn read_with_visitor<V: ValueVisitor<T>>(
        &mut self,
        range: &RangeNulls,
        rows: &[usize],
        visitor: &mut V,
    ) -> Result<()> {
        Self::check_rows(range, rows)?;
        let decoder = self.decoder_mut()?;
        let mut consumed = 0;
        for_each_step(range, rows, |step| match step {
            Step::Null(row) => {
                visitor.on_null(row);
                Ok(())
            }
            Step::Run { value_index, rows } => {
                decoder.skip(value_index - consumed)?;
                let mut i = 0;
                decoder.visit(rows.len(), |v| {
                    visitor.on_value(rows[i], v);
                    i += 1;
                })?;
                consumed = value_index + rows.len();
                Ok(())
            }
        })?;
        decoder.skip(range.num_values() - consumed)?;
        self.entry_pos += range.num_entries;
        Ok(())
    }

    fn read_indices_with_visitor<V: ValueVisitor<u32>>(
        &mut self,
        range: &RangeNulls,
        rows: &[usize],
        visitor: &mut V,
    ) -> Result<()> {
        Self::check_rows(range, rows)?;
        let decoder = self.decoder_mut()?;
        let mut consumed = 0;
        for_each_step(range, rows, |step| match step {
            Step::Null(row) => {
                visitor.on_null(row);
                Ok(())
            }
            Step::Run { value_index, rows } => {
                decoder.skip(value_index - consumed)?;
                let mut i = 0;
                decoder.visit_indices(rows.len(), |index| {
                    visitor.on_value(rows[i], index);
                    i += 1;
                })?;
                consumed = value_index + rows.len();
                Ok(())
            }
        })?;
        decoder.skip(range.num_values() - consumed)?;
        self.entry_pos += range.num_entries;
        Ok(())
    }
}

/// Nulls-only format data of a struct column.
pub struct StructFormatData {
    table: Arc<ColumnarTable>,
    path: Vec<usize>,
    chunk: Option<Arc<StructChunk>>,
    entry_pos: usize,
}

impl StructFormatData {
    pub fn new(table: Arc<ColumnarTable>, path: Vec<usize>) -> Self {
        Self {
            table,
            path,
            chunk: None,
            entry_pos: 0,
        }
    }
}

impl FormatData for StructFormatData {
    fn num_row_groups(&self) -> usize {
        self.table.row_groups().len()
    }

    fn seek_to_row_group(&mut self, index: usize) -> Result<()> {
        match self.table.row_group(index)?.column_at(&self.path)? {
            ColumnData::Struct(chunk) => self.chunk = Some(chunk.clone()),
            other => {
                return Err(StrataError::Internal(format!(
                    "column {:?} is {}, expected a struct",
                    self.path,
                    other.data_type()
                )))
            }
        }
        self.entry_pos = 0;
        Ok(())
    }

    fn remaining_entries(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(0, |c| c.num_entries - self.entry_pos)
    }

    fn read_nulls(&self, num_rows: usize, preset: Option<&NullBuffer>) -> Result<RangeNulls> {
        let chunk = self.chunk.as_ref().ok_or_else(|| {
            StrataError::Internal(format!("struct {:?} has no row group", self.path))
        })?;
        range_nulls(
            chunk.nulls.as_ref(),
            self.entry_pos,
            self.remaining_entries(),
            num_rows,
            preset,
        )
    }

    fn skip(&mut self, range: &RangeNulls) -> Result<()> {
        if range.num_entries > self.remaining_entries() {
            return Err(StrataError::Internal(format!(
                "struct {:?} skips past the row group end",
                self.path
            )));
        }
        self.entry_pos += range.num_entries;
        Ok(())
    }

    fn can_match(&self, _row_group: usize, _filter: &Filter) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, ArrayRef, Int32Array, StructArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Fields};

    use super::*;

    #[derive(Default)]
    struct Collect(Vec<(usize, Option<i32>)>);

    impl ValueVisitor<i32> for Collect {
        fn on_null(&mut self, row: usize) {
            self.0.push((row, None));
        }

        fn on_value(&mut self, row: usize, value: i32) {
            self.0.push((row, Some(value)));
        }
    }

    fn table(columns: Vec<(&str, ArrayRef)>) -> Arc<ColumnarTable> {
        let batch = RecordBatch::try_from_iter(columns).expect("batch");
        Arc::new(ColumnarTable::from_batches(batch.schema(), &[batch]).expect("table"))
    }

    #[test]
    fn visitor_sees_requested_rows_in_order() {
        let values = (0..20)
            .map(|i| (i % 3 != 0).then_some(i * 10))
            .collect::<Vec<_>>();
        let t = table(vec![("x", Arc::new(Int32Array::from(values.clone())) as ArrayRef)]);
        let mut format = ColumnFormatData::<i32>::new(t, vec![0]);
        format.seek_to_row_group(0).expect("seek");

        let first = format.read_nulls(10, None).expect("nulls");
        assert_eq!(first.null_count(), 4);
        let mut seen = Collect::default();
        format
            .read_with_visitor(&first, &[1, 2, 3, 5, 8], &mut seen)
            .expect("read");
        let expected = [1, 2, 3, 5, 8]
            .iter()
            .map(|r| (*r, values[*r]))
            .collect::<Vec<_>>();
        assert_eq!(seen.0, expected);

        // second range continues after the first
        let second = format.read_nulls(10, None).expect("nulls");
        let mut seen = Collect::default();
        format.read_with_visitor(&second, &[0, 9], &mut seen).expect("read");
        assert_eq!(seen.0, vec![(0, values[10]), (9, values[19])]);
        assert_eq!(format.remaining_entries(), 0);
        assert!(format.read_nulls(1, None).is_err());
    }

    #[test]
    fn preset_nulls_map_rows_to_child_entries() {
        let child: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3), Some(4)]));
        let fields = Fields::from(vec![Field::new("c", DataType::Int32, true)]);
        let parent = NullBuffer::from(vec![true, false, true, false, true, true]);
        let s = StructArray::new(
            fields,
            vec![Arc::new(Int32Array::from(vec![
                Some(1),
                Some(99),
                None,
                Some(99),
                Some(3),
                Some(4),
            ])) as ArrayRef],
            Some(parent.clone()),
        );
        assert_eq!(s.len(), 6);
        let t = table(vec![("s", Arc::new(s) as ArrayRef)]);
        let mut format = ColumnFormatData::<i32>::new(t.clone(), vec![0, 0]);
        format.seek_to_row_group(0).expect("seek");
        assert_eq!(format.remaining_entries(), child.len());

        let range = format.read_nulls(6, Some(&parent)).expect("nulls");
        assert_eq!(range.num_entries, 4);
        assert_eq!(range.num_values(), 3);
        let mut seen = Collect::default();
        format
            .read_with_visitor(&range, &[0, 1, 2, 4, 5], &mut seen)
            .expect("read");
        assert_eq!(
            seen.0,
            vec![(0, Some(1)), (1, None), (2, None), (4, Some(3)), (5, Some(4))]
        );
        assert_eq!(format.remaining_entries(), 0);

        let mut format = ColumnFormatData::<i32>::new(t, vec![0, 0]);
        format.seek_to_row_group(0).expect("seek");
        let short = NullBuffer::from(vec![true, true]);
        assert!(format.read_nulls(6, Some(&short)).is_err());
    }
}
