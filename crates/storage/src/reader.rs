//! Selective column readers.
//!
//! A reader decodes one column range at a time. `read` establishes the
//! range, applies the pushed-down filter, and leaves the surviving values in
//! a typed [`ValueBuffer`] together with their rows. `get_values` then
//! compacts those values down to the rows the caller still wants and hands
//! the buffer to an Arrow array, upcasting through scratch space only when
//! the target type is wider than the stored one.

use std::any::TypeId;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBufferBuilder, DictionaryArray, PrimitiveArray, UInt32Array};
use arrow::buffer::{Buffer, NullBuffer, ScalarBuffer};
use arrow::datatypes::UInt32Type;
use arrow_schema::{DataType, Field};
use strata_common::{Result, StrataError};

use crate::buffer::ValueBuffer;
use crate::filter::Filter;
use crate::format_data::{ColumnFormatData, RangeNulls, ValueFormatData, ValueVisitor};
use crate::native::{is_supported_conversion, NativeValue};
use crate::scan_spec::ColumnSpec;
use crate::struct_reader::StructColumnReader;
use crate::table::ColumnarTable;
use crate::value_hook::{SharedValueHook, ValueHook};
use crate::vector::ColumnVector;

/// Counters of one column reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnReaderStats {
    pub values_decoded: u64,
    /// `get_values` calls that dropped rows from the value buffer.
    pub compactions: u64,
    /// `get_values` calls that widened values through scratch space.
    pub upcasts: u64,
    pub dense_null_filter_hits: u64,
    pub row_groups_skipped: u64,
    pub buffer_reuses: u64,
    pub buffer_allocations: u64,
}

impl AddAssign for ColumnReaderStats {
    fn add_assign(&mut self, rhs: Self) {
        self.values_decoded += rhs.values_decoded;
        self.compactions += rhs.compactions;
        self.upcasts += rhs.upcasts;
        self.dense_null_filter_hits += rhs.dense_null_filter_hits;
        self.row_groups_skipped += rhs.row_groups_skipped;
        self.buffer_reuses += rhs.buffer_reuses;
        self.buffer_allocations += rhs.buffer_allocations;
    }
}

/// Reader of one (possibly nested) column.
///
/// Row numbers passed to `read` are relative to `offset`, increasing, and
/// the range read is `rows.last() + 1` rows long. `incoming_nulls`, when
/// present, are the enclosing struct's nulls for exactly that range.
pub trait ColumnReader: Send {
    fn name(&self) -> &str;

    /// Type of the vectors returned by `get_values`.
    fn output_type(&self) -> DataType;

    /// True when `read` may drop rows.
    fn has_filter(&self) -> bool;

    fn seek_to_row_group(&mut self, index: usize) -> Result<()>;

    /// False when the row group cannot contain a passing row.
    fn can_match_row_group(&self, index: usize) -> bool;

    /// Record that the scan skipped a row group without seeking to it.
    fn skip_row_group(&mut self);

    /// Fails when entries of the current row group were left unread.
    fn check_row_group_consumed(&self) -> Result<()>;

    /// Row of the current row group the next read starts from.
    fn read_offset(&self) -> usize;

    fn skip_rows(&mut self, num_rows: usize, incoming_nulls: Option<&NullBuffer>) -> Result<()>;

    fn read(&mut self, offset: usize, rows: &[usize], incoming_nulls: Option<&NullBuffer>) -> Result<()>;

    /// Rows of the last read that passed the filter.
    fn output_rows(&self) -> &[usize];

    /// Vector of `rows`, a subset of the rows backing the current values.
    ///
    /// With `is_final`, no further `get_values` may follow for this read.
    fn get_values(&mut self, rows: &[usize], is_final: bool) -> Result<ColumnVector>;

    fn stats(&self) -> ColumnReaderStats;
}

/// Build the reader of `field`, found at `path` in `table`.
pub fn build_reader(
    table: &Arc<ColumnarTable>,
    path: Vec<usize>,
    field: &Field,
    spec: &ColumnSpec,
) -> Result<Box<dyn ColumnReader>> {
    Ok(match field.data_type() {
        DataType::Int8 => scalar_reader::<i8>(table, path, spec)?,
        DataType::Int16 => scalar_reader::<i16>(table, path, spec)?,
        DataType::Int32 => scalar_reader::<i32>(table, path, spec)?,
        DataType::Int64 => scalar_reader::<i64>(table, path, spec)?,
        DataType::Float32 => scalar_reader::<f32>(table, path, spec)?,
        DataType::Float64 => scalar_reader::<f64>(table, path, spec)?,
        DataType::Struct(fields) => Box::new(StructColumnReader::try_new(table, path, fields, spec)?),
        other => {
            return Err(StrataError::Unsupported(format!(
                "reading column {} of type {other}",
                spec.name
            )))
        }
    })
}

fn scalar_reader<T: NativeValue>(
    table: &Arc<ColumnarTable>,
    path: Vec<usize>,
    spec: &ColumnSpec,
) -> Result<Box<dyn ColumnReader>> {
    let format = ColumnFormatData::<T>::new(table.clone(), path);
    Ok(Box::new(ScalarColumnReader::try_new(format, spec)?))
}

/// Reader of a fixed-width column stored as `F::Value`.
pub struct ScalarColumnReader<F: ValueFormatData> {
    name: String,
    format: F,
    filter: Option<Filter>,
    hook: Option<SharedValueHook>,
    /// Element type of produced vectors.
    value_type: DataType,
    keep_dictionary: bool,
    values: ValueBuffer,
    /// Validity of each value slot.
    nulls: BooleanBufferBuilder,
    any_nulls: bool,
    all_null: bool,
    range: RangeNulls,
    read_offset: usize,
    input_rows: Vec<usize>,
    output_rows: Vec<usize>,
    /// Rows backing the current values, one per value.
    value_rows: Vec<usize>,
    values_closed: bool,
    dictionary: Option<Arc<[F::Value]>>,
    dictionary_values: Option<ArrayRef>,
    /// Per dictionary entry: 0 untested, 1 passes, 2 fails.
    dictionary_filter_cache: Vec<u8>,
    stats: ColumnReaderStats,
}

impl<F: ValueFormatData> ScalarColumnReader<F> {
    pub fn try_new(format: F, spec: &ColumnSpec) -> Result<Self> {
        let storage_type = F::Value::data_type();
        let value_type = spec.output_type.clone().unwrap_or_else(|| storage_type.clone());
        if !is_supported_conversion(&storage_type, &value_type) {
            return Err(StrataError::Unsupported(format!(
                "column {} stored as {storage_type} cannot be read as {value_type}",
                spec.name
            )));
        }
        Ok(Self {
            name: spec.name.clone(),
            format,
            filter: spec.filter.clone(),
            hook: spec.value_hook.clone(),
            keep_dictionary: spec.keep_dictionary && value_type == storage_type,
            value_type,
            values: ValueBuffer::default(),
            nulls: BooleanBufferBuilder::new(0),
            any_nulls: false,
            all_null: false,
            range: RangeNulls::default(),
            read_offset: 0,
            input_rows: Vec::new(),
            output_rows: Vec::new(),
            value_rows: Vec::new(),
            values_closed: true,
            dictionary: None,
            dictionary_values: None,
            dictionary_filter_cache: Vec::new(),
            stats: ColumnReaderStats::default(),
        })
    }

    fn dictionary_mode(&self) -> bool {
        self.dictionary.is_some()
    }

    /// Establish the range of a read and size the value buffer for its worst case.
    fn prepare_read(&mut self, rows: &[usize], incoming_nulls: Option<&NullBuffer>) -> Result<()> {
        let Some(last) = rows.last() else {
            return Err(StrataError::Internal(format!(
                "column {} read with no rows",
                self.name
            )));
        };
        if rows.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrataError::Internal(format!(
                "column {} read with rows out of order",
                self.name
            )));
        }
        self.range = self.format.read_nulls(last + 1, incoming_nulls)?;
        self.all_null = self.range.all_null();
        self.input_rows.clear();
        self.input_rows.extend_from_slice(rows);
        self.output_rows.clear();
        self.value_rows.clear();
        self.any_nulls = false;
        self.values_closed = false;
        let width = if self.dictionary_mode() {
            std::mem::size_of::<u32>()
        } else {
            std::mem::size_of::<F::Value>()
        };
        self.values.prepare(rows.len(), width);
        self.nulls = BooleanBufferBuilder::new(rows.len());
        Ok(())
    }

    fn push_null(&mut self) {
        if self.dictionary_mode() {
            self.values.push(0_u32);
        } else {
            self.values.push(F::Value::default());
        }
        self.nulls.append(false);
        self.any_nulls = true;
    }

    /// Keep the rows of `rows` whose nullness is `is_null` as output rows.
    ///
    /// With `extract_values`, a null value is appended per selected row.
    /// Values of non-null rows come from the decode path, so extracting is
    /// only allowed when selecting nulls.
    fn filter_nulls(&mut self, rows: &[usize], is_null: bool, extract_values: bool) {
        assert!(
            is_null || !extract_values,
            "filter_nulls extracts values only for null rows"
        );
        self.output_rows.clear();
        match self.range.nulls.as_ref() {
            None => {
                if !is_null {
                    self.output_rows.extend_from_slice(rows);
                }
            }
            Some(nulls) => {
                let dense = rows.last().is_some_and(|last| *last + 1 == rows.len());
                if dense {
                    self.stats.dense_null_filter_hits += 1;
                    let bits = nulls.inner().slice(0, rows.len());
                    if is_null {
                        self.output_rows.extend((!&bits).set_indices());
                    } else {
                        self.output_rows.extend(bits.set_indices());
                    }
                } else {
                    self.output_rows
                        .extend(rows.iter().copied().filter(|r| nulls.is_null(*r) == is_null));
                }
            }
        }
        if extract_values {
            for _ in 0..self.output_rows.len() {
                self.push_null();
            }
        }
    }

    /// Decode `rows` of the prepared range into the value buffer.
    fn decode(&mut self, rows: &[usize], filter: Option<&Filter>, track_output: bool) -> Result<u64> {
        let range = self.range.clone();
        let Self {
            format,
            values,
            nulls,
            any_nulls,
            output_rows,
            dictionary,
            dictionary_filter_cache,
            ..
        } = self;
        let output_rows = track_output.then_some(output_rows);
        match dictionary {
            Some(dictionary) => {
                let mut sink = IndexSink {
                    values,
                    nulls,
                    any_nulls,
                    output_rows,
                    filter,
                    dictionary: &dictionary[..],
                    cache: dictionary_filter_cache,
                    decoded: 0,
                };
                format.read_indices_with_visitor(&range, rows, &mut sink)?;
                Ok(sink.decoded)
            }
            None => {
                let mut sink = ValueSink {
                    values,
                    nulls,
                    any_nulls,
                    output_rows,
                    filter,
                    decoded: 0,
                };
                format.read_with_visitor(&range, rows, &mut sink)?;
                Ok(sink.decoded)
            }
        }
    }

    fn read_into_hook(&mut self, hook: &SharedValueHook, rows: &[usize]) -> Result<u64> {
        let mut guard = hook.lock().unwrap_or_else(|e| e.into_inner());
        let mut sink = HookSink::<F::Value> {
            hook: &mut *guard,
            decoded: 0,
            _value: PhantomData,
        };
        if self.all_null {
            rows.iter().for_each(|row| sink.on_null(*row));
            self.format.skip(&self.range)?;
        } else {
            self.format.read_with_visitor(&self.range, rows, &mut sink)?;
        }
        Ok(sink.decoded)
    }

    fn validity(&self) -> Option<NullBuffer> {
        self.any_nulls
            .then(|| NullBuffer::new(self.nulls.finish_cloned()))
            .filter(|n| n.null_count() > 0)
    }

    /// Compact the value buffer to `rows`, converting each kept value to `V`
    /// in place. `V` is never wider than the stored type.
    fn compact_scalar_values<V: NativeValue>(&mut self, rows: &[usize]) -> Result<()> {
        let num_values = self.value_rows.len();
        let same_type = TypeId::of::<V>() == TypeId::of::<F::Value>();
        if same_type && rows == self.value_rows.as_slice() {
            return Ok(());
        }
        self.values.make_mut(num_values);
        let Self {
            values,
            nulls,
            any_nulls,
            value_rows,
            ..
        } = self;
        merge_rows(value_rows, rows, |dst, src| {
            let v: F::Value = values.get(src);
            values.set(dst, v.cast::<V>()?);
            if *any_nulls {
                nulls.set_bit(dst, nulls.get_bit(src));
            }
            Ok(())
        })?;
        if rows.len() < num_values {
            self.stats.compactions += 1;
        }
        self.finish_compaction(rows, std::mem::size_of::<V>());
        Ok(())
    }

    /// Compact to `rows` while widening into scratch space.
    ///
    /// The stored values are compacted in place at their own width. With
    /// `copy_back`, the widened values then replace them in the value buffer;
    /// otherwise the scratch space becomes the returned buffer and the stored
    /// values stay readable for a later call.
    fn upcast_scalar_values<V: NativeValue>(&mut self, rows: &[usize], copy_back: bool) -> Result<Buffer> {
        let num_values = self.value_rows.len();
        let mut scratch = Vec::<V>::with_capacity(rows.len());
        self.values.make_mut(num_values);
        let Self {
            values,
            nulls,
            any_nulls,
            value_rows,
            ..
        } = self;
        merge_rows(value_rows, rows, |dst, src| {
            let v: F::Value = values.get(src);
            values.set(dst, v);
            scratch.push(v.cast::<V>()?);
            if *any_nulls {
                nulls.set_bit(dst, nulls.get_bit(src));
            }
            Ok(())
        })?;
        if std::mem::size_of::<V>() > std::mem::size_of::<F::Value>() {
            self.stats.upcasts += 1;
        }
        if rows.len() < num_values {
            self.stats.compactions += 1;
        }
        if copy_back {
            self.values.copy_from(&scratch);
            self.finish_compaction(rows, std::mem::size_of::<V>());
            Ok(self.values.share())
        } else {
            self.finish_compaction(rows, std::mem::size_of::<F::Value>());
            Ok(Buffer::from_vec(scratch))
        }
    }

    fn finish_compaction(&mut self, rows: &[usize], value_size: usize) {
        self.values.set_value_size(value_size);
        self.values.set_num_values(rows.len());
        if self.any_nulls {
            self.nulls.truncate(rows.len());
        }
        self.value_rows.clear();
        self.value_rows.extend_from_slice(rows);
    }

    /// Flat vector of `rows` with element type `V`.
    fn get_flat_values<V: NativeValue>(&mut self, rows: &[usize], is_final: bool) -> Result<ColumnVector> {
        if self.all_null {
            check_subset(&self.value_rows, rows)?;
            return Ok(ColumnVector::ConstantNull {
                data_type: V::data_type(),
                len: rows.len(),
            });
        }
        let value_size = std::mem::size_of::<V>();
        let stored_size = std::mem::size_of::<F::Value>();
        let same_type = TypeId::of::<V>() == TypeId::of::<F::Value>();
        let buffer = if value_size > stored_size {
            self.upcast_scalar_values::<V>(rows, is_final)?
        } else if same_type || is_final {
            self.compact_scalar_values::<V>(rows)?;
            self.values.share()
        } else {
            // narrower output of a range that is read again: keep stored values
            self.upcast_scalar_values::<V>(rows, false)?
        };
        let nulls = self.validity();
        let array = PrimitiveArray::<V::Arrow>::new(ScalarBuffer::new(buffer, 0, rows.len()), nulls);
        Ok(ColumnVector::Flat(Arc::new(array)))
    }

    /// Dictionary vector of `rows` over the row group's dictionary.
    fn get_dictionary_values(&mut self, rows: &[usize]) -> Result<ColumnVector> {
        let num_values = self.value_rows.len();
        if rows != self.value_rows.as_slice() {
            self.values.make_mut(num_values);
            let Self {
                values,
                nulls,
                any_nulls,
                value_rows,
                ..
            } = self;
            merge_rows(value_rows, rows, |dst, src| {
                let index: u32 = values.get(src);
                values.set(dst, index);
                if *any_nulls {
                    nulls.set_bit(dst, nulls.get_bit(src));
                }
                Ok(())
            })?;
            self.stats.compactions += 1;
            self.finish_compaction(rows, std::mem::size_of::<u32>());
        }
        let keys = UInt32Array::new(
            ScalarBuffer::new(self.values.share(), 0, rows.len()),
            self.validity(),
        );
        let dictionary = self.dictionary_values.clone().ok_or_else(|| {
            StrataError::Internal(format!("column {} lost its dictionary", self.name))
        })?;
        let array = DictionaryArray::<UInt32Type>::try_new(keys, dictionary)
            .map_err(|e| StrataError::Execution(format!("dictionary vector: {e}")))?;
        Ok(ColumnVector::Dictionary(Arc::new(array)))
    }
}

/// Walk `rows` against the sorted `source` rows, calling `f(dst, src)` for
/// each row of `rows` with its position in `source`. `dst <= src` always.
fn merge_rows(
    source: &[usize],
    rows: &[usize],
    mut f: impl FnMut(usize, usize) -> Result<()>,
) -> Result<()> {
    let mut src = 0;
    for (dst, row) in rows.iter().enumerate() {
        while src < source.len() && source[src] < *row {
            src += 1;
        }
        if source.get(src) != Some(row) {
            return Err(StrataError::Internal(format!(
                "row {row} is not among the decoded rows"
            )));
        }
        f(dst, src)?;
        src += 1;
    }
    Ok(())
}

pub(crate) fn check_subset(source: &[usize], rows: &[usize]) -> Result<()> {
    merge_rows(source, rows, |_, _| Ok(()))
}

struct ValueSink<'a> {
    values: &'a mut ValueBuffer,
    nulls: &'a mut BooleanBufferBuilder,
    any_nulls: &'a mut bool,
    output_rows: Option<&'a mut Vec<usize>>,
    filter: Option<&'a Filter>,
    decoded: u64,
}

impl<T: NativeValue> ValueVisitor<T> for ValueSink<'_> {
    fn on_null(&mut self, row: usize) {
        if self.filter.is_some_and(|f| !f.null_allowed()) {
            return;
        }
        self.values.push(T::default());
        self.nulls.append(false);
        *self.any_nulls = true;
        if let Some(out) = self.output_rows.as_mut() {
            out.push(row);
        }
    }

    #[inline]
    fn on_value(&mut self, row: usize, value: T) {
        self.decoded += 1;
        if self.filter.is_some_and(|f| !f.test_value(value)) {
            return;
        }
        self.values.push(value);
        self.nulls.append(true);
        if let Some(out) = self.output_rows.as_mut() {
            out.push(row);
        }
    }
}

struct IndexSink<'a, T> {
    values: &'a mut ValueBuffer,
    nulls: &'a mut BooleanBufferBuilder,
    any_nulls: &'a mut bool,
    output_rows: Option<&'a mut Vec<usize>>,
    filter: Option<&'a Filter>,
    dictionary: &'a [T],
    cache: &'a mut Vec<u8>,
    decoded: u64,
}

impl<T: NativeValue> ValueVisitor<u32> for IndexSink<'_, T> {
    fn on_null(&mut self, row: usize) {
        if self.filter.is_some_and(|f| !f.null_allowed()) {
            return;
        }
        self.values.push(0_u32);
        self.nulls.append(false);
        *self.any_nulls = true;
        if let Some(out) = self.output_rows.as_mut() {
            out.push(row);
        }
    }

    #[inline]
    fn on_value(&mut self, row: usize, index: u32) {
        self.decoded += 1;
        if let Some(filter) = self.filter {
            let slot = &mut self.cache[index as usize];
            if *slot == 0 {
                *slot = if filter.test_value(self.dictionary[index as usize]) {
                    1
                } else {
                    2
                };
            }
            if *slot == 2 {
                return;
            }
        }
        self.values.push(index);
        self.nulls.append(true);
        if let Some(out) = self.output_rows.as_mut() {
            out.push(row);
        }
    }
}

struct HookSink<'a, T> {
    hook: &'a mut dyn ValueHook,
    decoded: u64,
    _value: PhantomData<T>,
}

impl<T: NativeValue> ValueVisitor<T> for HookSink<'_, T> {
    fn on_null(&mut self, _row: usize) {
        self.hook.add_null();
    }

    fn on_value(&mut self, _row: usize, value: T) {
        self.decoded += 1;
        if T::IS_FLOAT {
            self.hook.add_f64(value.to_f64().unwrap_or(f64::NAN));
        } else if let Some(v) = value.to_i64() {
            self.hook.add_i64(v);
        }
    }
}

impl<F: ValueFormatData + 'static> ColumnReader for ScalarColumnReader<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_type(&self) -> DataType {
        if self.keep_dictionary {
            DataType::Dictionary(Box::new(DataType::UInt32), Box::new(self.value_type.clone()))
        } else {
            self.value_type.clone()
        }
    }

    fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    fn seek_to_row_group(&mut self, index: usize) -> Result<()> {
        self.format.seek_to_row_group(index)?;
        self.read_offset = 0;
        self.values_closed = true;
        self.dictionary = None;
        self.dictionary_values = None;
        if self.keep_dictionary && self.hook.is_none() {
            if let Some(dictionary) = self.format.dictionary() {
                let values = PrimitiveArray::<<F::Value as NativeValue>::Arrow>::from_iter_values(
                    dictionary.iter().copied(),
                );
                self.dictionary_filter_cache.clear();
                self.dictionary_filter_cache.resize(dictionary.len(), 0);
                self.dictionary_values = Some(Arc::new(values));
                self.dictionary = Some(dictionary);
            }
        }
        Ok(())
    }

    fn can_match_row_group(&self, index: usize) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| self.format.can_match(index, f))
    }

    fn skip_row_group(&mut self) {
        self.stats.row_groups_skipped += 1;
    }

    fn check_row_group_consumed(&self) -> Result<()> {
        match self.format.remaining_entries() {
            0 => Ok(()),
            left => Err(StrataError::Internal(format!(
                "column {} left {left} entries of the row group unread",
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
        self.read_offset += num_rows;
        Ok(())
    }

    fn read(&mut self, offset: usize, rows: &[usize], incoming_nulls: Option<&NullBuffer>) -> Result<()> {
        if offset < self.read_offset {
            return Err(StrataError::Internal(format!(
                "column {} asked to read row {offset} after row {}",
                self.name, self.read_offset
            )));
        }
        if offset > self.read_offset {
            if incoming_nulls.is_some() {
                return Err(StrataError::Internal(format!(
                    "column {} must be aligned by its parent before a nested read",
                    self.name
                )));
            }
            self.skip_rows(offset - self.read_offset, None)?;
        }
        self.prepare_read(rows, incoming_nulls)?;

        let decoded = if let Some(hook) = self.hook.clone() {
            self.output_rows.extend_from_slice(&self.input_rows);
            self.read_into_hook(&hook, rows)?
        } else if self.all_null {
            self.format.skip(&self.range)?;
            if self.filter.as_ref().map_or(true, Filter::null_allowed) {
                for row in rows {
                    self.output_rows.push(*row);
                    self.push_null();
                }
            }
            0
        } else {
            let filter = self.filter.take();
            let decoded = match filter.as_ref().map(|f| (f, f.null_only())) {
                Some((_, Some(true))) => {
                    self.filter_nulls(rows, true, true);
                    self.format.skip(&self.range).map(|_| 0)
                }
                Some((_, Some(false))) => {
                    self.filter_nulls(rows, false, false);
                    let non_null = std::mem::take(&mut self.output_rows);
                    let decoded = self.decode(&non_null, None, false);
                    self.output_rows = non_null;
                    decoded
                }
                Some((f, None)) => self.decode(rows, Some(f), true),
                None => {
                    self.output_rows.extend_from_slice(&self.input_rows);
                    self.decode(rows, None, false)
                }
            };
            self.filter = filter;
            decoded?
        };

        self.value_rows.extend_from_slice(&self.output_rows);
        self.stats.values_decoded += decoded;
        self.read_offset = offset + self.range.num_rows;
        Ok(())
    }

    fn output_rows(&self) -> &[usize] {
        &self.output_rows
    }

    fn get_values(&mut self, rows: &[usize], is_final: bool) -> Result<ColumnVector> {
        if self.values_closed {
            return Err(StrataError::Internal(format!(
                "values of column {} requested after the final get_values",
                self.name
            )));
        }
        if self.hook.is_some() {
            return Err(StrataError::Internal(format!(
                "column {} feeds a value hook and has no values",
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
        if self.dictionary_mode() && !self.all_null {
            return self.get_dictionary_values(rows);
        }
        match self.value_type.clone() {
            DataType::Int8 => self.get_flat_values::<i8>(rows, is_final),
            DataType::Int16 => self.get_flat_values::<i16>(rows, is_final),
            DataType::Int32 => self.get_flat_values::<i32>(rows, is_final),
            DataType::Int64 => self.get_flat_values::<i64>(rows, is_final),
            DataType::Float32 => self.get_flat_values::<f32>(rows, is_final),
            DataType::Float64 => self.get_flat_values::<f64>(rows, is_final),
            other => Err(StrataError::Internal(format!(
                "no value width for {other} in column {}",
                self.name
            ))),
        }
    }

    fn stats(&self) -> ColumnReaderStats {
        let buffer = self.values.stats();
        ColumnReaderStats {
            buffer_reuses: buffer.reuses,
            buffer_allocations: buffer.allocations,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float32Type, Int16Type, Int32Type, Int64Type};
    use arrow_schema::Schema;

    use super::*;
    use crate::encoding::Encoding;
    use crate::table::{ColumnChunk, RowGroup};
    use crate::value_hook::{shared_hook, HookResult, SumHook};

    fn table_of<T: NativeValue>(values: &[Option<T>], encoding: Option<Encoding>) -> Arc<ColumnarTable> {
        let chunk = ColumnChunk::try_new(values, encoding).expect("chunk");
        let schema = Arc::new(Schema::new(vec![Field::new("x", T::data_type(), true)]));
        let group = RowGroup {
            num_rows: values.len(),
            columns: vec![T::into_column_data(chunk)],
        };
        Arc::new(ColumnarTable::new(schema, vec![group]).expect("table"))
    }

    fn reader_of<T: NativeValue>(
        table: &Arc<ColumnarTable>,
        spec: ColumnSpec,
    ) -> ScalarColumnReader<ColumnFormatData<T>> {
        let format = ColumnFormatData::<T>::new(table.clone(), vec![0]);
        let mut reader = ScalarColumnReader::try_new(format, &spec).expect("reader");
        reader.seek_to_row_group(0).expect("seek");
        reader
    }

    /// Every third row null, others `i * 1000`.
    fn thousands(n: usize) -> Vec<Option<i64>> {
        (0..n)
            .map(|i| (i % 3 != 0).then_some(i as i64 * 1000))
            .collect()
    }

    fn all_rows(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn compaction_narrows_in_place() {
        let table = table_of(&thousands(10), Some(Encoding::Plain));
        let rows = [1, 2, 4, 7, 9];

        let mut same = reader_of::<i64>(&table, ColumnSpec::new("x"));
        same.read(0, &all_rows(10), None).expect("read");
        let array = same.get_values(&rows, true).expect("values").into_array();
        let array = array.as_primitive::<Int64Type>();
        assert_eq!(array.values()[..4], [1000, 2000, 4000, 7000]);
        assert!(array.is_null(4));
        assert_eq!(same.stats().compactions, 1);

        let mut narrow = reader_of::<i64>(&table, ColumnSpec::new("x").with_output_type(DataType::Int32));
        narrow.read(0, &all_rows(10), None).expect("read");
        let array = narrow.get_values(&rows, true).expect("values").into_array();
        let array = array.as_primitive::<Int32Type>();
        assert_eq!(array.values()[..4], [1000, 2000, 4000, 7000]);
        assert_eq!(array.null_count(), 1);

        let mut narrower = reader_of::<i64>(&table, ColumnSpec::new("x").with_output_type(DataType::Int16));
        narrower.read(0, &all_rows(10), None).expect("read");
        let array = narrower.get_values(&rows, true).expect("values").into_array();
        assert_eq!(array.as_primitive::<Int16Type>().value(3), 7000);
        assert_eq!(narrower.stats().upcasts, 0);
    }

    #[test]
    fn float_narrowing_keeps_nulls() {
        let table = table_of(&[Some(1.5_f64), None, Some(-2.25), Some(8.0)], Some(Encoding::Plain));
        let mut reader = reader_of::<f64>(&table, ColumnSpec::new("x").with_output_type(DataType::Float32));
        reader.read(0, &all_rows(4), None).expect("read");
        let array = reader.get_values(&[0, 1, 3], true).expect("values").into_array();
        let array = array.as_primitive::<Float32Type>();
        assert_eq!(array.value(0), 1.5);
        assert!(array.is_null(1));
        assert_eq!(array.value(2), 8.0);
    }

    #[test]
    fn non_final_narrowing_leaves_stored_values_readable() {
        let table = table_of(&thousands(6), None);
        let mut reader = reader_of::<i64>(&table, ColumnSpec::new("x").with_output_type(DataType::Int32));
        reader.read(0, &all_rows(6), None).expect("read");

        let first = reader.get_values(&[1, 2, 4, 5], false).expect("values").into_array();
        assert_eq!(first.as_primitive::<Int32Type>().values()[..], [1000, 2000, 4000, 5000]);
        let second = reader.get_values(&[2, 5], true).expect("values").into_array();
        assert_eq!(second.as_primitive::<Int32Type>().values()[..], [2000, 5000]);
        assert_eq!(first.as_primitive::<Int32Type>().value(0), 1000);
    }

    #[test]
    fn wider_output_goes_through_scratch() {
        let bytes = (0..20).map(|i| Some(i as i8)).collect::<Vec<_>>();
        let table = table_of(&bytes, Some(Encoding::Plain));
        let mut reader = reader_of::<i8>(&table, ColumnSpec::new("x").with_output_type(DataType::Int64));
        reader.read(0, &all_rows(20), None).expect("read");
        let array = reader.get_values(&[3, 5, 19], true).expect("values").into_array();
        assert_eq!(array.as_primitive::<Int64Type>().values()[..], [3, 5, 19]);
        let stats = reader.stats();
        assert_eq!((stats.upcasts, stats.compactions), (1, 1));

        let shorts = (0..8)
            .map(|i| (i != 4).then_some(i as i16 * 100))
            .collect::<Vec<_>>();
        let table = table_of(&shorts, Some(Encoding::Delta));
        let mut reader = reader_of::<i16>(&table, ColumnSpec::new("x").with_output_type(DataType::Int32));
        reader.read(0, &all_rows(8), None).expect("read");
        let array = reader.get_values(&all_rows(8), true).expect("values").into_array();
        let array = array.as_primitive::<Int32Type>();
        assert_eq!(array.value(7), 700);
        assert!(array.is_null(4));
        assert_eq!(reader.stats().upcasts, 1);
        assert_eq!(reader.stats().compactions, 0);
    }

    #[test]
    fn all_null_range_is_a_constant() {
        let table = table_of::<i32>(&[None; 6], None);
        let mut reader = reader_of::<i32>(&table, ColumnSpec::new("x").with_output_type(DataType::Int64));
        reader.read(0, &[0, 2, 5], None).expect("read");
        match reader.get_values(&[2, 5], true).expect("values") {
            ColumnVector::ConstantNull { data_type, len } => {
                assert_eq!((data_type, len), (DataType::Int64, 2));
            }
            other => panic!("expected a constant null vector, got {other:?}"),
        }
        let stats = reader.stats();
        assert_eq!((stats.compactions, stats.upcasts), (0, 0));
        reader.check_row_group_consumed().expect("consumed");
    }

    #[test]
    fn dense_and_sparse_null_filters_agree() {
        let table = table_of(&thousands(9), None);

        let mut dense = reader_of::<i64>(&table, ColumnSpec::new("x").with_filter(Filter::IsNull));
        dense.read(0, &all_rows(9), None).expect("read");
        assert_eq!(dense.output_rows(), [0, 3, 6]);
        assert_eq!(dense.stats().dense_null_filter_hits, 1);
        let nulls = dense.get_values(&[0, 3, 6], true).expect("values").into_array();
        assert_eq!(nulls.null_count(), 3);

        let mut sparse = reader_of::<i64>(&table, ColumnSpec::new("x").with_filter(Filter::IsNull));
        sparse.read(0, &[0, 1, 3, 5, 6, 8], None).expect("read");
        assert_eq!(sparse.output_rows(), [0, 3, 6]);
        assert_eq!(sparse.stats().dense_null_filter_hits, 0);

        let mut not_null = reader_of::<i64>(&table, ColumnSpec::new("x").with_filter(Filter::IsNotNull));
        not_null.read(0, &all_rows(9), None).expect("read");
        let rows = not_null.output_rows().to_vec();
        assert_eq!(rows, [1, 2, 4, 5, 7, 8]);
        let values = not_null.get_values(&rows, true).expect("values").into_array();
        assert_eq!(values.as_primitive::<Int64Type>().values()[..], [1000, 2000, 4000, 5000, 7000, 8000]);
    }

    #[test]
    fn range_filter_selects_rows() {
        let table = table_of(&thousands(9), None);
        let mut reader = reader_of::<i64>(&table, ColumnSpec::new("x").with_filter(Filter::bigint_range(2000, 6000)));
        reader.read(0, &all_rows(9), None).expect("read");
        assert_eq!(reader.output_rows(), [2, 4, 5]);
        assert_eq!(reader.stats().values_decoded, 6);

        let spec = ColumnSpec::new("x").with_filter(Filter::bigint_range(2000, 6000).with_nulls_allowed());
        let mut reader = reader_of::<i64>(&table, spec);
        reader.read(0, &all_rows(9), None).expect("read");
        assert_eq!(reader.output_rows(), [0, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn read_skips_to_offset() {
        let table = table_of(&thousands(10), None);
        let mut reader = reader_of::<i64>(&table, ColumnSpec::new("x"));
        reader.read(0, &[0, 1], None).expect("read");
        reader.read(5, &[0, 2], None).expect("read");
        assert_eq!(reader.read_offset(), 8);
        let values = reader.get_values(&[0, 2], true).expect("values").into_array();
        assert_eq!(values.as_primitive::<Int64Type>().values()[..], [5000, 7000]);

        assert!(reader.check_row_group_consumed().is_err());
        reader.skip_rows(2, None).expect("skip");
        reader.check_row_group_consumed().expect("consumed");
        assert!(matches!(reader.read(3, &[0], None), Err(StrataError::Internal(_))));
    }

    #[test]
    fn dictionary_mode_filters_each_entry_once() {
        let values = (0..12).map(|i| Some((i % 3) as i64 * 10)).collect::<Vec<_>>();
        let table = table_of(&values, Some(Encoding::Dictionary));
        let spec = ColumnSpec::new("x")
            .with_keep_dictionary(true)
            .with_filter(Filter::bigint_values([0, 20]));
        let mut reader = reader_of::<i64>(&table, spec);
        assert_eq!(
            reader.output_type(),
            DataType::Dictionary(Box::new(DataType::UInt32), Box::new(DataType::Int64))
        );
        reader.read(0, &all_rows(12), None).expect("read");
        let rows = reader.output_rows().to_vec();
        assert_eq!(rows, [0, 2, 3, 5, 6, 8, 9, 11]);
        assert!(reader.dictionary_filter_cache.iter().all(|slot| *slot != 0));

        let vector = reader.get_values(&rows[..3], true).expect("values");
        assert!(matches!(vector, ColumnVector::Dictionary(_)));
        let array = vector.into_array();
        let dict = array.as_dictionary::<UInt32Type>();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.values().len(), 3);
    }

    #[test]
    fn values_close_after_final_request() {
        let table = table_of(&thousands(4), None);
        let mut reader = reader_of::<i64>(&table, ColumnSpec::new("x"));
        reader.read(0, &all_rows(4), None).expect("read");
        reader.get_values(&[1, 2], true).expect("values");
        assert!(matches!(reader.get_values(&[1], true), Err(StrataError::Internal(_))));
    }

    #[test]
    fn hook_receives_values_of_selected_rows() {
        let hook = shared_hook(SumHook::default());
        let table = table_of(&thousands(6), None);
        let mut reader = reader_of::<i64>(&table, ColumnSpec::new("x").with_value_hook(hook.clone()));
        reader.read(0, &[1, 2, 3, 4], None).expect("read");
        let result = hook.lock().expect("hook").result();
        assert_eq!(result, HookResult::SumI64(7000));
        assert!(reader.get_values(&[1], true).is_err());
    }
}
