//! Growable typed value buffer of a column reader.
//!
//! The buffer is owned by the reader until [`ValueBuffer::share`] hands it
//! to an Arrow array. Afterwards it is reused in place only when the reader
//! holds the sole reference again; otherwise the next write allocates a
//! fresh buffer and copies the live values.

use arrow::buffer::{Buffer, MutableBuffer};
use bytemuck::Pod;

/// Slack after the last value so decode loops may write one vector past the end.
pub const VALUE_PADDING: usize = 64;

#[derive(Debug)]
enum Storage {
    Owned(MutableBuffer),
    Shared(Buffer),
}

/// Allocation counters of a [`ValueBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Shared buffers taken back for writing.
    pub reuses: u64,
    /// Fresh allocations, including copies of buffers still referenced elsewhere.
    pub allocations: u64,
}

/// Bytes holding `num_values` values of `value_size` bytes each.
#[derive(Debug)]
pub struct ValueBuffer {
    storage: Storage,
    value_size: usize,
    num_values: usize,
    stats: BufferStats,
}

impl Default for ValueBuffer {
    fn default() -> Self {
        Self {
            storage: Storage::Owned(MutableBuffer::new(0)),
            value_size: 1,
            num_values: 0,
            stats: BufferStats::default(),
        }
    }
}

impl ValueBuffer {
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn num_values(&self) -> usize {
        self.num_values
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    fn unshare(&mut self, keep_bytes: usize) {
        if matches!(self.storage, Storage::Owned(_)) {
            return;
        }
        let storage = std::mem::replace(&mut self.storage, Storage::Owned(MutableBuffer::new(0)));
        let Storage::Shared(shared) = storage else {
            return;
        };
        let owned = match shared.into_mutable() {
            Ok(b) => {
                self.stats.reuses += 1;
                b
            }
            Err(shared) => {
                self.stats.allocations += 1;
                let keep = keep_bytes.min(shared.len());
                let mut fresh = MutableBuffer::new(shared.len());
                fresh.extend_from_slice(&shared.as_slice()[..keep]);
                fresh
            }
        };
        self.storage = Storage::Owned(owned);
    }

    /// Writable bytes of at least `min_bytes`, keeping the first `keep_bytes`.
    fn owned_mut(&mut self, min_bytes: usize, keep_bytes: usize) -> &mut MutableBuffer {
        self.unshare(keep_bytes);
        let Storage::Owned(owned) = &mut self.storage else {
            unreachable!("unshare leaves the buffer owned")
        };
        if owned.len() < min_bytes {
            if owned.capacity() < min_bytes {
                self.stats.allocations += 1;
            }
            owned.resize(min_bytes, 0);
        }
        owned
    }

    /// Start a read of up to `capacity` values of `value_size` bytes.
    ///
    /// Drops the current values; the buffer holds at least
    /// `capacity * value_size + VALUE_PADDING` bytes afterwards.
    pub fn prepare(&mut self, capacity: usize, value_size: usize) {
        self.num_values = 0;
        self.value_size = value_size;
        self.owned_mut(capacity * value_size + VALUE_PADDING, 0);
    }

    /// Reinterpret the live values as `value_size` wide. Callers convert the
    /// contents themselves.
    pub fn set_value_size(&mut self, value_size: usize) {
        self.value_size = value_size;
    }

    /// Truncate or extend the live value count.
    pub fn set_num_values(&mut self, num_values: usize) {
        self.num_values = num_values;
    }

    /// Make the buffer writable for `num_values` values, copying if shared.
    pub fn make_mut(&mut self, num_values: usize) {
        let keep = self.num_values * self.value_size;
        self.owned_mut(num_values * self.value_size + VALUE_PADDING, keep);
    }

    /// Append a value of the current width.
    #[inline]
    pub fn push<T: Pod>(&mut self, value: T) {
        let i = self.num_values;
        self.set(i, value);
        self.num_values += 1;
    }

    /// Value `i` of the current width.
    #[inline]
    pub fn get<T: Pod>(&self, i: usize) -> T {
        let size = std::mem::size_of::<T>();
        let bytes = match &self.storage {
            Storage::Owned(b) => &b.as_slice()[i * size..(i + 1) * size],
            Storage::Shared(b) => &b.as_slice()[i * size..(i + 1) * size],
        };
        bytemuck::pod_read_unaligned(bytes)
    }

    /// Overwrite slot `i`, growing the buffer when needed.
    #[inline]
    pub fn set<T: Pod>(&mut self, i: usize, value: T) {
        let size = std::mem::size_of::<T>();
        let end = (i + 1) * size;
        let keep = self.num_values * self.value_size;
        self.owned_mut(end + VALUE_PADDING, keep).as_slice_mut()[i * size..end]
            .copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Replace the contents with `values`, reusing the allocation when possible.
    pub fn copy_from<T: Pod>(&mut self, values: &[T]) {
        let size = std::mem::size_of::<T>();
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let owned = self.owned_mut(bytes.len() + VALUE_PADDING, 0);
        owned.as_slice_mut()[..bytes.len()].copy_from_slice(bytes);
        self.value_size = size;
        self.num_values = values.len();
    }

    /// Hand the live values out as an immutable buffer.
    ///
    /// The reader keeps a reference; the next write reuses the allocation only
    /// if the returned buffer has been dropped by then.
    pub fn share(&mut self) -> Buffer {
        let len = self.num_values * self.value_size;
        let storage = std::mem::replace(&mut self.storage, Storage::Owned(MutableBuffer::new(0)));
        let shared = match storage {
            Storage::Owned(b) => Buffer::from(b),
            Storage::Shared(b) => b,
        };
        let out = shared.slice_with_length(0, len);
        self.storage = Storage::Shared(shared);
        out
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int32Array;
    use arrow::buffer::ScalarBuffer;

    use super::*;

    #[test]
    fn values_round_trip_at_any_width() {
        let mut buffer = ValueBuffer::default();
        buffer.prepare(4, 2);
        for v in [1_i16, -2, 300] {
            buffer.push(v);
        }
        assert_eq!(buffer.num_values(), 3);
        assert_eq!(buffer.get::<i16>(1), -2);
        buffer.copy_from(&[7_i64, 8]);
        assert_eq!((buffer.value_size(), buffer.get::<i64>(1)), (8, 8));
    }

    #[test]
    fn shared_buffer_is_copied_while_referenced() {
        let mut buffer = ValueBuffer::default();
        buffer.prepare(3, 4);
        for v in [10_i32, 20, 30] {
            buffer.push(v);
        }
        let array = Int32Array::new(ScalarBuffer::new(buffer.share(), 0, 3), None);
        let allocations = buffer.stats().allocations;

        buffer.make_mut(3);
        buffer.set(0, 99_i32);
        assert_eq!(array.value(0), 10);
        assert_eq!(buffer.get::<i32>(0), 99);
        assert_eq!(buffer.get::<i32>(2), 30);
        assert_eq!(buffer.stats().allocations, allocations + 1);
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn dropped_array_returns_its_buffer() {
        let mut buffer = ValueBuffer::default();
        buffer.prepare(8, 8);
        buffer.push(1_i64);
        drop(buffer.share());
        buffer.prepare(8, 8);
        assert_eq!(buffer.stats().reuses, 1);
    }
}
