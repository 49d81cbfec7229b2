//! Aggregation pushdown into the scan.
//!
//! A column with a value hook hands every value of a passing row to the
//! hook instead of materializing a vector.

use std::sync::{Arc, Mutex};

/// Receives the values of the rows a scan produces for one column.
pub trait ValueHook: Send {
    /// Value of a non-null integer row.
    fn add_i64(&mut self, value: i64);

    /// Value of a non-null float row.
    fn add_f64(&mut self, value: f64);

    /// A null row. Ignored by default.
    fn add_null(&mut self) {}

    /// Current aggregate.
    fn result(&self) -> HookResult;
}

/// Aggregate produced by a [`ValueHook`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookResult {
    Count(u64),
    SumI64(i64),
    SumF64(f64),
    /// `None` until the first value.
    MinMax(Option<(f64, f64)>),
}

/// Hook handle shared by the scan spec and whoever reads the result.
pub type SharedValueHook = Arc<Mutex<dyn ValueHook>>;

/// Wrap a hook for a [`ColumnSpec`](crate::scan_spec::ColumnSpec).
pub fn shared_hook(hook: impl ValueHook + 'static) -> SharedValueHook {
    Arc::new(Mutex::new(hook))
}

/// Counts non-null values, or all rows with `count_nulls`.
#[derive(Debug, Default)]
pub struct CountHook {
    count: u64,
    count_nulls: bool,
}

impl CountHook {
    pub fn new(count_nulls: bool) -> Self {
        Self {
            count: 0,
            count_nulls,
        }
    }
}

impl ValueHook for CountHook {
    fn add_i64(&mut self, _value: i64) {
        self.count += 1;
    }

    fn add_f64(&mut self, _value: f64) {
        self.count += 1;
    }

    fn add_null(&mut self) {
        if self.count_nulls {
            self.count += 1;
        }
    }

    fn result(&self) -> HookResult {
        HookResult::Count(self.count)
    }
}

/// Sums integers with wrapping overflow, or floats.
#[derive(Debug, Default)]
pub struct SumHook {
    int_sum: i64,
    float_sum: f64,
    saw_float: bool,
}

impl ValueHook for SumHook {
    fn add_i64(&mut self, value: i64) {
        self.int_sum = self.int_sum.wrapping_add(value);
    }

    fn add_f64(&mut self, value: f64) {
        self.saw_float = true;
        self.float_sum += value;
    }

    fn result(&self) -> HookResult {
        if self.saw_float {
            HookResult::SumF64(self.float_sum + self.int_sum as f64)
        } else {
            HookResult::SumI64(self.int_sum)
        }
    }
}

#[derive(Debug, Default)]
pub struct MinMaxHook {
    bounds: Option<(f64, f64)>,
}

impl ValueHook for MinMaxHook {
    fn add_i64(&mut self, value: i64) {
        self.add_f64(value as f64);
    }

    fn add_f64(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.bounds = Some(match self.bounds {
            Some((min, max)) => (min.min(value), max.max(value)),
            None => (value, value),
        });
    }

    fn result(&self) -> HookResult {
        HookResult::MinMax(self.bounds)
    }
}
