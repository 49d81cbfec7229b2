//! Pushed-down scan filters.
//!
//! Filters are a closed set of variants; a reader matches on the variant
//! once per value through [`Filter::test_value`], which is monomorphized per
//! value type.

use std::collections::BTreeSet;

use crate::native::NativeValue;

/// Predicate over one column's values.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Accepts only nulls.
    IsNull,
    /// Accepts only non-null values.
    IsNotNull,
    /// Integers in `[lower, upper]`.
    BigintRange {
        lower: i64,
        upper: i64,
        null_allowed: bool,
    },
    /// Floats in `[lower, upper]`. NaN never passes.
    DoubleRange {
        lower: f64,
        upper: f64,
        null_allowed: bool,
    },
    /// Integers in a fixed set.
    BigintValues {
        values: BTreeSet<i64>,
        null_allowed: bool,
    },
    /// Passes when every inner filter passes.
    And(Vec<Filter>),
}

impl Filter {
    /// `lower <= v <= upper` on integers.
    pub fn bigint_range(lower: i64, upper: i64) -> Self {
        Self::BigintRange {
            lower,
            upper,
            null_allowed: false,
        }
    }

    /// `lower <= v <= upper` on floats.
    pub fn double_range(lower: f64, upper: f64) -> Self {
        Self::DoubleRange {
            lower,
            upper,
            null_allowed: false,
        }
    }

    /// `v IN values` on integers.
    pub fn bigint_values(values: impl IntoIterator<Item = i64>) -> Self {
        Self::BigintValues {
            values: values.into_iter().collect(),
            null_allowed: false,
        }
    }

    /// Same filter, also accepting nulls.
    pub fn with_nulls_allowed(self) -> Self {
        match self {
            Self::BigintRange { lower, upper, .. } => Self::BigintRange {
                lower,
                upper,
                null_allowed: true,
            },
            Self::DoubleRange { lower, upper, .. } => Self::DoubleRange {
                lower,
                upper,
                null_allowed: true,
            },
            Self::BigintValues { values, .. } => Self::BigintValues {
                values,
                null_allowed: true,
            },
            other => other,
        }
    }

    /// True when null rows pass.
    pub fn null_allowed(&self) -> bool {
        match self {
            Self::IsNull => true,
            Self::IsNotNull => false,
            Self::BigintRange { null_allowed, .. }
            | Self::DoubleRange { null_allowed, .. }
            | Self::BigintValues { null_allowed, .. } => *null_allowed,
            Self::And(filters) => filters.iter().all(Filter::null_allowed),
        }
    }

    /// `Some(is_null)` for filters that only look at nullness.
    pub fn null_only(&self) -> Option<bool> {
        match self {
            Self::IsNull => Some(true),
            Self::IsNotNull => Some(false),
            _ => None,
        }
    }

    /// Test an integer value.
    pub fn test_i64(&self, v: i64) -> bool {
        match self {
            Self::IsNull => false,
            Self::IsNotNull => true,
            Self::BigintRange { lower, upper, .. } => *lower <= v && v <= *upper,
            Self::DoubleRange { lower, upper, .. } => {
                let v = v as f64;
                *lower <= v && v <= *upper
            }
            Self::BigintValues { values, .. } => values.contains(&v),
            Self::And(filters) => filters.iter().all(|f| f.test_i64(v)),
        }
    }

    /// Test a float value.
    pub fn test_f64(&self, v: f64) -> bool {
        match self {
            Self::IsNull => false,
            Self::IsNotNull => true,
            Self::DoubleRange { lower, upper, .. } => *lower <= v && v <= *upper,
            Self::BigintRange { lower, upper, .. } => {
                v.fract() == 0.0 && (*lower as f64) <= v && v <= (*upper as f64)
            }
            Self::BigintValues { values, .. } => {
                v.fract() == 0.0 && values.contains(&(v as i64))
            }
            Self::And(filters) => filters.iter().all(|f| f.test_f64(v)),
        }
    }

    /// Test a decoded value of any native type.
    #[inline]
    pub fn test_value<T: NativeValue>(&self, v: T) -> bool {
        if T::IS_FLOAT {
            v.to_f64().is_some_and(|v| self.test_f64(v))
        } else {
            v.to_i64().is_some_and(|v| self.test_i64(v))
        }
    }

    /// False when no value in `[min, max]` (or a null, when `has_nulls`) can pass.
    ///
    /// Used to skip whole row groups from their column statistics.
    pub fn test_range(&self, min: f64, max: f64, has_nulls: bool) -> bool {
        let nulls_pass = has_nulls && self.null_allowed();
        match self {
            Self::IsNull => has_nulls,
            Self::IsNotNull => true,
            Self::BigintRange { lower, upper, .. } => {
                nulls_pass || ((*lower as f64) <= max && min <= (*upper as f64))
            }
            Self::DoubleRange { lower, upper, .. } => nulls_pass || (*lower <= max && min <= *upper),
            Self::BigintValues { values, .. } => {
                nulls_pass
                    || values
                        .iter()
                        .any(|v| min <= *v as f64 && (*v as f64) <= max)
            }
            Self::And(filters) => filters.iter().all(|f| f.test_range(min, max, has_nulls)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_filters_test_values_and_stats() {
        let f = Filter::bigint_range(10, 20);
        assert!(f.test_value(15_i32));
        assert!(!f.test_value(21_i64));
        assert!(!f.null_allowed());
        assert!(f.test_range(0.0, 12.0, false));
        assert!(!f.test_range(21.0, 40.0, false));
        assert!(f.clone().with_nulls_allowed().test_range(21.0, 40.0, true));

        let d = Filter::double_range(0.5, 1.5);
        assert!(d.test_value(1.0_f32));
        assert!(!d.test_value(f64::NAN));
    }

    #[test]
    fn composite_and_null_only_filters() {
        let f = Filter::And(vec![Filter::bigint_range(0, 100), Filter::bigint_values([3, 5, 200])]);
        assert!(f.test_i64(5));
        assert!(!f.test_i64(200));
        assert!(!f.test_i64(4));
        assert_eq!(Filter::IsNull.null_only(), Some(true));
        assert_eq!(Filter::IsNotNull.null_only(), Some(false));
        assert_eq!(f.null_only(), None);
        assert!(!Filter::IsNull.test_range(0.0, 1.0, false));
    }
}
