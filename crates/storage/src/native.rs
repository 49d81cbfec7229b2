//! Fixed-width value types the selective readers decode.

use std::fmt::Debug;
use std::sync::Arc;

use arrow::datatypes::{
    ArrowNativeType, ArrowPrimitiveType, Float32Type, Float64Type, Int16Type, Int32Type,
    Int64Type, Int8Type,
};
use arrow_schema::DataType;
use num_traits::{NumCast, ToPrimitive};
use strata_common::{Result, StrataError};

use crate::table::{ColumnChunk, ColumnData};

/// Storage or vector element type of a scalar column.
///
/// Implemented for the signed integers and the two float widths. Values
/// move between widths with checked numeric casts.
pub trait NativeValue:
    bytemuck::Pod
    + ArrowNativeType
    + Default
    + PartialOrd
    + Debug
    + Send
    + Sync
    + NumCast
    + ToPrimitive
    + 'static
{
    /// Arrow type whose native representation is `Self`.
    type Arrow: ArrowPrimitiveType<Native = Self>;

    /// True for `f32` and `f64`.
    const IS_FLOAT: bool;

    /// Arrow data type of a vector of `Self`.
    fn data_type() -> DataType {
        Self::Arrow::DATA_TYPE
    }

    /// Typed chunk of `data`, when `data` holds `Self` values.
    fn chunk(data: &ColumnData) -> Option<&Arc<ColumnChunk<Self>>>;

    /// Wrap a typed chunk into the type-erased column representation.
    fn into_column_data(chunk: ColumnChunk<Self>) -> ColumnData;

    /// Lossless conversion into `V`, failing when the value is out of range.
    fn cast<V: NativeValue>(self) -> Result<V> {
        <V as NumCast>::from(self).ok_or_else(|| {
            StrataError::Execution(format!(
                "value {self:?} does not fit in {}",
                V::data_type()
            ))
        })
    }
}

macro_rules! native_value {
    ($native:ty, $arrow:ty, $variant:ident, $is_float:expr) => {
        impl NativeValue for $native {
            type Arrow = $arrow;
            const IS_FLOAT: bool = $is_float;

            fn chunk(data: &ColumnData) -> Option<&Arc<ColumnChunk<Self>>> {
                match data {
                    ColumnData::$variant(chunk) => Some(chunk),
                    _ => None,
                }
            }

            fn into_column_data(chunk: ColumnChunk<Self>) -> ColumnData {
                ColumnData::$variant(Arc::new(chunk))
            }
        }
    };
}

native_value!(i8, Int8Type, Int8, false);
native_value!(i16, Int16Type, Int16, false);
native_value!(i32, Int32Type, Int32, false);
native_value!(i64, Int64Type, Int64, false);
native_value!(f32, Float32Type, Float32, true);
native_value!(f64, Float64Type, Float64, true);

/// True when a column stored as `storage` can be read into vectors of `target`.
pub fn is_supported_conversion(storage: &DataType, target: &DataType) -> bool {
    use DataType::*;
    matches!(
        (storage, target),
        (Int8 | Int16 | Int32 | Int64, Int8 | Int16 | Int32 | Int64 | Float32 | Float64)
            | (Float32 | Float64, Float32 | Float64)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_are_checked() {
        assert_eq!(100_i64.cast::<i8>().expect("fits"), 100_i8);
        assert!(300_i64.cast::<i8>().is_err());
        assert_eq!(7_i16.cast::<f64>().expect("fits"), 7.0);
        assert!(is_supported_conversion(&DataType::Int16, &DataType::Int64));
        assert!(!is_supported_conversion(&DataType::Float64, &DataType::Int64));
    }
}
