//! Vectors produced by column readers.

use arrow::array::{new_null_array, Array, ArrayRef};
use arrow::compute::cast;
use arrow_schema::DataType;
use strata_common::{Result, StrataError};

/// Result of [`ColumnReader::get_values`](crate::reader::ColumnReader::get_values).
#[derive(Debug, Clone)]
pub enum ColumnVector {
    /// Values laid out one per row.
    Flat(ArrayRef),
    /// Dictionary indices over the row group's dictionary.
    Dictionary(ArrayRef),
    /// Every row is null.
    ConstantNull { data_type: DataType, len: usize },
}

impl ColumnVector {
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(a) | Self::Dictionary(a) => a.len(),
            Self::ConstantNull { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Flat(a) | Self::Dictionary(a) => a.data_type().clone(),
            Self::ConstantNull { data_type, .. } => data_type.clone(),
        }
    }

    pub fn into_array(self) -> ArrayRef {
        match self {
            Self::Flat(a) | Self::Dictionary(a) => a,
            Self::ConstantNull { data_type, len } => new_null_array(&data_type, len),
        }
    }

    /// Array of exactly `data_type`, casting flat values into a dictionary
    /// when a dictionary column meets a row group stored without one.
    pub fn into_array_of(self, data_type: &DataType) -> Result<ArrayRef> {
        match self {
            Self::ConstantNull { len, .. } => Ok(new_null_array(data_type, len)),
            Self::Flat(a) | Self::Dictionary(a) if a.data_type() == data_type => Ok(a),
            Self::Flat(a) | Self::Dictionary(a) => cast(&a, data_type).map_err(|e| {
                StrataError::Execution(format!(
                    "cannot convert {} vector to {data_type}: {e}",
                    a.data_type()
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Int64Array};
    use arrow::datatypes::{Int64Type, UInt32Type};

    use super::*;

    #[test]
    fn constant_null_and_dictionary_conversion() {
        let nulls = ColumnVector::ConstantNull {
            data_type: DataType::Int64,
            len: 3,
        };
        assert_eq!(nulls.len(), 3);
        assert_eq!(nulls.into_array().null_count(), 3);

        let flat = ColumnVector::Flat(Arc::new(Int64Array::from(vec![4, 4, 9])));
        let dict_type = DataType::Dictionary(Box::new(DataType::UInt32), Box::new(DataType::Int64));
        let array = flat.into_array_of(&dict_type).expect("cast");
        let dict = array.as_dictionary::<UInt32Type>();
        assert_eq!(dict.values().as_primitive::<Int64Type>().len(), 2);
    }
}
