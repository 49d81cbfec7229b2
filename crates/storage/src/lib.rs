//! Selective columnar scan over encoded in-memory tables.
//!
//! Architecture role:
//! - encoded column chunks grouped in row groups, with min/max statistics
//! - format adapters deriving nulls and decoding through visitors
//! - selective column readers applying pushed-down filters and value hooks
//! - a `TableScan` source operator for the execution pipeline
//!
//! Key modules:
//! - [`reader`] and [`struct_reader`]
//! - [`format_data`]
//! - [`scan`]

pub mod buffer;
pub mod encoding;
pub mod filter;
pub mod format_data;
pub mod native;
pub mod parquet_loader;
pub mod reader;
pub mod scan;
pub mod scan_spec;
pub mod struct_reader;
pub mod table;
pub mod value_hook;
pub mod vector;

pub use encoding::{EncodedValues, Encoding, ValueDecoder};
pub use filter::Filter;
pub use parquet_loader::load_parquet;
pub use reader::{build_reader, ColumnReader, ColumnReaderStats, ScalarColumnReader};
pub use scan::{register_table_scan, scan_registry, SelectiveScanNode, TableScan, TableScanNode};
pub use scan_spec::{ColumnSpec, ScanSpec};
pub use struct_reader::StructColumnReader;
pub use table::{ColumnChunk, ColumnData, ColumnStats, ColumnarTable, RowGroup, StructChunk};
pub use value_hook::{shared_hook, CountHook, HookResult, MinMaxHook, SharedValueHook, SumHook, ValueHook};
pub use vector::ColumnVector;
