//! Spill files and hash partitioning for stateful operators.
//!
//! Architecture role:
//! - partitions rows by a bit range of a 64-bit key hash
//! - writes each partition to append-only Arrow IPC spill files
//! - reads partitions back for restore, deleting files as they are consumed
//!
//! Key modules:
//! - [`partition`]: bit ranges, partition ids and sets, the partition function
//! - [`writer`] / [`reader`]: spill file IO
//! - [`spiller`]: hash-table and input spillers sharing one partitioning

pub mod layout;
pub mod partition;
pub mod reader;
pub mod spiller;
pub mod writer;

pub use layout::SpillFile;
pub use partition::{
    hash_key_bytes, HashBitRange, HashPartitionFunction, SpillPartition, SpillPartitionId,
    SpillPartitionSet, SpillStatsHandle,
};
pub use reader::UnorderedSpillReader;
pub use spiller::{HashTableSpiller, InputSpiller, SpillerKind};
pub use writer::SpillWriter;
