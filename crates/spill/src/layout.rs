use std::path::{Path, PathBuf};

use crate::partition::SpillPartitionId;

/// File path of the `seq`-th spill file written for `partition` by the
/// spiller identified by `prefix`.
pub fn spill_file_path(
    root_dir: &Path,
    prefix: &str,
    partition: &SpillPartitionId,
    seq: u32,
) -> PathBuf {
    root_dir.join(format!("{prefix}-p{}-{seq}.spill", partition.file_tag()))
}

/// One closed, append-only spill file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillFile {
    pub partition: SpillPartitionId,
    pub path: PathBuf,
    pub bytes: u64,
    pub rows: u64,
    pub batches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_partitions_get_distinct_paths() {
        let root = Path::new("/tmp/spill");
        let parent = SpillPartitionId::new(3);
        let a = spill_file_path(root, "row_number-7", &parent, 0);
        let b = spill_file_path(root, "row_number-7", &parent.child(3), 0);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("row_number-7-p3-0.spill"));
        assert!(b.to_string_lossy().ends_with("row_number-7-p3_3-0.spill"));
    }
}
