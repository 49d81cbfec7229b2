use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use strata_common::{global_metrics, SpillConfig, SpillStats};
use strata_spill::{
    HashBitRange, HashPartitionFunction, HashTableSpiller, InputSpiller, SpillPartitionId,
    SpillPartitionSet, SpillStatsHandle, SpillWriter,
};

fn temp_spill_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("strata_spill_{tag}_{nanos}"))
}

fn stats() -> SpillStatsHandle {
    Arc::new(Mutex::new(SpillStats::default()))
}

fn input_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("v", DataType::Int64, false),
        Field::new("k", DataType::Utf8, true),
    ]))
}

fn input_batch(start: i64, rows: i64) -> RecordBatch {
    let values = (start..start + rows).collect::<Vec<_>>();
    let keys = values
        .iter()
        .map(|v| if v % 7 == 0 { None } else { Some(format!("key-{}", v % 13)) })
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        input_schema(),
        vec![
            Arc::new(Int64Array::from(values)),
            Arc::new(StringArray::from(keys)),
        ],
    )
    .expect("batch")
}

fn config(dir: &PathBuf) -> SpillConfig {
    SpillConfig {
        spill_dir: dir.to_string_lossy().to_string(),
        start_partition_bit: 29,
        num_partition_bits: 2,
        max_spill_run_rows: 17,
        ..SpillConfig::default()
    }
}

fn drain(set: &mut SpillPartitionSet, stats: &SpillStatsHandle) -> BTreeMap<SpillPartitionId, Vec<RecordBatch>> {
    let mut out = BTreeMap::new();
    while let Some(partition) = set.pop_first() {
        let id = partition.id().clone();
        let batches = partition
            .into_reader(4096, stats.clone())
            .collect::<Result<Vec<_>, _>>()
            .expect("read partition");
        out.insert(id, batches);
    }
    out
}

#[test]
fn writer_rolls_files_and_reader_deletes_them() {
    let dir = temp_spill_dir("roll");
    let stats = stats();
    let mut writer = SpillWriter::new(&dir, "test", input_schema(), 1, stats.clone());
    let id = SpillPartitionId::new(0);
    writer.write(&id, &input_batch(1, 10)).expect("write");
    writer.write(&id, &input_batch(11, 10)).expect("write");
    let partitions = writer.finish().expect("finish");
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].files().len(), 2);
    assert_eq!(partitions[0].num_rows(), 20);

    let paths = partitions[0]
        .files()
        .iter()
        .map(|f| f.path.clone())
        .collect::<Vec<_>>();
    assert!(paths.iter().all(|p| p.exists()));

    let mut reader = partitions
        .into_iter()
        .next()
        .expect("partition")
        .into_reader(1024, stats.clone())
        .with_operator("roll_reader");
    let first = reader.next_batch().expect("read").expect("batch");
    assert_eq!(first.num_rows(), 10);
    let second = reader.next_batch().expect("read").expect("batch");
    assert!(!paths[0].exists());
    assert_eq!(
        second
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64")
            .value(0),
        11
    );
    assert!(reader.next_batch().expect("read").is_none());
    assert!(paths.iter().all(|p| !p.exists()));

    let s = *stats.lock().expect("stats");
    assert_eq!(s.spilled_files, 2);
    assert_eq!(s.spilled_rows, 20);
    assert_eq!(s.spill_writes, 2);
    assert_eq!(s.spill_reads, 2);
    assert_eq!(s.spilled_partitions, 1);
    assert_eq!(s.spill_read_bytes, s.spilled_bytes);

    let text = global_metrics().render_prometheus();
    assert!(text
        .lines()
        .any(|l| l.starts_with("strata_spill_read_bytes_total") && l.contains("roll_reader")));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn rejects_file_with_bad_magic() {
    let dir = temp_spill_dir("magic");
    let stats = stats();
    let mut writer = SpillWriter::new(&dir, "test", input_schema(), 0, stats.clone());
    let id = SpillPartitionId::new(1);
    writer.write(&id, &input_batch(0, 4)).expect("write");
    let partition = writer.finish().expect("finish").remove(0);
    let path = partition.files()[0].path.clone();
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[0] = b'X';
    std::fs::write(&path, bytes).expect("corrupt");

    let mut reader = partition.into_reader(1024, stats);
    let err = reader.next_batch().expect_err("bad magic");
    assert!(err.to_string().contains("magic"));
    drop(reader);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn hash_table_and_input_partitions_cover_the_same_keys() {
    let dir = temp_spill_dir("coverage");
    let cfg = config(&dir);
    let stats = stats();

    let table_schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, true),
        Field::new("count", DataType::Int64, false),
    ]));
    let table = RecordBatch::try_new(
        table_schema.clone(),
        vec![
            Arc::new(StringArray::from(
                (0..14)
                    .map(|i| if i == 13 { None } else { Some(format!("key-{i}")) })
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(vec![1_i64; 14])),
        ],
    )
    .expect("table");

    let mut table_set = SpillPartitionSet::new();
    let mut table_spiller =
        HashTableSpiller::new("row_number", table_schema, 1, None, &cfg, stats.clone())
            .expect("spiller");
    table_spiller.spill([table]).expect("spill table");
    let table_ids = table_spiller.finish_spill(&mut table_set).expect("finish");
    assert!(!table_ids.is_empty());

    let mut input_set = SpillPartitionSet::new();
    let mut input_spiller =
        InputSpiller::new("row_number", input_schema(), vec![1], None, &cfg, stats.clone())
            .expect("spiller");
    let inputs = [input_batch(0, 100), input_batch(100, 60)];
    for batch in &inputs {
        input_spiller.spill(batch).expect("spill input");
    }
    input_spiller.finish_spill(&mut input_set).expect("finish");
    assert_eq!(input_set.num_rows(), 160);

    let bits = HashBitRange::for_partition(&cfg, None).expect("bits");
    let expected_fn = HashPartitionFunction::new(bits, &input_schema(), vec![1]).expect("fn");

    let table_parts = drain(&mut table_set, &stats);
    let input_parts = drain(&mut input_set, &stats);

    let keys_of = |batches: &[RecordBatch], col: usize| -> BTreeSet<Option<String>> {
        batches
            .iter()
            .flat_map(|b| {
                let keys = b
                    .column(col)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .expect("utf8")
                    .clone();
                (0..keys.len())
                    .map(|i| (!keys.is_null(i)).then(|| keys.value(i).to_string()))
                    .collect::<Vec<_>>()
            })
            .collect()
    };

    let mut seen_values = BTreeSet::new();
    for (id, batches) in &input_parts {
        let mut parts = Vec::new();
        for batch in batches {
            assert!(batch.num_rows() <= 17);
            expected_fn.partition(batch, &mut parts).expect("partition");
            assert!(parts.iter().all(|&p| p == id.partition_number()));
            let values = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("int64");
            seen_values.extend(values.values().iter().copied());
        }
        let table_keys = table_parts.get(id).map(|b| keys_of(b, 0)).unwrap_or_default();
        for key in keys_of(batches, 1) {
            assert!(table_keys.contains(&key), "{key:?} missing from table partition {id}");
        }
    }
    assert_eq!(seen_values, (0..160).collect::<BTreeSet<_>>());

    let s = *stats.lock().expect("stats");
    assert_eq!(s.spill_runs, 1);
    assert_eq!(s.spilled_rows, 174);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn restored_partition_spills_into_children() {
    let dir = temp_spill_dir("children");
    let cfg = config(&dir);
    let stats = stats();
    let parent = SpillPartitionId::new(2);

    let mut set = SpillPartitionSet::new();
    let mut spiller = InputSpiller::new(
        "row_number",
        input_schema(),
        vec![1],
        Some(parent.clone()),
        &cfg,
        stats.clone(),
    )
    .expect("spiller");
    assert_eq!(spiller.hash_bits().begin(), 31);
    spiller.spill(&input_batch(0, 50)).expect("spill");
    let ids = spiller.finish_spill(&mut set).expect("finish");
    assert!(ids.iter().all(|id| id.spill_level() == 1));
    assert!(ids.iter().all(|id| *id > parent));
    set.clear();
    let _ = std::fs::remove_dir_all(dir);
}
