use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_batches_in: CounterVec,
    operator_batches_out: CounterVec,
    operator_time_seconds: HistogramVec,
    operator_yields: CounterVec,
    scan_values_decoded: CounterVec,
    scan_row_groups_skipped: CounterVec,
    scan_compactions: CounterVec,
    scan_upcasts: CounterVec,
    spill_bytes: CounterVec,
    spill_rows: CounterVec,
    spill_time_seconds: HistogramVec,
    spill_read_bytes: CounterVec,
    spill_max_level_exceeded: CounterVec,
    memory_pool_used_bytes: GaugeVec,
    memory_reservation_failures: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_operator(
        &self,
        query_id: &str,
        task_id: u64,
        operator: &str,
        rows_in: u64,
        rows_out: u64,
        batches_in: u64,
        batches_out: u64,
        secs: f64,
    ) {
        let labels = [query_id, &task_id.to_string(), operator];
        self.inner
            .operator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_in
            .with_label_values(&labels)
            .inc_by(batches_in as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
        self.inner
            .operator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_operator_yields(&self, query_id: &str, task_id: u64) {
        let labels = [query_id, &task_id.to_string()];
        self.inner.operator_yields.with_label_values(&labels).inc();
    }

    pub fn record_scan(
        &self,
        column: &str,
        values_decoded: u64,
        row_groups_skipped: u64,
        compactions: u64,
        upcasts: u64,
    ) {
        let labels = [column];
        self.inner
            .scan_values_decoded
            .with_label_values(&labels)
            .inc_by(values_decoded as f64);
        self.inner
            .scan_row_groups_skipped
            .with_label_values(&labels)
            .inc_by(row_groups_skipped as f64);
        self.inner
            .scan_compactions
            .with_label_values(&labels)
            .inc_by(compactions as f64);
        self.inner
            .scan_upcasts
            .with_label_values(&labels)
            .inc_by(upcasts as f64);
    }

    pub fn record_spill(&self, operator: &str, kind: &str, bytes: u64, rows: u64, secs: f64) {
        let labels = [operator, kind];
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .spill_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .spill_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_spill_read(&self, operator: &str, bytes: u64) {
        self.inner
            .spill_read_bytes
            .with_label_values(&[operator])
            .inc_by(bytes as f64);
    }

    pub fn inc_spill_max_level_exceeded(&self, operator: &str) {
        self.inner
            .spill_max_level_exceeded
            .with_label_values(&[operator])
            .inc();
    }

    pub fn set_memory_pool_used(&self, pool: &str, bytes: usize) {
        self.inner
            .memory_pool_used_bytes
            .with_label_values(&[pool])
            .set(bytes as f64);
    }

    pub fn inc_reservation_failures(&self, pool: &str) {
        self.inner
            .memory_reservation_failures
            .with_label_values(&[pool])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let op_labels = &["query_id", "task_id", "operator"];

        let operator_rows_in = counter_vec(
            &registry,
            "strata_operator_rows_in_total",
            "Input rows processed per operator",
            op_labels,
        );
        let operator_rows_out = counter_vec(
            &registry,
            "strata_operator_rows_out_total",
            "Output rows produced per operator",
            op_labels,
        );
        let operator_batches_in = counter_vec(
            &registry,
            "strata_operator_batches_in_total",
            "Input batches processed per operator",
            op_labels,
        );
        let operator_batches_out = counter_vec(
            &registry,
            "strata_operator_batches_out_total",
            "Output batches produced per operator",
            op_labels,
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "strata_operator_time_seconds",
            "Time spent in each operator",
            op_labels,
        );
        let operator_yields = counter_vec(
            &registry,
            "strata_driver_yields_total",
            "Driver time slices given up at a batch boundary",
            &["query_id", "task_id"],
        );

        let scan_values_decoded = counter_vec(
            &registry,
            "strata_scan_values_decoded_total",
            "Values decoded by selective column readers",
            &["column"],
        );
        let scan_row_groups_skipped = counter_vec(
            &registry,
            "strata_scan_row_groups_skipped_total",
            "Row groups pruned by column statistics",
            &["column"],
        );
        let scan_compactions = counter_vec(
            &registry,
            "strata_scan_compactions_total",
            "Value buffers compacted in place",
            &["column"],
        );
        let scan_upcasts = counter_vec(
            &registry,
            "strata_scan_upcasts_total",
            "Value buffers widened to a larger result type",
            &["column"],
        );

        let spill_bytes = counter_vec(
            &registry,
            "strata_spill_bytes_total",
            "Spill bytes written",
            &["operator", "kind"],
        );
        let spill_rows = counter_vec(
            &registry,
            "strata_spill_rows_total",
            "Spill rows written",
            &["operator", "kind"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "strata_spill_time_seconds",
            "Spill write time",
            &["operator", "kind"],
        );
        let spill_read_bytes = counter_vec(
            &registry,
            "strata_spill_read_bytes_total",
            "Spill bytes read back during restore",
            &["operator"],
        );
        let spill_max_level_exceeded = counter_vec(
            &registry,
            "strata_spill_max_level_exceeded_total",
            "Spills skipped because the partition reached the deepest spill level",
            &["operator"],
        );

        let memory_pool_used_bytes = gauge_vec(
            &registry,
            "strata_memory_pool_used_bytes",
            "Bytes held by an operator memory pool",
            &["pool"],
        );
        let memory_reservation_failures = counter_vec(
            &registry,
            "strata_memory_reservation_failures_total",
            "Reservation requests that could not be granted",
            &["pool"],
        );

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_batches_in,
            operator_batches_out,
            operator_time_seconds,
            operator_yields,
            scan_values_decoded,
            scan_row_groups_skipped,
            scan_compactions,
            scan_upcasts,
            spill_bytes,
            spill_rows,
            spill_time_seconds,
            spill_read_bytes,
            spill_max_level_exceeded,
            memory_pool_used_bytes,
            memory_reservation_failures,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_operator("q1", 0, "RowNumber", 100, 50, 2, 1, 0.01);
        let text = m.render_prometheus();
        assert!(text.contains("strata_operator_rows_out_total"));
        assert!(text.contains("RowNumber"));
    }

    #[test]
    fn renders_scan_spill_and_memory_families() {
        let m = MetricsRegistry::new();
        m.record_scan("c0", 1000, 2, 1, 1);
        m.record_spill("row_number", "input", 4096, 100, 0.002);
        m.record_spill_read("row_number", 4096);
        m.inc_spill_max_level_exceeded("row_number");
        m.set_memory_pool_used("row_number.0", 1 << 20);
        m.inc_reservation_failures("row_number.0");
        m.inc_operator_yields("q1", 3);
        let text = m.render_prometheus();

        assert!(text.contains("strata_scan_values_decoded_total"));
        assert!(text.contains("strata_scan_row_groups_skipped_total"));
        assert!(text.contains("strata_spill_bytes_total"));
        assert!(text.contains("strata_spill_read_bytes_total"));
        assert!(text.contains("strata_spill_max_level_exceeded_total"));
        assert!(text.contains("strata_memory_pool_used_bytes"));
        assert!(text.contains("strata_memory_reservation_failures_total"));
        assert!(text.contains("strata_driver_yields_total"));
    }
}
