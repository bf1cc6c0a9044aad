pub mod report;

use basalt_collector::{AgentBuilder, AgentHandle, Collector, CollectorError, Contract};
use basalt_config::CollectorConfig;
use lithos_events::{DataRecord, DataScheme, RecordBuffer, RecordCursor};
use std::sync::Arc;
use std::time::Instant;

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: String,
    pub stats: Stats,
}

/// Sorts `samples` in place. Returns `None` for an empty slice.
pub fn compute_stats(samples: &mut [u64]) -> Option<Stats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();

    let count = samples.len();
    let sum: u64 = samples.iter().sum();
    let mean = sum as f64 / count as f64;
    let variance = samples
        .iter()
        .map(|&x| {
            let diff = x as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / count as f64;

    Some(Stats {
        min: samples[0],
        max: samples[count - 1],
        mean,
        stddev: variance.sqrt(),
        p50: percentile_sorted(samples, 50.0),
        p90: percentile_sorted(samples, 90.0),
        p99: percentile_sorted(samples, 99.0),
        p999: percentile_sorted(samples, 99.9),
        count,
    })
}

fn percentile_sorted(sorted: &[u64], pct: f64) -> u64 {
    let len = sorted.len();
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(len - 1)]
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Times `batches` runs of `batch_size` calls and reports ns per call.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    mut f: F,
) -> Option<BenchResult> {
    let batch_size = batch_size.max(1);
    let mut samples = Vec::with_capacity(batches);
    for _ in 0..batches {
        let start = Instant::now();
        for _ in 0..batch_size {
            f();
        }
        let per_op = start.elapsed().as_nanos() / batch_size as u128;
        samples.push((per_op as u64).max(1));
    }
    Some(BenchResult {
        name: name.to_string(),
        unit: "ns/op".to_string(),
        stats: compute_stats(&mut samples)?,
    })
}

// ─── Workload ───────────────────────────────────────────────────────────────

/// `Quote` for ticker and stream collectors, timed `Trade` for history.
pub fn bench_scheme() -> Arc<DataScheme> {
    DataScheme::builder()
        .record("Quote", 4, 0)
        .timed_record("Trade", 4, 0)
        .build()
}

pub fn bench_record(collector: &Collector) -> Option<Arc<DataRecord>> {
    let name = match collector.contract() {
        Contract::History => "Trade",
        _ => "Quote",
    };
    collector.scheme().find_record(name).cloned()
}

/// Every fourth symbol is too long to pack and goes through the mapper.
pub fn bench_symbols(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| if i % 4 == 0 { format!("SYMBOL_{i:06}") } else { format!("S{i}") })
        .collect()
}

pub fn bench_config() -> CollectorConfig {
    CollectorConfig {
        agent_buffer_size: 1 << 20,
        ..CollectorConfig::default()
    }
}

pub fn subscription(
    collector: &Collector,
    record: &Arc<DataRecord>,
    symbols: &[String],
) -> RecordBuffer {
    RecordBuffer::from_cursors(
        symbols
            .iter()
            .map(|s| collector.scheme().cursor(record, s).with_time(0)),
    )
}

/// `agents` agents, each subscribed to every symbol.
pub fn subscribed_agents(
    collector: &Arc<Collector>,
    record: &Arc<DataRecord>,
    symbols: &[String],
    agents: usize,
) -> Result<Vec<AgentHandle>, CollectorError> {
    (0..agents)
        .map(|n| {
            let agent = collector.create_agent(AgentBuilder::new().name(format!("bench-{n}")))?;
            agent.add_subscription(&mut subscription(collector, record, symbols))?;
            Ok(agent)
        })
        .collect()
}

/// One batch of `size` records cycling through `symbols`.
pub fn make_batch(
    collector: &Collector,
    record: &Arc<DataRecord>,
    symbols: &[String],
    size: usize,
    seq: i64,
) -> Vec<RecordCursor> {
    (0..size)
        .map(|i| {
            let symbol = &symbols[i % symbols.len().max(1)];
            let mut cursor = collector
                .scheme()
                .cursor(record, symbol)
                .with_time(seq + i as i64);
            cursor.set_int(2, i as i32);
            cursor
        })
        .collect()
}

pub fn drain(agents: &[AgentHandle]) -> usize {
    let mut sink = RecordBuffer::new();
    for agent in agents {
        while agent.retrieve_data(&mut sink) {}
    }
    sink.size()
}

// ─── Resource Usage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSnapshot {
    pub max_rss_bytes: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub vol_ctx_switches: i64,
    pub invol_ctx_switches: i64,
    pub user_time_us: i64,
    pub sys_time_us: i64,
}

pub fn capture_rusage() -> ResourceSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    #[cfg(target_os = "linux")]
    let max_rss_bytes = usage.ru_maxrss * 1024;
    #[cfg(not(target_os = "linux"))]
    let max_rss_bytes = usage.ru_maxrss;
    ResourceSnapshot {
        max_rss_bytes,
        minor_faults: usage.ru_minflt,
        major_faults: usage.ru_majflt,
        vol_ctx_switches: usage.ru_nvcsw,
        invol_ctx_switches: usage.ru_nivcsw,
        user_time_us: usage.ru_utime.tv_sec * 1_000_000 + usage.ru_utime.tv_usec as i64,
        sys_time_us: usage.ru_stime.tv_sec * 1_000_000 + usage.ru_stime.tv_usec as i64,
    }
}

// ─── Formatting ─────────────────────────────────────────────────────────────

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_count(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

pub fn print_table_header() {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  unit",
        "Benchmark", "min", "p50", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(92));
}

pub fn print_result_row(r: &BenchResult) {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
        r.name, r.stats.min, r.stats.p50, r.stats.p90, r.stats.p99, r.stats.p999, r.stats.max, r.unit,
    );
}

pub fn section_header(title: &str) {
    println!("\n{}", "─".repeat(90));
    println!("  {title}");
    println!("{}\n", "─".repeat(90));
}
