use crate::{BenchResult, compute_stats};
use lithos_perf_recorder::{PerfRecorder, PerfStage};

/// Stages with at least one sample, as ns results named after the stage.
pub fn stage_results(recorder: &PerfRecorder, prefix: &str) -> Vec<BenchResult> {
    PerfStage::ALL
        .iter()
        .filter_map(|&stage| {
            let mut samples = recorder.samples(stage).to_vec();
            Some(BenchResult {
                name: format!("{prefix}/{}", stage.name()),
                unit: "ns".to_string(),
                stats: compute_stats(&mut samples)?,
            })
        })
        .collect()
}

fn p50_of(recorder: &PerfRecorder, stage: PerfStage) -> u64 {
    let mut samples = recorder.samples(stage).to_vec();
    compute_stats(&mut samples).map_or(0, |s| s.p50)
}

/// Per-stage table; `% tot` is relative to the p50 of a whole `process_data` call.
pub fn print_stage_table(recorder: &PerfRecorder) {
    println!(
        "  {:<22} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {:>6}",
        "Stage", "p50", "p90", "p99", "p99.9", "max", "count", "% tot"
    );
    println!("  {}", "\u{2500}".repeat(90));

    let total_p50 = p50_of(recorder, PerfStage::ProcessDataTotal);
    for stage in PerfStage::ALL {
        let mut samples = recorder.samples(stage).to_vec();
        let Some(stats) = compute_stats(&mut samples) else {
            continue;
        };
        let pct = match stage {
            PerfStage::ProcessDataTotal => "100%".to_string(),
            PerfStage::SubscriptionChange | PerfStage::Rehash | PerfStage::Retrieve => "-".to_string(),
            _ if total_p50 > 0 => format!("{:.0}%", stats.p50 as f64 / total_p50 as f64 * 100.0),
            _ => "-".to_string(),
        };
        println!(
            "  {:<22} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {:>6}",
            stage.name(),
            stats.p50,
            stats.p90,
            stats.p99,
            stats.p999,
            stats.max,
            stats.count,
            pct
        );
    }
}

pub fn print_analysis(recorder: &PerfRecorder) {
    let total = p50_of(recorder, PerfStage::ProcessDataTotal);
    if total == 0 {
        return;
    }
    let candidates = [
        (p50_of(recorder, PerfStage::DistributionBuild), PerfStage::DistributionBuild),
        (p50_of(recorder, PerfStage::AgentUpdate), PerfStage::AgentUpdate),
        (p50_of(recorder, PerfStage::Notify), PerfStage::Notify),
    ];
    println!("\n    process_data p50: {total} ns");
    if let Some((p50, stage)) = candidates.iter().max_by_key(|(v, _)| *v) {
        println!(
            "    -> bottleneck: {} ({:.0}% of total)",
            stage.name(),
            *p50 as f64 / total as f64 * 100.0
        );
    }
}
