use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use basalt_collector::{Collector, Contract, TracingLog};
use basalt_perf::report::{print_analysis, print_stage_table, stage_results};
use basalt_perf::*;
use lithos_events::RecordBuffer;

const SYMBOLS: usize = 10_000;
const AGENTS: usize = 8;
const BATCHES: usize = 2_000;
const BATCH_SIZE: usize = 256;

fn main() {
    let rusage_start = capture_rusage();
    let mut results: Vec<BenchResult> = Vec::new();
    let mut throughput: Vec<serde_json::Value> = Vec::new();

    print_banner();

    for contract in [Contract::Ticker, Contract::Stream, Contract::History] {
        match section_contract(contract, &mut results) {
            Ok(summary) => throughput.push(summary),
            Err(e) => eprintln!("  [{contract} workload failed: {e}]"),
        }
    }

    section_subscription(&mut results);

    let rusage_end = capture_rusage();
    section_resources(&rusage_start, &rusage_end);
    save_results(&results, &throughput, &rusage_start, &rusage_end);
}

fn print_banner() {
    let bar = "\u{2550}".repeat(90);
    println!("\n{bar}");
    println!("  BASALT PERFORMANCE REPORT");
    println!(
        "  {SYMBOLS} symbols, {AGENTS} agents, {BATCHES} batches of {BATCH_SIZE} records per contract"
    );
    println!("{bar}");
}

/// Runs the concurrent distribute/retrieve workload for one contract and
/// prints its per-stage timings.
fn section_contract(
    contract: Contract,
    results: &mut Vec<BenchResult>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    section_header(&format!("{} CONTRACT", contract.to_string().to_uppercase()));

    let collector = Collector::new(contract, bench_scheme(), bench_config())?;
    let record = bench_record(&collector).ok_or("bench record missing")?;
    let symbols = bench_symbols(SYMBOLS);
    let agents = subscribed_agents(&collector, &record, &symbols, AGENTS)?;
    collector.perf().lock().reset();

    let done = AtomicBool::new(false);
    let started = Instant::now();
    std::thread::scope(|scope| -> Result<(), basalt_collector::CollectorError> {
        for agent in &agents {
            let done = &done;
            scope.spawn(move || {
                let mut sink = RecordBuffer::new();
                loop {
                    let more = agent.retrieve_data(&mut sink);
                    sink.clear();
                    if !more {
                        if done.load(Ordering::Acquire) && agent.buffered() == 0 {
                            break;
                        }
                        std::thread::sleep(Duration::from_micros(20));
                    }
                }
            });
        }
        for batch in 0..BATCHES {
            let seq = (batch * BATCH_SIZE) as i64 + 1;
            let mut data =
                RecordBuffer::from_cursors(make_batch(&collector, &record, &symbols, BATCH_SIZE, seq));
            collector.process_data(&mut data)?;
        }
        done.store(true, Ordering::Release);
        Ok(())
    })?;
    let elapsed = started.elapsed();

    let counters = collector.management().counters().snapshot();
    let rate = counters.incoming as f64 / elapsed.as_secs_f64();
    println!(
        "  incoming {}  outgoing {}  retrieved {}  dropped {}  ({} rec/s)\n",
        format_count(counters.incoming),
        format_count(counters.outgoing),
        format_count(counters.retrieved),
        format_count(counters.dropped),
        format_count(rate as u64),
    );

    {
        let perf = collector.perf().lock();
        print_stage_table(&perf);
        print_analysis(&perf);
        results.extend(stage_results(&perf, &contract.to_string()));
    }

    let problems = collector.verify(&TracingLog)?;
    for agent in &agents {
        agent.close()?;
    }

    Ok(serde_json::json!({
        "contract": contract.to_string(),
        "elapsed_ms": elapsed.as_millis() as u64,
        "records_per_sec": rate,
        "counters": {
            "incoming": counters.incoming,
            "outgoing": counters.outgoing,
            "retrieved": counters.retrieved,
            "dropped": counters.dropped,
            "spins": counters.spins,
            "passes": counters.passes,
        },
        "verify_problems": problems,
    }))
}

/// Single-agent add/remove cost against a populated total subscription.
fn section_subscription(results: &mut Vec<BenchResult>) {
    section_header("SUBSCRIPTION CHANGES");

    let Ok(collector) = Collector::new(Contract::Ticker, bench_scheme(), bench_config()) else {
        return;
    };
    let Some(record) = bench_record(&collector) else {
        return;
    };
    let symbols = bench_symbols(SYMBOLS);
    let Ok(_resident) = subscribed_agents(&collector, &record, &symbols, 2) else {
        return;
    };
    let Ok(agent) = collector.create_agent(basalt_collector::AgentBuilder::new().name("churn")) else {
        return;
    };
    let chunk: Vec<String> = symbols.iter().take(64).cloned().collect();

    print_table_header();
    let add_remove = measure_batched("add_remove_64_symbols", 200, 10, || {
        let _ = agent.add_subscription(&mut subscription(&collector, &record, &chunk));
        let _ = agent.remove_subscription(&mut subscription(&collector, &record, &chunk));
    });
    let fresh: Vec<String> = (0..64).map(|i| format!("CHURN_{i:04}")).collect();
    let churn = measure_batched("add_remove_64_fresh_keys", 200, 10, || {
        let _ = agent.add_subscription(&mut subscription(&collector, &record, &fresh));
        let _ = agent.remove_subscription(&mut subscription(&collector, &record, &fresh));
    });
    for result in [add_remove, churn].into_iter().flatten() {
        print_result_row(&result);
        results.push(result);
    }
    let _ = agent.close();
}

fn section_resources(start: &ResourceSnapshot, end: &ResourceSnapshot) {
    section_header("RESOURCE USAGE");

    println!(
        "  Peak RSS:                    {}",
        format_bytes(end.max_rss_bytes as u64)
    );
    println!(
        "  Minor page faults:           {}",
        end.minor_faults.saturating_sub(start.minor_faults)
    );
    println!(
        "  Voluntary ctx switches:      {}",
        end.vol_ctx_switches.saturating_sub(start.vol_ctx_switches)
    );
    println!(
        "  Involuntary ctx switches:    {}",
        end.invol_ctx_switches.saturating_sub(start.invol_ctx_switches)
    );
    println!(
        "  User CPU time:               {:.3}s",
        end.user_time_us.saturating_sub(start.user_time_us) as f64 / 1e6
    );
    println!(
        "  System CPU time:             {:.3}s",
        end.sys_time_us.saturating_sub(start.sys_time_us) as f64 / 1e6
    );
}

fn save_results(
    results: &[BenchResult],
    throughput: &[serde_json::Value],
    rusage_start: &ResourceSnapshot,
    rusage_end: &ResourceSnapshot,
) {
    let timestamp = run_cmd("date", &["+%Y%m%d_%H%M%S"])
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_report.json");

    let output = serde_json::json!({
        "report_type": "collector",
        "timestamp": timestamp,
        "stages": results,
        "workloads": throughput,
        "resources": {
            "start": rusage_start,
            "end": rusage_end,
        },
    });

    let bar = "\u{2550}".repeat(90);
    let written = serde_json::to_string_pretty(&output)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(&json_path, json));
    match written {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}

fn run_cmd(cmd: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout).ok()
            } else {
                None
            }
        })
}
