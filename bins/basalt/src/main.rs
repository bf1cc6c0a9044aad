use anyhow::Context;
use basalt_collector::{AgentBuilder, AgentHandle, Collector, Contract, TracingLog};
use basalt_config::{BasaltConfig, WorkloadConfig};
use lithos_events::{DataScheme, RecordBuffer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "basalt.toml";

fn load_config() -> anyhow::Result<BasaltConfig> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    if std::path::Path::new(&path).exists() {
        BasaltConfig::load(path.clone()).with_context(|| format!("loading {path}"))
    } else {
        Ok(BasaltConfig::default())
    }
}

fn scheme() -> Arc<DataScheme> {
    DataScheme::builder()
        .record("Quote", 4, 0)
        .timed_record("Trade", 4, 0)
        .build()
}

/// Short names pack into ciphers, every seventh one goes through the mapper.
fn symbol_name(i: usize) -> String {
    if i % 7 == 0 {
        format!("LONG_SYMBOL_{i}")
    } else {
        format!("S{i}")
    }
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("building log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let scheme = scheme();
    for contract in [Contract::Ticker, Contract::Stream, Contract::History] {
        let collector = Collector::new(contract, scheme.clone(), config.collector.clone())?;
        run_workload(&collector, &config.workload)?;
    }
    Ok(())
}

fn run_workload(collector: &Arc<Collector>, workload: &WorkloadConfig) -> anyhow::Result<()> {
    let contract = collector.contract();
    let record = match contract {
        Contract::History => collector.scheme().find_record("Trade"),
        _ => collector.scheme().find_record("Quote"),
    }
    .context("record missing from scheme")?
    .clone();
    let symbols: Vec<String> = (0..workload.symbols).map(symbol_name).collect();

    let agents = (0..workload.agents)
        .map(|n| {
            let agent = collector.create_agent(AgentBuilder::new().name(format!("agent-{n}")))?;
            // Each agent takes every symbol whose index is not a multiple of its own stride.
            let stride = n + 2;
            let mut sub = RecordBuffer::from_cursors(
                symbols
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % stride != 0)
                    .map(|(_, s)| collector.scheme().cursor(&record, s).with_time(0)),
            );
            agent.add_subscription(&mut sub)?;
            Ok(agent)
        })
        .collect::<Result<Vec<AgentHandle>, basalt_collector::CollectorError>>()?;
    tracing::info!(%contract, agents = agents.len(), total = collector.subscription_size(), "subscribed");

    let done = AtomicBool::new(false);
    let started = Instant::now();
    std::thread::scope(|scope| -> anyhow::Result<()> {
        for agent in &agents {
            let done = &done;
            scope.spawn(move || consume(agent, done));
        }
        let mut time = 1i64;
        for batch in 0..workload.batches {
            let mut data = RecordBuffer::from_cursors((0..workload.batch_size).map(|i| {
                let symbol = &symbols[(batch * workload.batch_size + i) % symbols.len().max(1)];
                time += 1;
                let mut cursor = collector.scheme().cursor(&record, symbol).with_time(time);
                cursor.set_int(2, (batch + i) as i32);
                cursor
            }));
            collector.process_data(&mut data)?;
        }
        done.store(true, Ordering::Release);
        Ok(())
    })?;

    let counters = collector.management().counters().snapshot();
    tracing::info!(
        %contract,
        elapsed_ms = started.elapsed().as_millis() as u64,
        incoming = counters.incoming,
        outgoing = counters.outgoing,
        retrieved = counters.retrieved,
        dropped = counters.dropped,
        spins = counters.spins,
        "workload finished"
    );

    let problems = collector.verify(&TracingLog)?;
    if problems > 0 {
        tracing::warn!(%contract, problems, "collector state is inconsistent");
    }
    for agent in &agents {
        agent.close()?;
    }
    Ok(())
}

fn consume(agent: &AgentHandle, done: &AtomicBool) {
    let mut sink = RecordBuffer::new();
    loop {
        let more = agent.retrieve_data(&mut sink);
        sink.clear();
        if !more {
            if done.load(Ordering::Acquire) && agent.buffered() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}
