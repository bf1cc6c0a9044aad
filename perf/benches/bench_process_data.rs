use basalt_collector::{Collector, Contract};
use basalt_perf::{bench_config, bench_record, bench_scheme, bench_symbols, drain, make_batch, subscribed_agents};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lithos_events::RecordBuffer;

const BATCH: usize = 256;

fn bench_contracts(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_data");
    group.throughput(Throughput::Elements(BATCH as u64));

    for contract in [Contract::Ticker, Contract::Stream, Contract::History] {
        for agents in [1usize, 8] {
            let collector = Collector::new(contract, bench_scheme(), bench_config()).expect("collector");
            let record = bench_record(&collector).expect("record");
            let symbols = bench_symbols(1_000);
            let handles = subscribed_agents(&collector, &record, &symbols, agents).expect("agents");
            let batch = make_batch(&collector, &record, &symbols, BATCH, 1);

            group.bench_with_input(
                BenchmarkId::new(contract.to_string(), agents),
                &agents,
                |b, _| {
                    b.iter(|| {
                        let mut data = RecordBuffer::from_cursors(batch.iter().cloned());
                        collector.process_data(&mut data).expect("process_data");
                        drain(&handles)
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_contracts);
criterion_main!(benches);
