use basalt_collector::{AgentBuilder, Collector, Contract};
use basalt_perf::{bench_config, bench_record, bench_scheme, bench_symbols, subscribed_agents, subscription};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription");

    for contract in [Contract::Ticker, Contract::History] {
        let collector = Collector::new(contract, bench_scheme(), bench_config()).expect("collector");
        let record = bench_record(&collector).expect("record");
        let symbols = bench_symbols(10_000);
        let _resident = subscribed_agents(&collector, &record, &symbols, 4).expect("agents");
        let agent = collector
            .create_agent(AgentBuilder::new().name("churn"))
            .expect("agent");
        let chunk = &symbols[..128];

        group.throughput(Throughput::Elements(chunk.len() as u64));
        group.bench_function(format!("{contract}/add_remove_128"), |b| {
            b.iter(|| {
                agent
                    .add_subscription(&mut subscription(&collector, &record, chunk))
                    .expect("add");
                agent
                    .remove_subscription(&mut subscription(&collector, &record, chunk))
                    .expect("remove");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add_remove);
criterion_main!(benches);
