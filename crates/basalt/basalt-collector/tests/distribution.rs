//! Delivery through `process_data` for each contract, including buffer
//! overflow handling and backpressure from a slow consumer.

mod common;

use basalt_collector::{AgentBuilder, Collector, CollectorError, Contract};
use basalt_config::{BufferOverflowStrategy, CollectorConfig};
use common::*;
use lithos_events::RecordBuffer;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

fn bids(c: &basalt_collector::Collector, records: &[lithos_events::RecordCursor]) -> Vec<(String, i32)> {
    records.iter().map(|r| (symbol_of(c, r), r.int(0))).collect()
}

#[test]
fn ticker_conflates_to_latest_value() {
    let c = collector(Contract::Ticker);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM", "MSFT"])).unwrap();

    let mut data = RecordBuffer::from_cursors([
        quote(&c, "IBM", 1),
        quote(&c, "IBM", 2),
        quote(&c, "ORCL", 7),
        quote(&c, "IBM", 3),
    ]);
    c.process_data(&mut data).unwrap();
    assert_eq!(bids(&c, &drain(&a)), vec![("IBM".to_string(), 3)]);
    assert!(drain(&a).is_empty());

    // unchanged values are not redelivered
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 3)])).unwrap();
    assert!(drain(&a).is_empty());
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 4), quote(&c, "MSFT", 9)])).unwrap();
    let mut got = bids(&c, &drain(&a));
    got.sort();
    assert_eq!(got, vec![("IBM".to_string(), 4), ("MSFT".to_string(), 9)]);

    let counters = c.management().counters().snapshot();
    assert_eq!(counters.incoming, 7);
    assert_eq!(counters.retrieved, 3);
}

#[test]
fn ticker_snapshot_for_late_subscriber() {
    let c = collector(Contract::Ticker);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 5)])).unwrap();

    let (snapshots, listener) = counting_listener();
    let b = c
        .create_agent(AgentBuilder::new().name("late").snapshot_listener(listener))
        .unwrap();
    b.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    assert_eq!(snapshots.load(Ordering::Relaxed), 1);
    assert_eq!(bids(&c, &drain(&b)), vec![("IBM".to_string(), 5)]);

    let ibm = quote(&c, "IBM", 0);
    assert_eq!(c.get_data(ibm.record(), ibm.cipher(), None).map(|q| q.int(0)), Some(5));
    c.remove_data(&mut RecordBuffer::from_cursors([ibm.clone()])).unwrap();
    assert!(!c.is_available(ibm.record(), ibm.cipher(), None));
}

#[test]
fn ticker_storage_is_dropped_with_last_subscriber() {
    let c = collector(Contract::Ticker);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 5)])).unwrap();
    let mut examined = RecordBuffer::new();
    a.close_and_examine(&mut examined).unwrap();
    assert_eq!(bids(&c, &examined.into_vec()), vec![("IBM".to_string(), 5)]);
    let mut stored = RecordBuffer::new();
    assert!(!c.examine_data(&mut stored));
    assert_eq!(stored.size(), 0);
}

#[test]
fn stream_delivers_every_record_in_order() {
    let c = collector(Contract::Stream);
    let (wakeups, listener) = counting_listener();
    let a = c
        .create_agent(AgentBuilder::new().data_listener(listener))
        .unwrap();
    let b = agent(&c, "b");
    a.add_subscription(&mut quote_sub(&c, &["IBM", "MSFT"])).unwrap();
    b.add_subscription(&mut quote_sub(&c, &["MSFT"])).unwrap();

    let mut data = RecordBuffer::from_cursors((0..5).map(|i| quote(&c, if i % 2 == 0 { "IBM" } else { "MSFT" }, i)));
    c.process_data(&mut data).unwrap();
    assert_eq!(wakeups.load(Ordering::Relaxed), 1);
    assert_eq!(drain(&a).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    assert_eq!(drain(&b).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(c.management().counters().snapshot().outgoing, 7);
}

#[test]
fn stream_retrieval_respects_sink_capacity() {
    let c = collector(Contract::Stream);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors((0..5).map(|i| quote(&c, "IBM", i)))).unwrap();
    let mut sink = RecordBuffer::with_capacity_limit(2);
    assert!(a.retrieve_data(&mut sink));
    assert_eq!(sink.size(), 2);
    assert_eq!(drain(&a).len(), 3);
}

#[test]
fn unsubscribed_records_leave_the_buffer() {
    let c = collector(Contract::Stream);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM", "MSFT"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 1), quote(&c, "MSFT", 2)])).unwrap();
    a.remove_subscription(&mut quote_sub(&c, &["MSFT"])).unwrap();
    assert_eq!(a.buffered(), 1);
    assert_eq!(bids(&c, &drain(&a)), vec![("IBM".to_string(), 1)]);
}

#[test]
fn drop_oldest_keeps_the_tail() {
    let config = CollectorConfig {
        agent_buffer_size: 2,
        buffer_overflow_strategy: BufferOverflowStrategy::DropOldest,
        ..CollectorConfig::default()
    };
    let c = collector_with(Contract::Stream, config);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors((0..4).map(|i| quote(&c, "IBM", i)))).unwrap();
    assert_eq!(drain(&a).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(c.management().counters().snapshot().dropped, 2);
}

#[test]
fn drop_newest_keeps_the_head() {
    let c = collector(Contract::Stream);
    let a = c
        .create_agent(
            AgentBuilder::new()
                .buffer_size(2)
                .overflow_strategy(BufferOverflowStrategy::DropNewest),
        )
        .unwrap();
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors((0..4).map(|i| quote(&c, "IBM", i)))).unwrap();
    assert_eq!(drain(&a).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn block_waits_for_the_consumer() {
    const TOTAL: i32 = 200;
    let c = collector(Contract::Stream);
    let a = c
        .create_agent(
            AgentBuilder::new()
                .buffer_size(8)
                .overflow_strategy(BufferOverflowStrategy::Block),
        )
        .unwrap();
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();

    let consumer = {
        let a = a.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(30);
            let mut got = Vec::new();
            while got.len() < TOTAL as usize && Instant::now() < deadline {
                let mut sink = RecordBuffer::new();
                a.retrieve_data(&mut sink);
                got.extend(sink.iter().map(|q| q.int(0)));
                thread::sleep(Duration::from_micros(200));
            }
            got
        })
    };

    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            let mut data = RecordBuffer::from_cursors((0..TOTAL).map(|i| quote(&c, "IBM", i)));
            c.process_data(&mut data).unwrap();
        })
    };
    producer.join().unwrap();
    let got = consumer.join().unwrap();
    assert_eq!(got, (0..TOTAL).collect::<Vec<_>>());
    assert_eq!(c.management().counters().snapshot().dropped, 0);
}

#[test]
fn stalled_agent_does_not_starve_others() {
    let c = collector(Contract::Stream);
    let stalled = c
        .create_agent(
            AgentBuilder::new()
                .buffer_size(2)
                .overflow_strategy(BufferOverflowStrategy::Block),
        )
        .unwrap();
    let healthy = agent(&c, "healthy");
    stalled.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    healthy.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();

    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            let mut data = RecordBuffer::from_cursors((0..5).map(|i| quote(&c, "IBM", i)));
            c.process_data(&mut data).unwrap();
        })
    };

    let deadline = Instant::now() + Duration::from_secs(30);
    while healthy.buffered() < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(healthy.buffered(), 5);
    assert!(!producer.is_finished());

    let mut got = Vec::new();
    while got.len() < 5 && Instant::now() < deadline {
        got.extend(drain(&stalled).iter().map(|q| q.int(0)));
        thread::sleep(Duration::from_millis(1));
    }
    producer.join().unwrap();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
    assert_eq!(c.management().counters().snapshot().dropped, 0);
}

#[test]
fn closing_a_blocked_agent_releases_the_producer() {
    let c = collector(Contract::Stream);
    let a = c
        .create_agent(
            AgentBuilder::new()
                .buffer_size(1)
                .overflow_strategy(BufferOverflowStrategy::Block),
        )
        .unwrap();
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            let mut data = RecordBuffer::from_cursors((0..10).map(|i| quote(&c, "IBM", i)));
            c.process_data(&mut data)
        })
    };
    while a.buffered() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    a.close().unwrap();
    producer.join().unwrap().unwrap();
    assert_eq!(c.subscription_size(), 0);
}

#[test]
fn history_delivers_from_subscription_time() {
    let c = collector(Contract::History);
    let a = agent(&c, "a");
    let b = agent(&c, "b");
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 100)])).unwrap();
    b.add_subscription(&mut trade_sub(&c, &[("IBM", 50)])).unwrap();

    let mut data = RecordBuffer::from_cursors([40, 70, 100, 150].map(|t| trade(&c, "IBM", t, t as i32)));
    c.process_data(&mut data).unwrap();
    let times = |h: &basalt_collector::AgentHandle| drain(h).iter().map(|q| q.time()).collect::<Vec<_>>();
    assert_eq!(times(&a), vec![100, 150]);
    assert_eq!(times(&b), vec![70, 100, 150]);
}

#[test]
fn history_resubscription_trims_buffered_records() {
    let c = collector(Contract::History);
    let a = agent(&c, "a");
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 100), ("MSFT", 100)])).unwrap();
    let mut data = RecordBuffer::from_cursors([
        trade(&c, "IBM", 100, 1),
        trade(&c, "MSFT", 110, 2),
        trade(&c, "IBM", 150, 3),
    ]);
    c.process_data(&mut data).unwrap();
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 120)])).unwrap();
    let got: Vec<(String, i64)> = drain(&a).iter().map(|q| (symbol_of(&c, q), q.time())).collect();
    assert_eq!(got, vec![("MSFT".to_string(), 110), ("IBM".to_string(), 150)]);
}

#[test]
fn agent_sees_its_attachment_on_data() {
    struct Keep;
    impl basalt_collector::AttachmentStrategy for Keep {
        fn update_attachment(
            &self,
            old: Option<lithos_events::Attachment>,
            _cursor: &lithos_events::RecordCursor,
            remove: bool,
        ) -> Option<lithos_events::Attachment> {
            if remove { None } else { old }
        }
    }
    let c = collector(Contract::Stream);
    let a = c
        .create_agent(AgentBuilder::new().attachment_strategy(Arc::new(Keep)))
        .unwrap();
    let tag: lithos_events::Attachment = Arc::new("desk-7");
    a.add_subscription(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 0).with_attachment(tag)]))
        .unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 1)])).unwrap();
    let got = drain(&a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].attachment().and_then(|t| t.downcast_ref::<&str>()), Some(&"desk-7"));
}

#[test]
fn fatal_error_halts_until_cleared() {
    let c = collector(Contract::Stream);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    let reserved = lithos_events::RecordCursor::new(quote_record(&c), 0x0000_0042, None);
    let err = c.process_data(&mut RecordBuffer::from_cursors([reserved])).unwrap_err();
    assert!(err.is_fatal());
    assert!(c.management().fatal_error().is_some());
    assert!(c.process_data(&mut RecordBuffer::new()).is_err());
    assert!(a.add_subscription(&mut quote_sub(&c, &["MSFT"])).is_err());

    c.management().clear_fatal_error();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 1)])).unwrap();
    assert_eq!(drain(&a).len(), 1);
}

#[test]
fn unknown_record_mid_batch_still_delivers_what_came_before() {
    let c = collector(Contract::Stream);
    let a = agent(&c, "a");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    let foreign_scheme = scheme();
    let foreign = foreign_scheme.cursor(foreign_scheme.find_record("Quote").unwrap(), "IBM");
    let mut data = RecordBuffer::from_cursors([quote(&c, "IBM", 1), quote(&c, "IBM", 2), foreign, quote(&c, "IBM", 3)]);

    let err = c.process_data(&mut data).unwrap_err();
    assert!(matches!(err, CollectorError::UnknownRecord { .. }), "{err}");
    assert!(c.management().fatal_error().is_some());
    assert!(c.process_data(&mut RecordBuffer::new()).is_err());
    assert_eq!(bids(&c, &drain(&a)), vec![("IBM".to_string(), 1), ("IBM".to_string(), 2)]);
}

#[test]
fn zero_distribution_bucket_is_rejected() {
    let config = CollectorConfig {
        distribution_bucket: 0,
        ..CollectorConfig::default()
    };
    let err = Collector::new(Contract::Stream, scheme(), config).unwrap_err();
    assert!(matches!(err, CollectorError::Config(_)), "{err}");
}

#[test]
fn late_history_subscriber_gets_stored_records_from_its_time() {
    let c = collector(Contract::History);
    let a = agent(&c, "a");
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 10)])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([10, 20, 30].map(|t| trade(&c, "IBM", t, t as i32)))).unwrap();
    assert_eq!(drain(&a).len(), 3);

    let (wakeups, listener) = counting_listener();
    let b = c
        .create_agent(AgentBuilder::new().name("late").data_listener(listener))
        .unwrap();
    b.add_subscription(&mut trade_sub(&c, &[("IBM", 20)])).unwrap();
    assert_eq!(wakeups.load(Ordering::Relaxed), 1);
    let prices = |h: &basalt_collector::AgentHandle| drain(h).iter().map(|q| (q.time(), q.int(2))).collect::<Vec<_>>();
    assert_eq!(prices(&b), vec![(20, 20), (30, 30)]);

    // same time again replays nothing; an earlier time replays only the gap
    b.add_subscription(&mut trade_sub(&c, &[("IBM", 20)])).unwrap();
    assert_eq!(b.buffered(), 0);
    b.add_subscription(&mut trade_sub(&c, &[("IBM", 10)])).unwrap();
    assert_eq!(prices(&b), vec![(10, 10)]);

    c.process_data(&mut RecordBuffer::from_cursors([trade(&c, "IBM", 40, 40)])).unwrap();
    assert_eq!(prices(&a), vec![(40, 40)]);
    assert_eq!(prices(&b), vec![(40, 40)]);
    let ibm = trade(&c, "IBM", 0, 0);
    assert_eq!(c.get_history(ibm.record(), ibm.cipher(), None, 25).len(), 2);
}

#[test]
fn history_is_dropped_with_last_subscriber() {
    let c = collector(Contract::History);
    let a = agent(&c, "a");
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 0)])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([trade(&c, "IBM", 5, 1)])).unwrap();
    a.remove_subscription(&mut trade_sub(&c, &[("IBM", 0)])).unwrap();

    let b = agent(&c, "b");
    b.add_subscription(&mut trade_sub(&c, &[("IBM", 0)])).unwrap();
    assert_eq!(b.buffered(), 0);
    let ibm = trade(&c, "IBM", 0, 0);
    assert!(c.get_history(ibm.record(), ibm.cipher(), None, 0).is_empty());
}

#[test]
fn only_subscribed_agents_are_notified() {
    let c = collector(Contract::Stream);
    let listeners: Vec<_> = (0..3).map(|_| counting_listener()).collect();
    let agents: Vec<_> = listeners
        .iter()
        .zip(["a", "b", "c"])
        .map(|((_, l), name)| {
            c.create_agent(AgentBuilder::new().name(name).data_listener(l.clone()))
                .unwrap()
        })
        .collect();
    for a in &agents {
        a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    }
    agents[2].remove_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();

    let mut data = RecordBuffer::from_cursors([quote(&c, "IBM", 1), quote(&c, "MSFT", 2), quote(&c, "IBM", 3)]);
    c.process_data(&mut data).unwrap();
    let counts: Vec<usize> = listeners.iter().map(|(n, _)| n.load(Ordering::Relaxed)).collect();
    assert_eq!(counts, vec![1, 1, 0]);
    for a in &agents[..2] {
        assert_eq!(bids(&c, &drain(a)), vec![("IBM".to_string(), 1), ("IBM".to_string(), 3)]);
    }
    assert!(drain(&agents[2]).is_empty());
}

#[test]
fn blocked_batch_is_delivered_once_the_buffer_drains() {
    let c = collector(Contract::Stream);
    let (wakeups, listener) = counting_listener();
    let a = c
        .create_agent(
            AgentBuilder::new()
                .buffer_size(5)
                .overflow_strategy(BufferOverflowStrategy::Block)
                .data_listener(listener),
        )
        .unwrap();
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors((10..15).map(|i| quote(&c, "IBM", i)))).unwrap();
    assert_eq!(wakeups.load(Ordering::Relaxed), 1);

    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            let mut data = RecordBuffer::from_cursors((0..5).map(|i| quote(&c, "IBM", i)));
            c.process_data(&mut data).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!producer.is_finished());
    assert_eq!(a.buffered(), 5);

    assert_eq!(drain(&a).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![10, 11, 12, 13, 14]);
    producer.join().unwrap();
    assert_eq!(drain(&a).iter().map(|q| q.int(0)).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    assert_eq!(wakeups.load(Ordering::Relaxed), 2);
    assert_eq!(c.management().counters().snapshot().dropped, 0);
}
