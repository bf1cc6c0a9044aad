mod common;

use basalt_collector::{CollectingLog, Contract};
use common::*;
use lithos_events::RecordBuffer;

#[test]
fn healthy_collectors_verify_clean() {
    for contract in [Contract::Ticker, Contract::Stream, Contract::History] {
        let c = collector(contract);
        let a = agent(&c, "a");
        let b = agent(&c, "b");
        let items = [("IBM", 10), ("A_LONG_SYMBOL", 20), ("MSFT", 30)];
        let sub = |items: &[(&str, i64)]| match contract {
            Contract::History => trade_sub(&c, items),
            _ => quote_sub(&c, &items.iter().map(|i| i.0).collect::<Vec<_>>()),
        };
        a.add_subscription(&mut sub(&items)).unwrap();
        b.add_subscription(&mut sub(&items[1..])).unwrap();
        let data = match contract {
            Contract::History => RecordBuffer::from_cursors(items.map(|(s, t)| trade(&c, s, t, 1))),
            _ => RecordBuffer::from_cursors(items.map(|(s, _)| quote(&c, s, 1))),
        };
        c.process_data(&mut data.clone()).unwrap();
        a.remove_subscription(&mut sub(&items[..1])).unwrap();

        let log = CollectingLog::default();
        assert_eq!(c.verify(&log).unwrap(), 0, "{contract}: {:?}", log.warnings());
        assert!(log.infos().iter().any(|l| l.starts_with("Verified")));
    }
}

#[test]
fn queue_analysis_reports_each_agent() {
    let c = collector(Contract::Ticker);
    let a = agent(&c, "a");
    let b = agent(&c, "b");
    a.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    b.add_subscription(&mut quote_sub(&c, &["IBM"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "IBM", 1)])).unwrap();
    drain(&a);

    let log = CollectingLog::default();
    c.analyze_queue(&log, "IBM", "Quote");
    let infos = log.infos();
    assert_eq!(infos.len(), 2);
    let about = |n: i32| infos.iter().find(|l| l.starts_with(&format!("agent #{n} "))).cloned().unwrap();
    assert!(about(a.number()).contains("queued false"));
    assert!(about(b.number()).contains("queued true"));

    let log = CollectingLog::default();
    c.analyze_queue(&log, "IBM", "NoSuchRecord");
    assert_eq!(log.warnings().len(), 1);
}

#[test]
fn history_queue_analysis_shows_times() {
    let c = collector(Contract::History);
    let a = agent(&c, "a");
    a.add_subscription(&mut trade_sub(&c, &[("IBM", 100)])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([trade(&c, "IBM", 120, 1)])).unwrap();
    let log = CollectingLog::default();
    c.analyze_queue(&log, "IBM", "Trade");
    let infos = log.infos();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].contains("time_sub=100"));
    assert!(infos[0].contains("time_known=120"));
    assert!(infos[0].contains("in buffer true"));
}

#[test]
fn symbol_refs_cover_total_agents_and_storage() {
    let c = collector(Contract::Ticker);
    let a = agent(&c, "a");
    let b = agent(&c, "b");
    a.add_subscription(&mut quote_sub(&c, &["A_LONG_SYMBOL"])).unwrap();
    b.add_subscription(&mut quote_sub(&c, &["A_LONG_SYMBOL"])).unwrap();
    c.process_data(&mut RecordBuffer::from_cursors([quote(&c, "A_LONG_SYMBOL", 1)])).unwrap();

    let log = CollectingLog::default();
    c.analyze_symbol_refs(&log, "A_LONG_SYMBOL", None);
    let infos = log.infos();
    assert!(infos[0].contains("with 4 references"), "{infos:?}");
    assert_eq!(infos.iter().filter(|l| l.contains(" payload ")).count(), 3);
    assert!(infos.iter().any(|l| l.starts_with("storage:")));
    assert_eq!(infos.last().map(String::as_str), Some("Found 4 references to A_LONG_SYMBOL"));

    let log = CollectingLog::default();
    c.analyze_symbol_refs(&log, "NEVER_SEEN_SYMBOL", Some("Quote"));
    assert_eq!(log.infos(), vec!["Symbol NEVER_SEEN_SYMBOL is not mapped".to_string()]);
}
