#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use oplive_core::{doc_id, Document, QueryDescriptor, SortOrder};
use oplive_driver::{DriverConfig, DriverContext, LiveQueries, LiveQueryError, ObserveHandle, ObserverEvent, OplogDriver, Phase, WriteFence};
use oplive_selector::Matcher;
use oplive_store::{DocumentSource, MemoryDb, Tailer, TailerConfig};
use serde_json::{json, Value};

fn doc(v: Value) -> Document { v.as_object().cloned().unwrap() }

fn setup(tailer_cfg: TailerConfig) -> (Arc<MemoryDb>, LiveQueries) {
    let db = Arc::new(MemoryDb::new("app", Tailer::spawn(tailer_cfg)));
    let cfg = DriverConfig { requery_retry_delay: Duration::from_millis(5), ..DriverConfig::default() };
    let ctx = DriverContext::new(db.clone(), db.tailer().clone(), cfg);
    (db, LiveQueries::new(ctx))
}

/// Wait until every live query on `collection` reflects all writes so far.
async fn settle(live: &LiveQueries, collection: &str) {
    let fence = WriteFence::new();
    live.notify_write(collection, &fence).unwrap();
    tokio::time::timeout(Duration::from_secs(5), fence.arm_and_wait()).await.expect("fence fired");
}

fn drain(h: &mut ObserveHandle) -> Vec<ObserverEvent> {
    let mut out = Vec::new();
    while let Some(ev) = h.try_recv() {
        out.push(ev);
    }
    out
}

async fn until_ready(h: &mut ObserveHandle) -> Vec<ObserverEvent> {
    let mut out = Vec::new();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), h.recv()).await.expect("event").expect("open");
        let done = matches!(ev, ObserverEvent::Ready | ObserverEvent::Error(_));
        out.push(ev);
        if done {
            return out;
        }
    }
}

fn by_rank(limit: usize) -> QueryDescriptor {
    QueryDescriptor::new("items", json!({"kind": "task"})).sort_by("rank", SortOrder::Asc).limit(limit)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_sees_initial_set_then_changes() {
    let (db, live) = setup(TailerConfig::default());
    db.seed("items", doc(json!({"_id": "a", "kind": "task", "rank": 2}))).unwrap();
    db.seed("items", doc(json!({"_id": "b", "kind": "note", "rank": 1}))).unwrap();

    let mut h = live.observe_changes(by_rank(5)).unwrap();
    let initial = until_ready(&mut h).await;
    assert_eq!(initial, vec![ObserverEvent::Added { id: "a".into(), fields: doc(json!({"kind": "task", "rank": 2})) }, ObserverEvent::Ready]);

    db.insert("items", doc(json!({"_id": "c", "kind": "task", "rank": 0}))).unwrap();
    db.update("items", "a", &json!({"$set": {"title": "x"}})).unwrap();
    db.remove("items", "b").unwrap();
    settle(&live, "items").await;

    let evs = drain(&mut h);
    assert_eq!(evs.len(), 2);
    assert!(matches!(&evs[0], ObserverEvent::Added { id, .. } if id == "c"));
    assert!(matches!(&evs[1], ObserverEvent::Changed { id, fields } if id == "a" && fields["title"] == Some(json!("x"))));
    assert_eq!(h.driver().snapshot().phase, Phase::Steady);
    assert_eq!(h.driver().stats().fetches, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_queries_share_one_driver() {
    let (db, live) = setup(TailerConfig::default());
    db.seed("items", doc(json!({"_id": "a", "kind": "task", "rank": 1}))).unwrap();

    let mut first = live.observe_changes(by_rank(3)).unwrap();
    until_ready(&mut first).await;
    let mut second = live.observe_changes(by_rank(3)).unwrap();
    let replay = until_ready(&mut second).await;
    assert_eq!(replay.len(), 2, "cached add + ready");
    assert_eq!(live.len(), 1);
    assert_eq!(db.query_count(), 1);

    let other = live.observe_changes(by_rank(4)).unwrap();
    assert_eq!(live.len(), 2);

    first.stop();
    assert_eq!(live.len(), 2);
    drop(second);
    assert_eq!(live.len(), 1);
    drop(other);
    assert!(live.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handle_streams_events_in_order() {
    let (db, live) = setup(TailerConfig::default());
    db.seed("items", doc(json!({"_id": "a", "kind": "task", "rank": 1}))).unwrap();
    let events = live.observe_changes(by_rank(2)).unwrap().into_stream();
    tokio::pin!(events);
    assert!(matches!(events.next().await, Some(ObserverEvent::Added { id, .. }) if id == "a"));
    assert_eq!(events.next().await, Some(ObserverEvent::Ready));

    db.remove("items", "a").unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(5), events.next()).await.expect("event");
    assert_eq!(ev, Some(ObserverEvent::Removed { id: "a".into() }));
    drop(events);
    assert!(live.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_queries_are_rejected() {
    let (_db, live) = setup(TailerConfig::default());
    let cases = [
        QueryDescriptor::new("items", json!({})).skip(1),
        QueryDescriptor::new("items", json!({})).limit(2),
        QueryDescriptor::new("items", json!({"$where": "this.a > 1"})),
        QueryDescriptor::new("items", json!({"$text": {"$search": "x"}})),
        QueryDescriptor::new("items", json!({"loc": {"$near": [0, 0]}})),
    ];
    for desc in cases {
        let matcher = Matcher::compile(&desc.selector).unwrap();
        assert!(!OplogDriver::supports(&desc, &matcher));
        assert!(matches!(live.observe_changes(desc), Err(LiveQueryError::Unsupported(_))));
    }
    assert!(matches!(live.observe_changes(QueryDescriptor::new("items", json!({"a": {"$bogus": 1}}))), Err(LiveQueryError::Selector(_))));
    let mixed = QueryDescriptor::new("items", json!({})).fields(doc(json!({"a": 1, "b": 0})));
    assert!(live.observe_changes(mixed).is_err());
    assert!(live.is_empty());

    // A zero limit is no limit, so it needs no sort.
    let unlimited = QueryDescriptor::new("items", json!({})).limit(0);
    let matcher = Matcher::compile(&unlimited.selector).unwrap();
    assert_eq!(OplogDriver::unsupported_reason(&unlimited, &matcher), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_initial_query_reaches_observers() {
    let (db, live) = setup(TailerConfig::default());
    db.fail_next_queries(1);
    let mut h = live.observe_changes(by_rank(2)).unwrap();
    let evs = until_ready(&mut h).await;
    assert!(matches!(evs.as_slice(), [ObserverEvent::Error(msg)] if msg.contains("initial query")));
    let snap = h.driver().wait_until(|s| s.stopped).await;
    assert!(snap.stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requery_retries_until_the_store_answers() {
    let (db, live) = setup(TailerConfig::default());
    db.seed("items", doc(json!({"_id": "a", "kind": "task", "rank": 1}))).unwrap();
    let mut h = live.observe_changes(by_rank(2)).unwrap();
    until_ready(&mut h).await;

    db.fail_next_queries(3);
    db.tailer().signal_failover();
    db.insert("items", doc(json!({"_id": "b", "kind": "task", "rank": 2}))).unwrap();
    settle(&live, "items").await;

    assert_eq!(db.query_count(), 5);
    assert_eq!(h.driver().stats().requeries, 1);
    let snap = h.driver().snapshot();
    assert_eq!(snap.phase, Phase::Steady);
    assert_eq!(snap.published_ids(), vec!["a", "b"]);
    assert!(drain(&mut h).iter().any(|e| matches!(e, ObserverEvent::Added { id, .. } if id == "b")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_collection_clears_observers() {
    let (db, live) = setup(TailerConfig::default());
    for (id, rank) in [("a", 1), ("b", 2)] {
        db.seed("items", doc(json!({"_id": id, "kind": "task", "rank": rank}))).unwrap();
    }
    let mut h = live.observe_changes(by_rank(5)).unwrap();
    until_ready(&mut h).await;

    db.drop_collection("items");
    db.insert("items", doc(json!({"_id": "c", "kind": "task", "rank": 3}))).unwrap();
    settle(&live, "items").await;

    let evs = drain(&mut h);
    let mut removed: Vec<&str> = evs.iter().filter_map(|e| match e { ObserverEvent::Removed { id } => Some(id.as_str()), _ => None }).collect();
    removed.sort_unstable();
    assert_eq!(removed, vec!["a", "b"]);
    assert_eq!(h.driver().snapshot().published_ids(), vec!["c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_fetches_of_one_document_hit_the_store_once() {
    let (db, live) = setup(TailerConfig::default());
    db.seed("items", doc(json!({"_id": "x", "kind": "draft", "rank": 9}))).unwrap();
    let mut h1 = live.observe_changes(by_rank(2)).unwrap();
    let mut h2 = live.observe_changes(QueryDescriptor::new("items", json!({"kind": "task"}))).unwrap();
    until_ready(&mut h1).await;
    until_ready(&mut h2).await;

    db.set_fetch_delay(Duration::from_millis(50));
    // Not cached by either query, but could now match: both must fetch it.
    db.update("items", "x", &json!({"$set": {"kind": "task"}})).unwrap();
    settle(&live, "items").await;

    assert_eq!(db.fetch_count(), 1);
    assert_eq!(h1.driver().stats().fetches, 1);
    assert_eq!(h2.driver().stats().fetches, 1);
    assert_eq!(h1.driver().snapshot().published_ids(), vec!["x"]);
    assert_eq!(h2.driver().snapshot().published_ids(), vec!["x"]);
}

#[tokio::test(flavor = "current_thread")]
async fn tailer_gap_triggers_a_resync() {
    let (db, live) = setup(TailerConfig { too_far_behind: 4 });
    let mut h = live.observe_changes(by_rank(3)).unwrap();
    until_ready(&mut h).await;
    h.driver().wait_until(|s| s.phase == Phase::Steady).await;

    // Nothing is dispatched until we yield, so this whole batch is backlog.
    for i in 0..20 {
        db.insert("items", doc(json!({"_id": format!("d{:02}", i), "kind": "task", "rank": 20 - i}))).unwrap();
    }
    settle(&live, "items").await;

    let snap = h.driver().snapshot();
    assert_eq!(h.driver().stats().requeries, 1);
    assert_eq!(snap.published_ids(), vec!["d19", "d18", "d17"]);
    assert_eq!(snap.buffer_ids(), vec!["d16", "d15", "d14"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn windows_match_a_fresh_query_after_mixed_writes() {
    let (db, live) = setup(TailerConfig::default());
    let desc = by_rank(4);
    let mut h = live.observe_changes(desc.clone()).unwrap();
    until_ready(&mut h).await;

    let mut seed = 0x5DEE_CE66_Du64;
    let mut next = move |n: u64| {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) % n
    };
    for round in 0..30 {
        for _ in 0..10 {
            let id = format!("d{}", next(25));
            let kind = if next(4) == 0 { "note" } else { "task" };
            match next(5) {
                0 | 1 => {
                    let _ = db.insert("items", doc(json!({"_id": id, "kind": kind, "rank": next(50)})));
                }
                2 => {
                    db.update("items", &id, &json!({"$set": {"rank": next(50)}})).unwrap();
                }
                3 => {
                    db.update("items", &id, &json!({"$set": {"kind": kind}, "$inc": {"hits": 1}})).unwrap();
                }
                _ => {
                    db.remove("items", &id).unwrap();
                }
            }
        }
        settle(&live, "items").await;
        let snap = h.driver().snapshot();
        let fresh = db.find(&QueryDescriptor { limit: None, ..desc.clone() }, None).await.unwrap();
        let fresh: Vec<&str> = fresh.iter().filter_map(doc_id).collect();
        let n = fresh.len().min(4);
        assert_eq!(snap.phase, Phase::Steady, "round {}", round);
        assert_eq!(snap.published_ids(), fresh[..n].to_vec(), "round {}", round);
        assert_eq!(snap.buffer_ids(), fresh[n..n + snap.buffer.len()].to_vec(), "round {}", round);
        assert!(snap.buffer.len() <= 4);
    }
}
