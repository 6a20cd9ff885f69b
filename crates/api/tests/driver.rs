use std::sync::Arc;

use serde_json::{json, Value};
use sluice_api::{EngineConfig, ReplayTransport, SearchDriver, TransportEvent};
use sluice_core::{ErrorPayload, QueryPayload, RequestDescriptor, RequestKind, RequestMeta, StreamMessage, TraceId};

fn data(v: Value) -> TransportEvent { TransportEvent::Data(StreamMessage::from_value(v).unwrap().unwrap()) }

fn meta(results: Value) -> TransportEvent {
    data(json!({"type": "search_response_metadata", "content": {"results": results}}))
}

fn hits(rows: Value) -> TransportEvent {
    data(json!({"type": "search_response_hits", "content": {"results": {"hits": rows}}}))
}

fn rows(n: usize) -> Value { Value::Array((0..n).map(|i| json!({"id": i, "level": "info"})).collect()) }

fn search(trace: &str) -> RequestDescriptor {
    let query = QueryPayload { sql: "select * from logs".into(), end_time: 60_000_000, size: 50, ..Default::default() };
    RequestDescriptor::new(RequestKind::Search, query)
        .with_trace_id(trace)
        .with_meta(RequestMeta { rows_per_page: 50, current_page: 1, ..Default::default() })
}

#[tokio::test]
async fn full_page_triggers_count_request_and_fields() {
    let transport = Arc::new(
        ReplayTransport::new()
            .with_script(RequestKind::Search, vec![meta(json!({"took": 4})), hits(rows(30)), meta(json!({"took": 2})), hits(rows(21))])
            .with_script(RequestKind::PageCount, vec![meta(json!({})), hits(json!([{"zo_sql_num": 700}]))]),
    );
    let (mut driver, handle) = SearchDriver::new(transport.clone(), EngineConfig::default());
    driver.start(search("s1")).await.unwrap();
    let snap = driver.run().await.unwrap();

    let q = snap.query(0).unwrap();
    assert_eq!(q.results.hits.len(), 50);
    assert_eq!(q.results.took, 6);
    assert_eq!(q.results.page_count_total, Some(700));
    assert!(!q.loading);
    assert!(q.results.fields.iter().any(|f| f.name == "level" && f.count == 50));
    assert!(!snap.is_loading());
    assert_eq!(handle.current().epoch, snap.epoch);

    let sent = transport.initiated();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].query.size, 51);
    assert_eq!(sent[1].kind, RequestKind::PageCount);
    assert_eq!(sent[1].query.size, 50);
}

#[tokio::test]
async fn token_cancel_stops_streams_and_tells_the_server() {
    let transport = Arc::new(ReplayTransport::new().with_script(RequestKind::Search, vec![hits(rows(3))]).hold_open());
    let (mut driver, handle) = SearchDriver::new(transport.clone(), EngineConfig::default());
    driver.start(search("s1")).await.unwrap();

    let token = driver.cancel_token();
    let h = handle.clone();
    tokio::spawn(async move {
        let mut epochs = h.subscribe_epoch();
        loop {
            if h.current().query(0).map(|q| q.results.hits.len()) == Some(3) {
                break;
            }
            if epochs.changed().await.is_err() {
                break;
            }
        }
        token.cancel();
    });

    let snap = driver.run().await.unwrap();
    assert!(snap.cancelled);
    let q = snap.query(0).unwrap();
    assert!(q.results.cancelled);
    assert!(q.results.is_partial);
    assert_eq!(q.results.hits.len(), 3);
    assert_eq!(transport.cancelled(), vec![TraceId::from("s1")]);
    assert_eq!(driver.notices(), ["Search cancelled; showing partial results".to_string()]);
    assert!(driver.cancel().await.is_empty());
    assert_eq!(driver.notices().len(), 1);
}

#[tokio::test]
async fn new_search_supersedes_the_running_one() {
    let transport = Arc::new(ReplayTransport::new().hold_open());
    let (mut driver, _handle) = SearchDriver::new(transport.clone(), EngineConfig::default());
    driver.start(search("first")).await.unwrap();
    driver.start(search("second")).await.unwrap();
    assert_eq!(transport.cancelled(), vec![TraceId::from("first")]);
    assert_eq!(driver.session().live_traces(), vec![TraceId::from("second")]);
}

#[tokio::test]
async fn transport_error_is_recorded_and_notified() {
    let err = ErrorPayload { message: "query timed out".into(), code: Some(504), ..Default::default() };
    let transport = Arc::new(ReplayTransport::new().with_script(RequestKind::Search, vec![TransportEvent::Error(err)]));
    let (mut driver, _handle) = SearchDriver::new(transport, EngineConfig::default());
    driver.start(search("s1")).await.unwrap();
    let snap = driver.run().await.unwrap();

    let e = snap.query(0).unwrap().results.error.clone().unwrap();
    assert_eq!(e.code, Some(504));
    assert!(e.fatal);
    assert_eq!(driver.notices().len(), 1);
    assert!(driver.notices()[0].ends_with("Trace ID: s1"));
    assert!(!snap.is_loading());
}

#[tokio::test]
async fn reset_replays_from_scratch() {
    let script = vec![meta(json!({"took": 9})), hits(rows(7)), TransportEvent::Reset, meta(json!({"took": 3})), hits(rows(2))];
    let transport = Arc::new(ReplayTransport::new().with_script(RequestKind::Search, script));
    let (mut driver, _handle) = SearchDriver::new(transport, EngineConfig::default());
    driver.start(search("s1")).await.unwrap();
    let snap = driver.run().await.unwrap();
    let q = snap.query(0).unwrap();
    assert_eq!(q.results.hits.len(), 2);
    assert_eq!(q.results.took, 3);
}
