use super::*;
use crate::handler::handler;
use crate::transport::test_helpers::{MockConnector, MockHarness, mock_connector, settle};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

const ENDPOINT: &str = "ws://editor.test/ws/chat/";

fn build(connector: &Arc<MockConnector>, options: ConnectionOptions) -> Connection {
    let conn = Connection::new("chat", ENDPOINT, options, connector.clone(), Handle::current(), false);
    conn.start();
    conn
}

fn quiet() -> ConnectionOptions {
    ConnectionOptions::default().without_heartbeat()
}

fn record_messages(conn: &Connection) -> Arc<Mutex<Vec<Payload>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.on_message(handler(move |p: &Payload| {
        sink.lock().unwrap().push(p.clone());
        Ok(())
    }));
    seen
}

fn record_closes(conn: &Connection) -> Arc<Mutex<Vec<u16>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.on_close(handler(move |e: &CloseEvent| {
        sink.lock().unwrap().push(e.code);
        Ok(())
    }));
    seen
}

fn pings(texts: &[String]) -> usize {
    texts
        .iter()
        .filter(|t| matches!(frames::decode(t), Envelope::Ping { .. }))
        .count()
}

async fn open(harness: &mut MockHarness) -> crate::transport::test_helpers::MockPeer {
    harness.accept_next().await
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn starts_connecting_and_opens_on_handshake() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    assert_eq!(conn.status(), Status::Connecting);

    let pending = harness.next().await;
    assert_eq!(pending.url, ENDPOINT);
    let _peer = pending.accept();
    settle().await;

    assert_eq!(conn.status(), Status::Open);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn offered_protocols_reach_the_connector() {
    let (connector, mut harness) = mock_connector();
    let _conn = build(&connector, quiet().with_protocols(["editor.v1"]));

    let pending = harness.next().await;
    assert_eq!(pending.protocols, vec!["editor.v1".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn open_subscribers_see_name_and_endpoint() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let opened = Arc::new(Mutex::new(None));
    let sink = opened.clone();
    conn.on_open(handler(move |e: &OpenEvent| {
        *sink.lock().unwrap() = Some(e.clone());
        Ok(())
    }));

    let _peer = open(&mut harness).await;

    let event = opened.lock().unwrap().clone().unwrap();
    assert_eq!(event.name, "chat");
    assert_eq!(event.endpoint, ENDPOINT);
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_marks_failed_and_reports_error() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    conn.on_error(handler(move |e: &ConnectionError| {
        sink.lock().unwrap().push(e.is_handshake());
        Ok(())
    }));

    harness.next().await.reject("403");
    settle().await;

    assert_eq!(conn.status(), Status::Failed);
    assert_eq!(*errors.lock().unwrap(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn remote_close_marks_closed_and_notifies() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let closes = record_closes(&conn);
    let peer = open(&mut harness).await;

    peer.close(1011);
    settle().await;

    assert_eq!(conn.status(), Status::Closed);
    assert_eq!(*closes.lock().unwrap(), vec![1011]);
}

#[tokio::test(start_paused = true)]
async fn dropped_link_reports_abnormal_closure() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let closes = record_closes(&conn);
    let peer = open(&mut harness).await;

    drop(peer);
    settle().await;

    assert_eq!(conn.status(), Status::Closed);
    assert_eq!(*closes.lock().unwrap(), vec![ABNORMAL_CLOSURE]);
}

#[tokio::test(start_paused = true)]
async fn transport_errors_reach_error_subscribers() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    conn.on_error(handler(move |e: &ConnectionError| {
        sink.lock().unwrap().push(e.to_string());
        Ok(())
    }));
    let peer = open(&mut harness).await;

    peer.push_error("connection reset");
    settle().await;

    assert_eq!(*errors.lock().unwrap(), vec!["transport error: connection reset".to_owned()]);
    assert_eq!(conn.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn local_close_sends_close_frame_and_emits_event_once() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let closes = record_closes(&conn);
    let mut peer = open(&mut harness).await;

    conn.close(NORMAL_CLOSURE, "done");
    conn.close(NORMAL_CLOSURE, "again");
    settle().await;

    assert_eq!(conn.status(), Status::Closed);
    assert_eq!(*closes.lock().unwrap(), vec![NORMAL_CLOSURE]);
    assert_eq!(peer.sent(), vec![Outgoing::Close { code: NORMAL_CLOSURE, reason: "done".into() }]);

    // The echoed close from the peer belongs to a superseded epoch.
    peer.close(NORMAL_CLOSURE);
    settle().await;
    assert_eq!(closes.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_never_schedules_reconnection_by_itself() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let _peer = open(&mut harness).await;

    conn.close(4000, "custom");
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert!(!conn.reconnect_scheduled());
    assert!(harness.try_next().is_none());
    assert_eq!(conn.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_discards_old_link_and_handshakes_again() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let mut first = open(&mut harness).await;

    conn.reconnect();
    assert_eq!(conn.status(), Status::Connecting);
    assert!(matches!(first.sent().as_slice(), [Outgoing::Close { code: NORMAL_CLOSURE, .. }]));

    let mut second = open(&mut harness).await;
    assert_eq!(conn.status(), Status::Open);

    assert!(conn.send("fresh"));
    assert!(first.sent_texts().is_empty());
    assert_eq!(second.sent_texts(), vec!["fresh".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn connect_is_a_no_op_while_connecting_or_open() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());

    conn.connect();
    let pending = harness.next().await;
    assert!(harness.try_next().is_none());

    let _peer = pending.accept();
    settle().await;
    conn.connect();
    settle().await;
    assert!(harness.try_next().is_none());
}

// =============================================================================
// SENDING AND QUEUEING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sends_before_open_are_queued_and_flushed_in_order() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());

    assert!(!conn.send(json!({"type": "hello"})));
    assert!(!conn.send("second"));
    assert!(!conn.send(json!({"type": "third"})));
    assert_eq!(conn.queue_size(), 3);

    let mut peer = open(&mut harness).await;
    assert!(conn.send("after-open"));

    assert_eq!(conn.queue_size(), 0);
    assert_eq!(
        peer.sent_texts(),
        vec![
            r#"{"type":"hello"}"#.to_owned(),
            "second".to_owned(),
            r#"{"type":"third"}"#.to_owned(),
            "after-open".to_owned(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn open_send_passes_strings_through_unchanged() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let mut peer = open(&mut harness).await;

    assert!(conn.send("not json {"));
    assert_eq!(peer.sent_texts(), vec!["not json {".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn send_failure_is_reported_and_not_requeued() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let mut peer = open(&mut harness).await;

    peer.sever();
    assert!(!conn.send("lost"));
    assert_eq!(conn.queue_size(), 0);
    assert_eq!(conn.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn failed_drain_keeps_remaining_messages_in_order() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    conn.send("one");
    conn.send("two");

    let mut peer = harness.next().await.accept();
    peer.sever();
    settle().await;

    assert_eq!(conn.status(), Status::Open);
    assert_eq!(conn.queue_size(), 2);

    // The next link drains what the first one could not.
    conn.reconnect();
    let mut next = open(&mut harness).await;
    assert_eq!(next.sent_texts(), vec!["one".to_owned(), "two".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn sends_after_closure_queue_for_the_next_open() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let peer = open(&mut harness).await;
    peer.close(1006);
    settle().await;

    assert!(!conn.send("later"));
    conn.connect();
    let mut next = open(&mut harness).await;
    assert_eq!(next.sent_texts(), vec!["later".to_owned()]);
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn inbound_frames_are_decoded_and_pongs_swallowed() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let seen = record_messages(&conn);
    let peer = open(&mut harness).await;

    peer.push_text(r#"{"type":"processing_update","progress":50}"#);
    peer.push_text(r#"{"type":"pong","timestamp":1}"#);
    peer.push_text("plain text");
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].message_type(), Some("processing_update"));
    assert_eq!(seen[1].as_text(), Some("plain text"));
}

#[tokio::test(start_paused = true)]
async fn inbound_ping_is_answered_and_forwarded() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let seen = record_messages(&conn);
    let mut peer = open(&mut harness).await;

    peer.push_text(r#"{"type":"ping","timestamp":42}"#);
    settle().await;

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Payload::Json(json!({"type": "ping", "timestamp": 42})));
    }
    let replies = peer.sent_texts();
    assert_eq!(replies.len(), 1);
    assert_eq!(frames::decode(&replies[0]), Envelope::Pong { timestamp: Some(42) });
}

#[tokio::test(start_paused = true)]
async fn messages_are_dispatched_in_transport_order() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let seen = record_messages(&conn);
    let peer = open(&mut harness).await;

    for n in 0..10 {
        peer.push_text(&format!(r#"{{"type":"tick","n":{n}}}"#));
    }
    settle().await;

    let order: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.as_json().unwrap()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn failing_message_handler_does_not_starve_later_ones() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    conn.on_message(handler(|_: &Payload| panic!("handler bug")));
    conn.on_message(handler(|_: &Payload| Err("handler error".into())));
    let seen = record_messages(&conn);
    let peer = open(&mut harness).await;

    peer.push_text("one");
    peer.push_text("two");
    settle().await;

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(conn.status(), Status::Open);
}

#[tokio::test(start_paused = true)]
async fn off_message_stops_delivery() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let h = handler(move |_: &Payload| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    conn.on_message(h.clone());
    let peer = open(&mut harness).await;

    peer.push_text("one");
    settle().await;
    assert!(conn.off_message(&h));
    assert!(!conn.off_message(&h));
    peer.push_text("two");
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// =============================================================================
// HEARTBEAT AND PAUSE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_at_the_configured_interval() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    let mut peer = open(&mut harness).await;
    assert!(conn.heartbeat_active());

    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_disabled_by_options() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    let mut peer = open(&mut harness).await;

    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert!(!conn.heartbeat_active());
    assert_eq!(pings(&peer.sent_texts()), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_exists_only_while_open() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    assert!(!conn.heartbeat_active());

    let peer = open(&mut harness).await;
    assert!(conn.heartbeat_active());

    peer.close(1006);
    settle().await;
    assert!(!conn.heartbeat_active());
}

#[tokio::test(start_paused = true)]
async fn pause_stops_pings_until_resume() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    let mut peer = open(&mut harness).await;

    conn.pause();
    assert!(conn.is_paused());
    assert!(!conn.heartbeat_active());
    tokio::time::advance(Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 0);
    assert_eq!(conn.status(), Status::Open);

    conn.resume();
    assert!(conn.heartbeat_active());
    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_pause_and_resume_keep_a_single_heartbeat() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    let mut peer = open(&mut harness).await;

    conn.pause();
    conn.pause();
    conn.resume();
    conn.resume();
    conn.resume();
    settle().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(pings(&peer.sent_texts()), 1);
    assert!(!conn.is_paused());
}

#[tokio::test(start_paused = true)]
async fn resume_reconnects_a_dropped_connection_immediately() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    let peer = open(&mut harness).await;

    conn.pause();
    drop(peer);
    settle().await;
    assert_eq!(conn.status(), Status::Closed);
    assert!(harness.try_next().is_none());

    conn.resume();
    assert_eq!(conn.status(), Status::Connecting);
    let _next = open(&mut harness).await;
    assert_eq!(conn.status(), Status::Open);
    assert!(conn.heartbeat_active());
}

#[tokio::test(start_paused = true)]
async fn resume_does_not_restart_an_in_flight_handshake() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());

    let _pending = harness.next().await;
    conn.pause();
    conn.resume();
    settle().await;
    assert!(harness.try_next().is_none());
}

// =============================================================================
// RECONNECTION TIMER
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scheduled_reconnect_counts_before_firing_and_resets_on_open() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    harness.next().await.reject("down");
    settle().await;

    assert_eq!(conn.schedule_reconnect(Duration::from_secs(2)), 1);
    assert_eq!(conn.reconnect_attempts(), 1);
    assert!(conn.reconnect_scheduled());

    tokio::time::advance(Duration::from_millis(1999)).await;
    settle().await;
    assert!(harness.try_next().is_none());

    tokio::time::advance(Duration::from_millis(1)).await;
    let _peer = open(&mut harness).await;
    assert_eq!(conn.reconnect_attempts(), 0);
    assert!(!conn.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn rescheduling_replaces_the_pending_timer() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    harness.next().await.reject("down");
    settle().await;

    conn.schedule_reconnect(Duration::from_secs(1));
    conn.schedule_reconnect(Duration::from_secs(4));
    assert_eq!(conn.reconnect_attempts(), 2);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(harness.try_next().is_none());

    tokio::time::advance(Duration::from_secs(2)).await;
    let _pending = harness.next().await;
    assert!(harness.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn paused_connection_defers_timer_reconnection() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    harness.next().await.reject("down");
    settle().await;

    conn.pause();
    conn.schedule_reconnect(Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(harness.try_next().is_none());
    assert_eq!(conn.status(), Status::Failed);

    conn.resume();
    let _pending = harness.next().await;
}

#[tokio::test(start_paused = true)]
async fn close_cancels_a_scheduled_reconnection() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, quiet());
    harness.next().await.reject("down");
    settle().await;

    conn.schedule_reconnect(Duration::from_secs(1));
    conn.close(NORMAL_CLOSURE, "");
    assert!(!conn.reconnect_scheduled());

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(harness.try_next().is_none());
}

// =============================================================================
// DISPOSAL
// =============================================================================

#[tokio::test(start_paused = true)]
async fn disposed_connection_fires_nothing_afterwards() {
    let (connector, mut harness) = mock_connector();
    let conn = build(&connector, ConnectionOptions::default());
    let seen = record_messages(&conn);
    let closes = record_closes(&conn);
    let mut peer = open(&mut harness).await;
    conn.send("hello");
    peer.sent_texts();

    conn.schedule_reconnect(Duration::from_secs(1));
    conn.dispose();
    assert_eq!(*closes.lock().unwrap(), vec![NORMAL_CLOSURE]);

    peer.push_text("late");
    peer.close(1006);
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(closes.lock().unwrap().len(), 1);
    assert!(harness.try_next().is_none());
    assert_eq!(pings(&peer.sent_texts()), 0);

    conn.connect();
    conn.resume();
    settle().await;
    assert!(harness.try_next().is_none());
    assert_eq!(conn.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn dispose_drops_pending_messages() {
    let (connector, _harness) = mock_connector();
    let conn = build(&connector, quiet());
    conn.send("never sent");
    assert_eq!(conn.queue_size(), 1);

    conn.dispose();
    assert_eq!(conn.queue_size(), 0);
}

// =============================================================================
// STANDALONE
// =============================================================================

#[test]
fn open_outside_a_runtime_is_an_error() {
    let (connector, _harness) = mock_connector();
    let result = Connection::open("chat", ENDPOINT, quiet(), connector);
    assert!(matches!(result, Err(RealtimeError::NoRuntime)));
}

#[tokio::test(start_paused = true)]
async fn standalone_open_connects_immediately() {
    let (connector, mut harness) = mock_connector();
    let conn = Connection::open("chat", ENDPOINT, quiet(), connector).unwrap();
    let _peer = open(&mut harness).await;
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_releases_the_transport() {
    let (connector, mut harness) = mock_connector();
    let conn = Connection::open("chat", ENDPOINT, quiet(), connector).unwrap();
    let mut peer = open(&mut harness).await;
    assert!(conn.is_connected());

    drop(conn);
    settle().await;

    assert!(peer.sent().is_empty());
    assert!(matches!(peer.outbound.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    assert!(peer.events.is_closed());
}

#[test]
fn status_displays_lowercase() {
    assert_eq!(Status::Connecting.to_string(), "connecting");
    assert_eq!(Status::Failed.to_string(), "failed");
}
