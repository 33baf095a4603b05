// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Integration tests for the correlation engine over in-memory streams.

use std::collections::HashSet;
use std::time::Duration;

use loom_codex_core::protocol::{
	ERROR_METHOD_NOT_FOUND, METHOD_INITIALIZED, METHOD_REQUEST_USER_INPUT,
	NOTIFY_AGENT_MESSAGE_DELTA, NOTIFY_ERROR, NOTIFY_TURN_COMPLETED,
};
use loom_codex_core::testing::{settle, FakePeer};
use loom_codex_core::{
	AppServerClient, ClientConfig, ClientError, ClientInfo, CoreEvent, CoreEventKind, Transport,
	TurnStatus, TurnTracker,
};
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn connect() -> (AppServerClient, FakePeer) {
	let (transport, peer) = FakePeer::pair();
	(AppServerClient::start(transport, ClientConfig::default()), peer)
}

async fn next_event_of(
	rx: &mut broadcast::Receiver<CoreEvent>,
	kind: CoreEventKind,
) -> CoreEvent {
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			match rx.recv().await {
				Ok(event) if event.kind == kind => return event,
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
			}
		}
	})
	.await
	.expect("event within timeout")
}

/// A response is matched to its waiter by id and the waiter is released.
#[tokio::test]
async fn test_request_resolves_with_matching_response() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("model/list", json!({}), &cancel).await })
	};

	let request = peer.next_request().await.unwrap();
	assert_eq!(request.method.as_deref(), Some("model/list"));
	assert_eq!(request.numeric_id(), Some(1));
	peer
		.respond(request.id.as_ref().unwrap(), json!({"data": []}))
		.await
		.unwrap();

	let result = call.await.unwrap().unwrap();
	assert_eq!(result, json!({"data": []}));
	assert_eq!(client.pending_requests(), 0);
}

/// Concurrent callers get distinct ids and each receives its own answer.
#[tokio::test]
async fn test_concurrent_requests_get_distinct_increasing_ids() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();
	const CALLS: u64 = 16;

	let mut calls = Vec::new();
	for n in 0..CALLS {
		let client = client.clone();
		let cancel = cancel.clone();
		calls.push(tokio::spawn(async move {
			let result = client.send_request("echo", json!({"n": n}), &cancel).await;
			(n, result)
		}));
	}

	let mut ids = Vec::new();
	for _ in 0..CALLS {
		let request = peer.next_request().await.unwrap();
		ids.push(request.numeric_id().unwrap());
		peer
			.respond(request.id.as_ref().unwrap(), request.params.clone())
			.await
			.unwrap();
	}

	let unique: HashSet<_> = ids.iter().copied().collect();
	assert_eq!(unique.len(), CALLS as usize);
	let mut sorted = ids.clone();
	sorted.sort_unstable();
	assert_eq!(sorted, (1..=CALLS).collect::<Vec<_>>());

	for joined in futures::future::join_all(calls).await {
		let (n, result) = joined.unwrap();
		assert_eq!(result.unwrap(), json!({"n": n}));
	}

	// Later requests keep counting up.
	let next = {
		let client = client.clone();
		tokio::spawn(async move { client.send_request("echo", json!({}), &cancel).await })
	};
	let request = peer.next_request().await.unwrap();
	assert_eq!(request.numeric_id(), Some(CALLS + 1));
	peer
		.respond(request.id.as_ref().unwrap(), Value::Null)
		.await
		.unwrap();
	assert_eq!(next.await.unwrap().unwrap(), Value::Null);
}

#[tokio::test]
async fn test_cancelled_request_leaves_no_waiter() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("thread/start", json!({}), &cancel).await })
	};
	let request = peer.next_request().await.unwrap();
	assert_eq!(client.pending_requests(), 1);

	cancel.cancel();
	let result = call.await.unwrap();
	assert!(matches!(result, Err(ClientError::Cancelled)));
	assert_eq!(client.pending_requests(), 0);

	// A late answer is a stray response, not a crash.
	let mut events = client.subscribe_events();
	peer
		.respond(request.id.as_ref().unwrap(), json!({}))
		.await
		.unwrap();
	next_event_of(&mut events, CoreEventKind::StrayResponse).await;
}

#[tokio::test]
async fn test_remote_error_and_malformed_response_fail_one_waiter() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let first = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("a", json!({}), &cancel).await })
	};
	let request = peer.next_request().await.unwrap();
	peer
		.respond_error(request.id.as_ref().unwrap(), -32000, "thread not found")
		.await
		.unwrap();
	match first.await.unwrap() {
		Err(ClientError::Remote { code, message }) => {
			assert_eq!(code, -32000);
			assert_eq!(message, "thread not found");
		}
		other => panic!("unexpected {other:?}"),
	}

	let second = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("b", json!({}), &cancel).await })
	};
	let request = peer.next_request().await.unwrap();
	peer
		.send(&json!({"id": request.id.clone().unwrap()}))
		.await
		.unwrap();
	assert!(matches!(
		second.await.unwrap(),
		Err(ClientError::MalformedResponse { method }) if method == "b"
	));

	// The connection is still usable.
	let third = {
		let client = client.clone();
		tokio::spawn(async move { client.send_request("c", json!({}), &cancel).await })
	};
	let request = peer.next_request().await.unwrap();
	peer
		.send(&json!({"id": request.id.clone().unwrap(), "result": null}))
		.await
		.unwrap();
	assert_eq!(third.await.unwrap().unwrap(), Value::Null);
}

/// Closing the primary stream fails every waiter and every live turn.
#[tokio::test]
async fn test_transport_close_fails_pending_requests_and_turns() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let (tracker, waiter) = TurnTracker::new("t1", "th", Duration::from_millis(50), None);
	client.turns().prime(&tracker).unwrap();

	let call = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("turn/start", json!({}), &cancel).await })
	};
	peer.next_request().await.unwrap();
	peer.close();

	assert!(matches!(
		call.await.unwrap(),
		Err(ClientError::TransportClosed)
	));
	let result = waiter.await;
	assert_eq!(result.status, TurnStatus::Failed);
	assert_eq!(result.error.as_deref(), Some("transport closed"));

	assert!(client.is_closed());
	assert!(matches!(
		client.send_request("x", json!({}), &cancel).await,
		Err(ClientError::TransportClosed)
	));
}

/// Peer requests are answered with the id echoed verbatim.
#[tokio::test]
async fn test_peer_request_ids_are_echoed() {
	let (_client, mut peer) = connect();

	peer
		.request(json!("req-abc"), METHOD_REQUEST_USER_INPUT, json!({"questions": []}))
		.await
		.unwrap();
	let response = peer.next_response().await.unwrap();
	assert_eq!(response.id, Some(json!("req-abc")));
	assert_eq!(response.result, Some(json!({"answers": {}})));

	// A numeric id that collides with none of ours is still a peer request.
	peer
		.request(json!(99), "item/unknown/thing", json!({}))
		.await
		.unwrap();
	let response = peer.next_response().await.unwrap();
	assert_eq!(response.id, Some(json!(99)));
	assert_eq!(
		response.error.unwrap()["code"],
		json!(ERROR_METHOD_NOT_FOUND)
	);
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
	let (client, mut peer) = connect();
	let mut events = client.subscribe_events();
	let mut notifications = client.subscribe_notifications();

	peer.send_raw("this is not json").await.unwrap();
	peer.send_raw("{\"unrelated\": true}").await.unwrap();
	peer
		.notify("thread/started", json!({"thread": {"id": "th"}}))
		.await
		.unwrap();

	let event = next_event_of(&mut events, CoreEventKind::MalformedFrame).await;
	assert!(event.message.contains("this is not json"));
	let notification = notifications.recv().await.unwrap();
	assert_eq!(notification.method, "thread/started");
	assert!(!client.is_closed());
}

#[tokio::test]
async fn test_diagnostic_lines_become_events() {
	let (client, mut peer) = connect();
	let mut events = client.subscribe_events();

	peer.diagnostic("WARN codex_core: slow disk").await.unwrap();
	let event = next_event_of(&mut events, CoreEventKind::Stderr).await;
	assert_eq!(event.message, "WARN codex_core: slow disk");
	// Diagnostic text is never parsed as protocol.
	peer.diagnostic("{\"id\":1,\"result\":{}}").await.unwrap();
	let event = next_event_of(&mut events, CoreEventKind::Stderr).await;
	assert_eq!(event.message, "{\"id\":1,\"result\":{}}");
}

/// A primary line that is not valid UTF-8 costs that line only.
#[tokio::test]
async fn test_invalid_utf8_primary_line_is_skipped() {
	let (client, mut peer) = connect();
	let mut events = client.subscribe_events();
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		tokio::spawn(async move { client.list_models(&cancel).await })
	};
	let request = peer.next_request().await.unwrap();

	peer.send_bytes(b"\xff\xfe not a frame").await.unwrap();
	let event = next_event_of(&mut events, CoreEventKind::MalformedFrame).await;
	assert!(event.message.contains('\u{fffd}'));
	assert!(!client.is_closed());

	peer
		.respond(
			request.id.as_ref().unwrap(),
			json!({"data": [{"id": "gpt-5", "isDefault": true}]}),
		)
		.await
		.unwrap();
	let models = call.await.unwrap().unwrap();
	assert_eq!(models.len(), 1);
	assert_eq!(client.pending_requests(), 0);
}

/// Invalid UTF-8 on the diagnostic channel does not stop later diagnostics.
#[tokio::test]
async fn test_invalid_utf8_diagnostic_line_is_skipped() {
	let (client, mut peer) = connect();
	let mut events = client.subscribe_events();

	peer.diagnostic_bytes(b"progress \xc3\x28 bar").await.unwrap();
	let event = next_event_of(&mut events, CoreEventKind::Stderr).await;
	assert!(event.message.starts_with("progress "));

	peer.diagnostic("still reading").await.unwrap();
	let event = next_event_of(&mut events, CoreEventKind::Stderr).await;
	assert_eq!(event.message, "still reading");
	assert!(!client.is_closed());
}

/// A peer that stops reading cannot pin a request past its cancellation, and
/// the next frame still starts on a fresh line.
#[tokio::test]
async fn test_blocked_write_honours_cancellation() {
	let (client_out, peer_in) = tokio::io::duplex(64);
	let (_peer_out, client_in) = tokio::io::duplex(64);
	let client = AppServerClient::start(
		Transport::from_streams(client_out, client_in),
		ClientConfig::default(),
	);
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			client
				.send_request("first", json!({"blob": "x".repeat(4096)}), &cancel)
				.await
		})
	};
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!call.is_finished());

	cancel.cancel();
	let result = tokio::time::timeout(Duration::from_secs(1), call)
		.await
		.expect("cancelled request returns")
		.unwrap();
	assert!(matches!(result, Err(ClientError::Cancelled)));
	assert_eq!(client.pending_requests(), 0);

	let second = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.send_request("second", json!({}), &CancellationToken::new())
				.await
		})
	};
	let mut lines = tokio::io::BufReader::new(peer_in).lines();
	let fragment = lines.next_line().await.unwrap().unwrap();
	assert!(serde_json::from_str::<Value>(&fragment).is_err());
	let frame: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
	assert_eq!(frame["method"], "second");

	client.dispose().await;
	assert!(matches!(second.await.unwrap(), Err(ClientError::Disposed)));
}

/// Dispose completes while a request is stuck writing to a full pipe.
#[tokio::test]
async fn test_dispose_with_blocked_write_does_not_hang() {
	let (client_out, _peer_in) = tokio::io::duplex(64);
	let (_peer_out, client_in) = tokio::io::duplex(64);
	let client = AppServerClient::start(
		Transport::from_streams(client_out, client_in),
		ClientConfig::default(),
	);

	let call = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.send_request("stuck", json!({"blob": "x".repeat(4096)}), &CancellationToken::new())
				.await
		})
	};
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!call.is_finished());

	tokio::time::timeout(Duration::from_secs(1), client.dispose())
		.await
		.expect("dispose finishes");
	let result = tokio::time::timeout(Duration::from_secs(1), call)
		.await
		.expect("request returns")
		.unwrap();
	assert!(matches!(result, Err(ClientError::Disposed)));
	assert_eq!(client.pending_requests(), 0);
}

/// A delta that beats tracker registration is buffered and replayed.
#[tokio::test]
async fn test_early_delta_is_replayed_on_prime() {
	let (client, mut peer) = connect();
	let mut notifications = client.subscribe_notifications();

	peer
		.notify(
			NOTIFY_AGENT_MESSAGE_DELTA,
			json!({"threadId": "th", "turnId": "t1", "delta": "hello"}),
		)
		.await
		.unwrap();
	notifications.recv().await.unwrap();
	assert_eq!(client.turns().buffered_len("t1"), 1);

	let (tracker, waiter) = TurnTracker::new("t1", "th", Duration::from_millis(50), None);
	assert_eq!(client.turns().prime(&tracker).unwrap(), 1);
	assert_eq!(tracker.text(), "hello");

	peer
		.notify(
			NOTIFY_TURN_COMPLETED,
			json!({"threadId": "th", "turn": {"id": "t1", "status": "completed"}}),
		)
		.await
		.unwrap();
	let result = waiter.await;
	assert_eq!(result.status, TurnStatus::Completed);
	assert_eq!(result.text, "hello");
}

#[tokio::test]
async fn test_thread_scoped_error_fails_turn_when_not_retrying() {
	let (client, mut peer) = connect();
	let (tracker, waiter) = TurnTracker::new("t1", "th", Duration::from_millis(50), None);
	client.turns().prime(&tracker).unwrap();

	peer
		.notify(
			NOTIFY_ERROR,
			json!({"threadId": "th", "error": {"message": "quota exceeded"}, "willRetry": false}),
		)
		.await
		.unwrap();

	let result = waiter.await;
	assert_eq!(result.status, TurnStatus::Failed);
	assert_eq!(result.error.as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn test_legacy_event_frames_drive_turns() {
	let (client, mut peer) = connect();
	let (tracker, waiter) = TurnTracker::new("t1", "th", Duration::from_millis(50), None);
	client.turns().prime(&tracker).unwrap();

	peer
		.notify(
			"codex/event/agent_message_delta",
			json!({"id": "t1", "msg": {"type": "agent_message_delta", "delta": "legacy "}}),
		)
		.await
		.unwrap();
	peer
		.notify(
			"codex/event/agent_message_delta",
			json!({"id": "t1", "msg": {"type": "agent_message_delta", "delta": "text"}}),
		)
		.await
		.unwrap();
	peer
		.notify(
			"codex/event/task_complete",
			json!({"id": "t1", "msg": {"type": "task_complete"}}),
		)
		.await
		.unwrap();

	let result = waiter.await;
	assert_eq!(result.status, TurnStatus::Completed);
	assert_eq!(result.text, "legacy text");
}

/// Disposing with turns in flight resolves all of them instead of hanging.
#[tokio::test]
async fn test_dispose_resolves_pending_turns() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let (first, first_waiter) = TurnTracker::new("t1", "th-1", Duration::from_millis(50), None);
	let (second, second_waiter) = TurnTracker::new("t2", "th-2", Duration::from_millis(50), None);
	client.turns().prime(&first).unwrap();
	client.turns().prime(&second).unwrap();

	let call = {
		let client = client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move { client.send_request("turn/start", json!({}), &cancel).await })
	};
	peer.next_request().await.unwrap();

	client.dispose().await;
	client.dispose().await;

	for result in [first_waiter.await, second_waiter.await] {
		assert_eq!(result.status, TurnStatus::Interrupted);
		assert_eq!(result.error.as_deref(), Some("client disposed"));
	}
	assert!(matches!(call.await.unwrap(), Err(ClientError::Disposed)));
	assert!(client.is_disposed());
	assert!(matches!(
		client.send_request("x", json!({}), &cancel).await,
		Err(ClientError::Disposed)
	));
	// The peer sees the writer close.
	assert!(peer.next_frame().await.is_none());
}

#[tokio::test]
async fn test_initialize_sends_initialized_notification() {
	let (client, mut peer) = connect();
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		tokio::spawn(async move {
			let info = ClientInfo {
				name: "loom".to_string(),
				title: None,
				version: "0.1.0".to_string(),
			};
			client.initialize(&info, &cancel).await
		})
	};

	let request = peer.next_request().await.unwrap();
	assert_eq!(request.method.as_deref(), Some("initialize"));
	assert_eq!(request.params["clientInfo"]["name"], "loom");
	peer
		.respond(request.id.as_ref().unwrap(), json!({"userAgent": "codex/1.0"}))
		.await
		.unwrap();

	let frame = peer.next_frame().await.unwrap();
	assert_eq!(frame.method.as_deref(), Some(METHOD_INITIALIZED));
	assert!(frame.id.is_none());
	assert_eq!(call.await.unwrap().unwrap()["userAgent"], "codex/1.0");
}

#[tokio::test]
async fn test_request_timeout_is_reported() {
	let (transport, mut peer) = FakePeer::pair();
	let config = ClientConfig {
		request_timeout: Some(Duration::from_millis(20)),
		..ClientConfig::default()
	};
	let client = AppServerClient::start(transport, config);
	let cancel = CancellationToken::new();

	let call = {
		let client = client.clone();
		tokio::spawn(async move { client.send_request("slow", json!({}), &cancel).await })
	};
	peer.next_request().await.unwrap();
	assert!(matches!(
		call.await.unwrap(),
		Err(ClientError::Timeout { method }) if method == "slow"
	));
	settle().await;
	assert_eq!(client.pending_requests(), 0);
}
