// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire frames and method vocabulary for the Codex app server.
//!
//! The app server speaks one JSON object per line. Outbound requests carry a
//! numeric `id`; the peer may also issue its own requests (approvals, tool
//! calls) whose ids we echo back verbatim. Notifications carry no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id assigned to outbound requests.
pub type RequestId = u64;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_THREAD_RESUME: &str = "thread/resume";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_STEER: &str = "turn/steer";
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";
pub const METHOD_MODEL_LIST: &str = "model/list";

pub const METHOD_COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
pub const METHOD_FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";
pub const METHOD_REQUEST_USER_INPUT: &str = "item/tool/requestUserInput";
pub const METHOD_TOOL_CALL: &str = "item/tool/call";

pub const NOTIFY_AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
pub const NOTIFY_TURN_STARTED: &str = "turn/started";
pub const NOTIFY_TURN_COMPLETED: &str = "turn/completed";
pub const NOTIFY_ERROR: &str = "error";
pub const LEGACY_EVENT_PREFIX: &str = "codex/event/";

/// JSON-RPC "method not found".
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
	pub id: RequestId,
	pub method: &'a str,
	pub params: Value,
}

/// Answer to a peer-initiated request. `id` is echoed exactly as received.
#[derive(Debug, Serialize)]
pub struct OutgoingResponse {
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct OutgoingNotification<'a> {
	pub method: &'a str,
	#[serde(skip_serializing_if = "Value::is_null")]
	pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
	#[serde(default)]
	pub code: i64,
	#[serde(default)]
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// Any inbound line, before it is classified against the pending map.
///
/// `Some(Value::Null)` means the key was present with a `null` value, which
/// matters for `result`: `{"id":1,"result":null}` is a valid response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFrame {
	#[serde(default, deserialize_with = "present")]
	pub id: Option<Value>,
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default, deserialize_with = "present")]
	pub params: Option<Value>,
	#[serde(default, deserialize_with = "present")]
	pub result: Option<Value>,
	#[serde(default, deserialize_with = "present")]
	pub error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	Value::deserialize(deserializer).map(Some)
}

impl RawFrame {
	pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(line)
	}

	/// Numeric correlation id, if the frame carries one.
	pub fn numeric_id(&self) -> Option<RequestId> {
		self.id.as_ref().and_then(|id| match id {
			Value::Number(n) => n.as_u64(),
			Value::String(s) => s.parse().ok(),
			_ => None,
		})
	}
}

/// A notification: method plus params, no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	pub method: String,
	pub params: Value,
}

impl Notification {
	pub fn new(method: impl Into<String>, params: Value) -> Self {
		Self {
			method: method.into(),
			params,
		}
	}

	/// For `codex/event/<kind>` frames, the event kind taken from
	/// `params.msg.type`, falling back to the method suffix.
	pub fn legacy_kind(&self) -> Option<&str> {
		let suffix = self.method.strip_prefix(LEGACY_EVENT_PREFIX)?;
		Some(
			self
				.params
				.pointer("/msg/type")
				.and_then(Value::as_str)
				.unwrap_or(suffix),
		)
	}

	pub fn turn_id(&self) -> Option<&str> {
		first_str(
			&self.params,
			&[
				"/turnId",
				"/turn/id",
				"/msg/turn_id",
				"/msg/turnId",
				"/turn_id",
			],
		)
		.or_else(|| {
			// Legacy event frames identify the turn by the submission id.
			if self.legacy_kind().is_some() {
				first_str(&self.params, &["/id"])
			} else {
				None
			}
		})
	}

	pub fn thread_id(&self) -> Option<&str> {
		first_str(
			&self.params,
			&[
				"/threadId",
				"/thread/id",
				"/conversationId",
				"/msg/thread_id",
				"/thread_id",
			],
		)
	}
}

fn first_str<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a str> {
	pointers
		.iter()
		.find_map(|p| value.pointer(p).and_then(Value::as_str))
		.filter(|s| !s.is_empty())
}

/// Extract a human-readable message from an error value that may be a bare
/// string, `{message}`, or `{error: {message}}`.
pub fn error_message(value: &Value) -> Option<String> {
	match value {
		Value::Null => None,
		Value::String(s) if s.is_empty() => None,
		Value::String(s) => Some(s.clone()),
		Value::Object(map) => map
			.get("message")
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.or_else(|| map.get("error").and_then(error_message)),
		other => Some(other.to_string()),
	}
}

/// Terminal status reported by the peer for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
	Pending,
	Streaming,
	Completed,
	Failed,
	Interrupted,
	TimedOut,
}

impl TurnStatus {
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			TurnStatus::Completed | TurnStatus::Failed | TurnStatus::Interrupted | TurnStatus::TimedOut
		)
	}

	/// Map a peer status string onto a status. Unknown strings are treated as
	/// failures so a turn never resolves as successful by accident.
	pub fn from_wire(status: &str) -> Self {
		match status {
			"completed" | "complete" | "success" | "succeeded" => TurnStatus::Completed,
			"interrupted" | "aborted" | "cancelled" | "canceled" => TurnStatus::Interrupted,
			"inProgress" | "in_progress" | "running" => TurnStatus::Streaming,
			_ => TurnStatus::Failed,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			TurnStatus::Pending => "pending",
			TurnStatus::Streaming => "streaming",
			TurnStatus::Completed => "completed",
			TurnStatus::Failed => "failed",
			TurnStatus::Interrupted => "interrupted",
			TurnStatus::TimedOut => "timedOut",
		}
	}
}

impl std::fmt::Display for TurnStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A turn-scoped signal extracted from a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnSignal {
	/// Streamed agent message content.
	Delta(String),
	/// The peer reports the turn finished.
	Completed {
		status: TurnStatus,
		error: Option<String>,
	},
	/// Protocol-level error. `will_retry == Some(false)` means the peer gave up.
	Error {
		message: String,
		will_retry: Option<bool>,
	},
}

impl TurnSignal {
	/// Classify a notification. Returns `None` for notifications that carry no
	/// turn lifecycle meaning.
	pub fn from_notification(notification: &Notification) -> Option<Self> {
		let params = &notification.params;
		if let Some(kind) = notification.legacy_kind() {
			return match kind {
				"agent_message_delta" => first_str(params, &["/msg/delta", "/delta"])
					.map(|d| TurnSignal::Delta(d.to_string())),
				"task_complete" | "turn_complete" => Some(TurnSignal::Completed {
					status: TurnStatus::Completed,
					error: None,
				}),
				"turn_aborted" => Some(TurnSignal::Completed {
					status: TurnStatus::Interrupted,
					error: params.pointer("/msg/reason").and_then(error_message),
				}),
				"error" | "stream_error" => Some(TurnSignal::Error {
					message: params
						.pointer("/msg/message")
						.and_then(error_message)
						.unwrap_or_else(|| "unknown error".to_string()),
					will_retry: Some(kind == "stream_error"),
				}),
				_ => None,
			};
		}

		match notification.method.as_str() {
			NOTIFY_AGENT_MESSAGE_DELTA => params
				.get("delta")
				.and_then(Value::as_str)
				.map(|d| TurnSignal::Delta(d.to_string())),
			NOTIFY_TURN_COMPLETED => {
				let status = first_str(params, &["/turn/status", "/status", "/msg/status"])
					.map(TurnStatus::from_wire)
					.unwrap_or(TurnStatus::Completed);
				let error = ["/turn/error", "/error", "/msg/error"]
					.iter()
					.find_map(|p| params.pointer(p).and_then(error_message));
				Some(TurnSignal::Completed { status, error })
			}
			NOTIFY_ERROR => {
				let message = params
					.get("error")
					.and_then(error_message)
					.or_else(|| params.get("message").and_then(error_message))
					.unwrap_or_else(|| "unknown error".to_string());
				let will_retry = params
					.get("willRetry")
					.or_else(|| params.get("will_retry"))
					.and_then(Value::as_bool);
				Some(TurnSignal::Error {
					message,
					will_retry,
				})
			}
			_ => None,
		}
	}
}

/// Input item sent with `turn/start` and `turn/steer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UserInput {
	Text { text: String },
	Image { url: String },
	LocalImage { path: String },
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn parses_response_request_and_notification_shapes() {
		let response = RawFrame::parse(r#"{"id":7,"result":{"ok":true}}"#).unwrap();
		assert_eq!(response.numeric_id(), Some(7));
		assert!(response.method.is_none());

		let request =
			RawFrame::parse(r#"{"id":"abc","method":"item/tool/call","params":{}}"#).unwrap();
		assert_eq!(request.id, Some(json!("abc")));
		assert_eq!(request.numeric_id(), None);

		let notification = RawFrame::parse(r#"{"method":"turn/started","params":{}}"#).unwrap();
		assert!(notification.id.is_none());
	}

	#[test]
	fn null_result_is_present() {
		let frame = RawFrame::parse(r#"{"id":2,"result":null}"#).unwrap();
		assert_eq!(frame.result, Some(Value::Null));
		assert!(frame.error.is_none());
	}

	#[test]
	fn outgoing_response_preserves_string_id() {
		let response = OutgoingResponse {
			id: json!("req-1"),
			result: Some(json!({"decision": "accept"})),
			error: None,
		};
		let text = serde_json::to_string(&response).unwrap();
		assert_eq!(text, r#"{"id":"req-1","result":{"decision":"accept"}}"#);
	}

	#[test]
	fn turn_id_from_nested_and_flat_params() {
		let flat = Notification::new(NOTIFY_AGENT_MESSAGE_DELTA, json!({"turnId": "t1"}));
		assert_eq!(flat.turn_id(), Some("t1"));

		let nested = Notification::new(NOTIFY_TURN_COMPLETED, json!({"turn": {"id": "t2"}}));
		assert_eq!(nested.turn_id(), Some("t2"));

		let legacy = Notification::new(
			"codex/event/task_complete",
			json!({"id": "t3", "msg": {"type": "task_complete"}}),
		);
		assert_eq!(legacy.turn_id(), Some("t3"));
	}

	#[test]
	fn completion_status_and_error_in_differing_nesting() {
		let nested = Notification::new(
			NOTIFY_TURN_COMPLETED,
			json!({"turn": {"id": "t", "status": "failed", "error": {"message": "boom"}}}),
		);
		assert_eq!(
			TurnSignal::from_notification(&nested),
			Some(TurnSignal::Completed {
				status: TurnStatus::Failed,
				error: Some("boom".to_string()),
			})
		);

		let flat = Notification::new(
			NOTIFY_TURN_COMPLETED,
			json!({"turnId": "t", "status": "interrupted", "error": "stopped"}),
		);
		assert_eq!(
			TurnSignal::from_notification(&flat),
			Some(TurnSignal::Completed {
				status: TurnStatus::Interrupted,
				error: Some("stopped".to_string()),
			})
		);

		let bare = Notification::new(NOTIFY_TURN_COMPLETED, json!({"turnId": "t"}));
		assert_eq!(
			TurnSignal::from_notification(&bare),
			Some(TurnSignal::Completed {
				status: TurnStatus::Completed,
				error: None,
			})
		);
	}

	#[test]
	fn error_notification_carries_retry_flag() {
		let n = Notification::new(
			NOTIFY_ERROR,
			json!({"turnId": "t", "error": {"message": "rate limited"}, "willRetry": false}),
		);
		assert_eq!(
			TurnSignal::from_notification(&n),
			Some(TurnSignal::Error {
				message: "rate limited".to_string(),
				will_retry: Some(false),
			})
		);
	}

	#[test]
	fn legacy_delta_maps_to_delta_signal() {
		let n = Notification::new(
			"codex/event/agent_message_delta",
			json!({"id": "t", "msg": {"type": "agent_message_delta", "delta": "hi"}}),
		);
		assert_eq!(
			TurnSignal::from_notification(&n),
			Some(TurnSignal::Delta("hi".to_string()))
		);
	}

	#[test]
	fn unknown_wire_status_is_not_success() {
		assert_eq!(TurnStatus::from_wire("weird"), TurnStatus::Failed);
		assert_eq!(TurnStatus::from_wire("completed"), TurnStatus::Completed);
		assert!(!TurnStatus::Streaming.is_terminal());
	}

	#[test]
	fn user_input_serializes_with_type_tag() {
		let text = serde_json::to_value(UserInput::Text {
			text: "hello".to_string(),
		})
		.unwrap();
		assert_eq!(text, json!({"type": "text", "text": "hello"}));
		let image = serde_json::to_value(UserInput::LocalImage {
			path: "/tmp/a.png".to_string(),
		})
		.unwrap();
		assert_eq!(image, json!({"type": "localImage", "path": "/tmp/a.png"}));
	}
}
