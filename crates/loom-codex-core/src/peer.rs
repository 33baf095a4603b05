// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Requests initiated by the app server (approvals, user input, tool calls).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::protocol::{
	ERROR_METHOD_NOT_FOUND, METHOD_COMMAND_APPROVAL, METHOD_FILE_CHANGE_APPROVAL,
	METHOD_REQUEST_USER_INPUT, METHOD_TOOL_CALL,
};

/// A request the peer sent us. `id` is kept as raw JSON so the answer echoes
/// it exactly (string ids stay strings).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
	pub id: Value,
	pub method: String,
	pub params: Value,
}

impl PeerRequest {
	pub fn is_approval(&self) -> bool {
		matches!(
			self.method.as_str(),
			METHOD_COMMAND_APPROVAL | METHOD_FILE_CHANGE_APPROVAL
		)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerResponse {
	Result(Value),
	Error { code: i64, message: String },
}

/// Answers peer-initiated requests.
#[async_trait]
pub trait PeerRequestHandler: Send + Sync {
	async fn handle(&self, request: PeerRequest) -> PeerResponse;
}

/// Conservative answers used when nothing else is installed: approvals are
/// declined, user-input prompts get no answers, dynamic tool calls are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPeerHandler;

#[async_trait]
impl PeerRequestHandler for DefaultPeerHandler {
	async fn handle(&self, request: PeerRequest) -> PeerResponse {
		default_response(&request)
	}
}

pub fn default_response(request: &PeerRequest) -> PeerResponse {
	match request.method.as_str() {
		METHOD_COMMAND_APPROVAL | METHOD_FILE_CHANGE_APPROVAL => {
			PeerResponse::Result(json!({ "decision": "decline" }))
		}
		METHOD_REQUEST_USER_INPUT => PeerResponse::Result(json!({ "answers": {} })),
		METHOD_TOOL_CALL => {
			let tool = request
				.params
				.get("tool")
				.or_else(|| request.params.get("name"))
				.and_then(Value::as_str)
				.unwrap_or("unknown");
			PeerResponse::Result(declined_tool_call(&format!(
				"tool '{tool}' is not available in this client"
			)))
		}
		other => PeerResponse::Error {
			code: ERROR_METHOD_NOT_FOUND,
			message: format!("unsupported server request: {other}"),
		},
	}
}

/// Response body for a dynamic tool call we refuse to run.
pub fn declined_tool_call(message: &str) -> Value {
	json!({
		"success": false,
		"contentItems": [{ "type": "inputText", "text": message }],
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(method: &str, params: Value) -> PeerRequest {
		PeerRequest {
			id: json!(1),
			method: method.to_string(),
			params,
		}
	}

	#[tokio::test]
	async fn default_handler_declines_approvals() {
		let response = DefaultPeerHandler
			.handle(request(METHOD_COMMAND_APPROVAL, json!({"command": "rm -rf /"})))
			.await;
		assert_eq!(response, PeerResponse::Result(json!({"decision": "decline"})));
	}

	#[test]
	fn only_approval_methods_are_approvals() {
		assert!(request(METHOD_COMMAND_APPROVAL, json!({})).is_approval());
		assert!(request(METHOD_FILE_CHANGE_APPROVAL, json!({})).is_approval());
		assert!(!request(METHOD_REQUEST_USER_INPUT, json!({})).is_approval());
		assert!(!request(METHOD_TOOL_CALL, json!({})).is_approval());
	}

	#[test]
	fn user_input_gets_empty_answers() {
		assert_eq!(
			default_response(&request(METHOD_REQUEST_USER_INPUT, json!({}))),
			PeerResponse::Result(json!({"answers": {}}))
		);
	}

	#[test]
	fn tool_call_is_declined_with_tool_name() {
		let PeerResponse::Result(body) =
			default_response(&request(METHOD_TOOL_CALL, json!({"tool": "deploy"})))
		else {
			panic!("expected result");
		};
		assert_eq!(body["success"], false);
		assert!(body["contentItems"][0]["text"]
			.as_str()
			.unwrap()
			.contains("deploy"));
	}

	#[test]
	fn unknown_method_is_method_not_found() {
		match default_response(&request("item/unknown", Value::Null)) {
			PeerResponse::Error { code, .. } => assert_eq!(code, ERROR_METHOD_NOT_FOUND),
			other => panic!("unexpected {other:?}"),
		}
	}
}
