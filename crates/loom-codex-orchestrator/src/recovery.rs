// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turn boundaries inferred from raw protocol traffic.
//!
//! Pattern matching on frames the normal call path may have missed. This is
//! best effort and tracks the upstream wire format; it only ever nudges the
//! turn gate's in-flight mark.

use loom_codex_core::protocol::{NOTIFY_TURN_COMPLETED, NOTIFY_TURN_STARTED};
use loom_codex_core::Notification;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredSignal {
	TurnStarted {
		thread_id: Option<String>,
		turn_id: String,
	},
	TurnFinished {
		thread_id: Option<String>,
		turn_id: String,
	},
}

impl RecoveredSignal {
	pub fn turn_id(&self) -> &str {
		match self {
			RecoveredSignal::TurnStarted { turn_id, .. } => turn_id,
			RecoveredSignal::TurnFinished { turn_id, .. } => turn_id,
		}
	}

	pub fn thread_id(&self) -> Option<&str> {
		match self {
			RecoveredSignal::TurnStarted { thread_id, .. } => thread_id.as_deref(),
			RecoveredSignal::TurnFinished { thread_id, .. } => thread_id.as_deref(),
		}
	}
}

/// Look for a turn start or finish in one raw line. Lines that are not JSON
/// objects, or that carry no turn id, yield nothing.
pub fn inspect(line: &str) -> Option<RecoveredSignal> {
	let trimmed = line.trim();
	if !trimmed.starts_with('{') {
		return None;
	}
	let frame: Value = serde_json::from_str(trimmed).ok()?;
	let method = frame.get("method")?.as_str()?;
	let notification = Notification::new(method, frame.get("params").cloned().unwrap_or_default());

	let started = match notification.legacy_kind() {
		Some("task_started" | "turn_started") => true,
		Some("task_complete" | "turn_complete" | "turn_aborted") => false,
		Some(_) => return None,
		None => match method {
			NOTIFY_TURN_STARTED => true,
			NOTIFY_TURN_COMPLETED => false,
			_ => return None,
		},
	};

	let turn_id = notification.turn_id()?.to_string();
	let thread_id = notification.thread_id().map(str::to_string);
	Some(if started {
		RecoveredSignal::TurnStarted { thread_id, turn_id }
	} else {
		RecoveredSignal::TurnFinished { thread_id, turn_id }
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primary_turn_frames() {
		assert_eq!(
			inspect(r#"{"method":"turn/started","params":{"threadId":"th","turn":{"id":"t1"}}}"#),
			Some(RecoveredSignal::TurnStarted {
				thread_id: Some("th".to_string()),
				turn_id: "t1".to_string(),
			})
		);
		assert_eq!(
			inspect(r#"{"method":"turn/completed","params":{"turn":{"id":"t1","status":"completed"}}}"#),
			Some(RecoveredSignal::TurnFinished {
				thread_id: None,
				turn_id: "t1".to_string(),
			})
		);
	}

	#[test]
	fn legacy_event_frames() {
		let started = inspect(
			r#"{"method":"codex/event/task_started","params":{"id":"t2","conversationId":"th","msg":{"type":"task_started"}}}"#,
		)
		.unwrap();
		assert_eq!(started.turn_id(), "t2");
		assert_eq!(started.thread_id(), Some("th"));

		let aborted = inspect(
			r#"{"method":"codex/event/turn_aborted","params":{"id":"t2","msg":{"type":"turn_aborted","reason":"interrupted"}}}"#,
		);
		assert!(matches!(aborted, Some(RecoveredSignal::TurnFinished { .. })));
	}

	#[test]
	fn ignores_unrelated_traffic() {
		assert_eq!(inspect("plain stderr text"), None);
		assert_eq!(inspect(r#"{"method":"item/agentMessage/delta","params":{"turnId":"t"}}"#), None);
		assert_eq!(inspect(r#"{"method":"turn/started","params":{}}"#), None);
		assert_eq!(inspect(r#"{"id":3,"result":{}}"#), None);
		assert_eq!(
			inspect(r#"{"method":"codex/event/agent_message_delta","params":{"id":"t","msg":{"type":"agent_message_delta"}}}"#),
			None
		);
	}
}
