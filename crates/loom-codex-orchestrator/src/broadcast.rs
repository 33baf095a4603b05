// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Outbound events for external observers (a real-time gateway, a CLI).

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

pub const EVENT_SESSION_CREATED: &str = "session_created";
pub const EVENT_SESSION_STOPPED: &str = "session_stopped";
pub const EVENT_TURN_STARTED: &str = "turn_started";
pub const EVENT_TURN_PROGRESS: &str = "turn_progress";
pub const EVENT_TURN_COMPLETED: &str = "turn_completed";
pub const EVENT_APPROVAL_REQUESTED: &str = "approval_requested";
pub const EVENT_APPROVAL_RESOLVED: &str = "approval_resolved";
pub const EVENT_CORE: &str = "core_event";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEvent {
	pub name: String,
	pub payload: Value,
}

/// Receives `(event name, payload)` pairs. Implementations must not block.
pub trait BroadcastSink: Send + Sync {
	fn publish(&self, event: &str, payload: Value);
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
	tx: mpsc::UnboundedSender<BroadcastEvent>,
}

impl ChannelSink {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<BroadcastEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}
}

impl BroadcastSink for ChannelSink {
	fn publish(&self, event: &str, payload: Value) {
		trace!(event, "broadcast");
		// A dropped receiver means nobody is watching.
		let _ = self.tx.send(BroadcastEvent {
			name: event.to_string(),
			payload,
		});
	}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl BroadcastSink for NullSink {
	fn publish(&self, _event: &str, _payload: Value) {}
}
