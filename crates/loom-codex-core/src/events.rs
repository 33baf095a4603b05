// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Diagnostic events published by a client.
//!
//! Events are fire-and-forget: they are mirrored to `tracing` and pushed onto a
//! broadcast channel. Nothing in the core depends on them being observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreEventLevel {
	Trace,
	Debug,
	Info,
	Warn,
	Error,
}

/// Event kinds. Raw frames are carried verbatim in `message` for
/// `Notification` and `Stderr` so observers can inspect traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreEventKind {
	Notification,
	Stderr,
	MalformedFrame,
	PeerRequest,
	StrayResponse,
	BufferEvicted,
	TransportClosed,
	Disposed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreEvent {
	pub timestamp: DateTime<Utc>,
	pub level: CoreEventLevel,
	#[serde(rename = "type")]
	pub kind: CoreEventKind,
	pub message: String,
}

impl CoreEvent {
	pub fn new(level: CoreEventLevel, kind: CoreEventKind, message: impl Into<String>) -> Self {
		Self {
			timestamp: Utc::now(),
			level,
			kind,
			message: message.into(),
		}
	}
}

/// Publishing half of the diagnostic stream.
#[derive(Debug, Clone)]
pub struct EventPublisher {
	tx: broadcast::Sender<CoreEvent>,
}

impl EventPublisher {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
		self.tx.subscribe()
	}

	pub fn publish(&self, level: CoreEventLevel, kind: CoreEventKind, message: impl Into<String>) {
		let event = CoreEvent::new(level, kind, message);
		match level {
			CoreEventLevel::Trace => trace!(kind = ?event.kind, message = %event.message, "core event"),
			CoreEventLevel::Debug => debug!(kind = ?event.kind, message = %event.message, "core event"),
			CoreEventLevel::Info => info!(kind = ?event.kind, message = %event.message, "core event"),
			CoreEventLevel::Warn => warn!(kind = ?event.kind, message = %event.message, "core event"),
			CoreEventLevel::Error => error!(kind = ?event.kind, message = %event.message, "core event"),
		}
		// No subscribers is fine.
		let _ = self.tx.send(event);
	}
}
