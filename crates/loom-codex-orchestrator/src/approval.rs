// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Approval requests bridged from the app server to external deciders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_codex_core::peer::default_response;
use loom_codex_core::protocol::{METHOD_COMMAND_APPROVAL, METHOD_FILE_CHANGE_APPROVAL};
use loom_codex_core::{PeerRequest, PeerRequestHandler, PeerResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broadcast::{BroadcastSink, EVENT_APPROVAL_REQUESTED, EVENT_APPROVAL_RESOLVED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
	Accept,
	AcceptForSession,
	Decline,
	Cancel,
}

impl ApprovalDecision {
	pub const ALL: [ApprovalDecision; 4] = [
		ApprovalDecision::Accept,
		ApprovalDecision::AcceptForSession,
		ApprovalDecision::Decline,
		ApprovalDecision::Cancel,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			ApprovalDecision::Accept => "accept",
			ApprovalDecision::AcceptForSession => "acceptForSession",
			ApprovalDecision::Decline => "decline",
			ApprovalDecision::Cancel => "cancel",
		}
	}
}

impl std::str::FromStr for ApprovalDecision {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"accept" | "approve" | "approved" => Ok(ApprovalDecision::Accept),
			"acceptForSession" | "accept-for-session" | "always" => {
				Ok(ApprovalDecision::AcceptForSession)
			}
			"decline" | "deny" | "denied" => Ok(ApprovalDecision::Decline),
			"cancel" | "abort" => Ok(ApprovalDecision::Cancel),
			other => Err(format!("unknown approval decision: {other}")),
		}
	}
}

impl std::fmt::Display for ApprovalDecision {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
	CommandExecution,
	FileChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
	pub approval_id: String,
	pub session_id: String,
	pub request_type: ApprovalKind,
	pub summary: String,
	pub reason: Option<String>,
	pub cwd: Option<String>,
	pub actions: Vec<ApprovalDecision>,
	pub thread_id: Option<String>,
	pub turn_id: Option<String>,
	pub created_at: DateTime<Utc>,
}

impl PendingApproval {
	/// Describe an approval-shaped peer request. Returns `None` for any other
	/// method.
	pub fn from_request(session_id: &str, request: &PeerRequest) -> Option<Self> {
		if !request.is_approval() {
			return None;
		}
		let params = &request.params;
		let text = |key: &str| {
			params
				.get(key)
				.and_then(Value::as_str)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
		};

		let (request_type, summary) = match request.method.as_str() {
			METHOD_COMMAND_APPROVAL => {
				let command = match params.get("command") {
					Some(Value::String(s)) => s.clone(),
					Some(Value::Array(parts)) => parts
						.iter()
						.filter_map(Value::as_str)
						.collect::<Vec<_>>()
						.join(" "),
					_ => "command".to_string(),
				};
				(ApprovalKind::CommandExecution, format!("Run `{command}`"))
			}
			METHOD_FILE_CHANGE_APPROVAL => {
				let summary = match params.get("changes").and_then(Value::as_object) {
					Some(changes) if !changes.is_empty() => {
						let mut paths: Vec<_> = changes.keys().cloned().collect();
						paths.sort();
						format!("Apply changes to {}", paths.join(", "))
					}
					_ => "Apply file changes".to_string(),
				};
				(ApprovalKind::FileChange, summary)
			}
			_ => return None,
		};

		Some(Self {
			approval_id: Uuid::new_v4().to_string(),
			session_id: session_id.to_string(),
			request_type,
			summary,
			reason: text("reason"),
			cwd: text("cwd").or_else(|| text("grantRoot")),
			actions: ApprovalDecision::ALL.to_vec(),
			thread_id: text("threadId"),
			turn_id: text("turnId"),
			created_at: Utc::now(),
		})
	}
}

struct Waiting {
	approval: PendingApproval,
	tx: oneshot::Sender<ApprovalDecision>,
}

/// Outstanding approvals for one session.
#[derive(Default)]
pub struct ApprovalRegistry {
	pending: Mutex<HashMap<String, Waiting>>,
}

impl std::fmt::Debug for ApprovalRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ApprovalRegistry")
			.field("pending", &self.len())
			.finish()
	}
}

impl ApprovalRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiting>> {
		self.pending.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn register(&self, approval: PendingApproval) -> oneshot::Receiver<ApprovalDecision> {
		let (tx, rx) = oneshot::channel();
		self
			.lock()
			.insert(approval.approval_id.clone(), Waiting { approval, tx });
		rx
	}

	/// Supply a decision. Returns `false` if the approval is unknown or
	/// already decided.
	pub fn try_resolve(&self, approval_id: &str, decision: ApprovalDecision) -> bool {
		let Some(waiting) = self.lock().remove(approval_id) else {
			return false;
		};
		waiting.tx.send(decision).is_ok()
	}

	pub fn remove(&self, approval_id: &str) -> Option<PendingApproval> {
		self.lock().remove(approval_id).map(|w| w.approval)
	}

	/// Pending approvals, oldest first.
	pub fn list(&self) -> Vec<PendingApproval> {
		let mut approvals: Vec<_> = self.lock().values().map(|w| w.approval.clone()).collect();
		approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		approvals
	}

	/// Answer every pending approval with `cancel`.
	pub fn cancel_all(&self) -> usize {
		let drained: Vec<_> = self.lock().drain().collect();
		let count = drained.len();
		for (_, waiting) in drained {
			let _ = waiting.tx.send(ApprovalDecision::Cancel);
		}
		count
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Peer-request handler for an orchestrated session: approvals wait for an
/// external decision, everything else gets the default answer.
pub struct ApprovalBridge {
	session_id: String,
	approvals: Arc<ApprovalRegistry>,
	sink: Arc<dyn BroadcastSink>,
	lifetime: CancellationToken,
}

impl ApprovalBridge {
	pub fn new(
		session_id: impl Into<String>,
		approvals: Arc<ApprovalRegistry>,
		sink: Arc<dyn BroadcastSink>,
		lifetime: CancellationToken,
	) -> Self {
		Self {
			session_id: session_id.into(),
			approvals,
			sink,
			lifetime,
		}
	}
}

#[async_trait]
impl PeerRequestHandler for ApprovalBridge {
	async fn handle(&self, request: PeerRequest) -> PeerResponse {
		let Some(approval) = PendingApproval::from_request(&self.session_id, &request) else {
			return default_response(&request);
		};

		let approval_id = approval.approval_id.clone();
		info!(
			session_id = %self.session_id,
			approval_id = %approval_id,
			summary = %approval.summary,
			"approval requested"
		);
		let payload = json!({ "sessionId": self.session_id, "approval": approval });
		let rx = self.approvals.register(approval);
		self.sink.publish(EVENT_APPROVAL_REQUESTED, payload);

		let decision = tokio::select! {
			decision = rx => decision.unwrap_or(ApprovalDecision::Cancel),
			_ = self.lifetime.cancelled() => {
				self.approvals.remove(&approval_id);
				debug!(approval_id = %approval_id, "session ended while awaiting approval");
				ApprovalDecision::Cancel
			}
		};

		self.sink.publish(
			EVENT_APPROVAL_RESOLVED,
			json!({
				"sessionId": self.session_id,
				"approvalId": approval_id,
				"decision": decision,
			}),
		);
		PeerResponse::Result(json!({ "decision": decision }))
	}
}
