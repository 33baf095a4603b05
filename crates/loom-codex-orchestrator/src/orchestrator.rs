// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Hosts many concurrent sessions, each single-flight behind its own gate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_codex_core::session::build_input;
use loom_codex_core::{
	AppServerClient, ClientInfo, CodexSession, CoreEvent, CoreEventKind, ModelInfo, SessionError,
	ThreadOptions, TurnOptions, TurnProgress, TurnResult, TurnStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::approval::{ApprovalBridge, ApprovalDecision, ApprovalRegistry, PendingApproval};
use crate::broadcast::{
	BroadcastSink, EVENT_CORE, EVENT_SESSION_CREATED, EVENT_SESSION_STOPPED, EVENT_TURN_COMPLETED,
	EVENT_TURN_PROGRESS, EVENT_TURN_STARTED,
};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::gate::{AcquireError, GateSnapshot, GateTicket, TurnGate};
use crate::launcher::ClientLauncher;
use crate::recovery::{self, RecoveredSignal};

/// Terminal status of a queued turn as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionStatus {
	Completed,
	Failed,
	Interrupted,
	TimedOut,
	/// The gate never freed up; no turn was started.
	QueueTimedOut,
	SessionEnded,
	/// The turn task ended without reporting anything.
	Abandoned,
}

impl CompletionStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			CompletionStatus::Completed => "completed",
			CompletionStatus::Failed => "failed",
			CompletionStatus::Interrupted => "interrupted",
			CompletionStatus::TimedOut => "timedOut",
			CompletionStatus::QueueTimedOut => "queueTimedOut",
			CompletionStatus::SessionEnded => "sessionEnded",
			CompletionStatus::Abandoned => "abandoned",
		}
	}
}

impl std::fmt::Display for CompletionStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompletion {
	pub session_id: String,
	pub turn_id: Option<String>,
	pub status: CompletionStatus,
	pub text: String,
	pub error: Option<String>,
}

impl TurnCompletion {
	fn new(session_id: &str, turn_id: Option<String>, status: CompletionStatus) -> Self {
		Self {
			session_id: session_id.to_string(),
			turn_id,
			status,
			text: String::new(),
			error: None,
		}
	}

	fn with_error(mut self, error: impl Into<String>) -> Self {
		self.error = Some(error.into());
		self
	}
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
	pub thread: ThreadOptions,
	pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueTurnRequest {
	pub text: String,
	pub images: Vec<String>,
	pub model: Option<String>,
	pub effort: Option<String>,
	pub timeout: Option<Duration>,
}

impl QueueTurnRequest {
	pub fn text(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub session_id: String,
	pub thread_id: String,
	pub model: Option<String>,
	pub reasoning_effort: Option<String>,
	pub cwd: Option<PathBuf>,
	pub created_at: DateTime<Utc>,
	pub turn_in_flight: bool,
	pub turn_gate_held: bool,
	pub current_turn_id: Option<String>,
	pub pending_approvals: usize,
}

struct ManagedSession {
	session_id: String,
	session: CodexSession,
	reasoning_effort: Option<String>,
	gate: Arc<TurnGate>,
	approvals: Arc<ApprovalRegistry>,
	active_turn: Mutex<Option<CancellationToken>>,
	lifetime: CancellationToken,
	created_at: DateTime<Utc>,
}

impl ManagedSession {
	fn info(&self) -> SessionInfo {
		let gate = self.gate.snapshot();
		SessionInfo {
			session_id: self.session_id.clone(),
			thread_id: self.session.thread_id().to_string(),
			model: self.session.model().map(str::to_string),
			reasoning_effort: self.reasoning_effort.clone(),
			cwd: self.session.cwd().cloned(),
			created_at: self.created_at,
			turn_in_flight: gate.in_flight,
			turn_gate_held: gate.held,
			current_turn_id: self.session.current_turn_id(),
			pending_approvals: self.approvals.len(),
		}
	}

	fn active_turn(&self) -> MutexGuard<'_, Option<CancellationToken>> {
		self.active_turn.lock().unwrap_or_else(|e| e.into_inner())
	}
}

/// Publishes `turn_completed` exactly once. If the owner never reports an
/// outcome the drop publishes `abandoned`.
struct CompletionGuard {
	sink: Arc<dyn BroadcastSink>,
	session_id: String,
	turn_id: Option<String>,
	published: bool,
}

impl CompletionGuard {
	fn publish(&mut self, completion: &TurnCompletion) {
		if self.published {
			return;
		}
		self.published = true;
		self
			.sink
			.publish(EVENT_TURN_COMPLETED, json!(completion));
	}
}

impl Drop for CompletionGuard {
	fn drop(&mut self) {
		if !self.published {
			let completion = TurnCompletion::new(
				&self.session_id,
				self.turn_id.clone(),
				CompletionStatus::Abandoned,
			);
			warn!(session_id = %self.session_id, "turn ended without an outcome");
			self.publish(&completion);
		}
	}
}

pub struct Orchestrator {
	config: OrchestratorConfig,
	launcher: Arc<dyn ClientLauncher>,
	sink: Arc<dyn BroadcastSink>,
	sessions: Mutex<HashMap<String, Arc<ManagedSession>>>,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Orchestrator")
			.field("sessions", &self.sessions().len())
			.field("shutting_down", &self.shutdown.is_cancelled())
			.finish()
	}
}

impl Orchestrator {
	pub fn new(
		config: OrchestratorConfig,
		launcher: Arc<dyn ClientLauncher>,
		sink: Arc<dyn BroadcastSink>,
	) -> Self {
		Self {
			config,
			launcher,
			sink,
			sessions: Mutex::new(HashMap::new()),
			shutdown: CancellationToken::new(),
		}
	}

	pub fn config(&self) -> &OrchestratorConfig {
		&self.config
	}

	fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ManagedSession>>> {
		self.sessions.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn managed(&self, session_id: &str) -> Result<Arc<ManagedSession>> {
		self
			.sessions()
			.get(session_id)
			.cloned()
			.ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))
	}

	/// Launch a client and start a new thread on it.
	#[instrument(skip(self, request))]
	pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionInfo> {
		self.open_session(None, request).await
	}

	/// Launch a client and resume an existing thread on it.
	#[instrument(skip(self, request))]
	pub async fn attach_session(
		&self,
		thread_id: &str,
		request: CreateSessionRequest,
	) -> Result<SessionInfo> {
		self.open_session(Some(thread_id), request).await
	}

	async fn open_session(
		&self,
		thread_id: Option<&str>,
		request: CreateSessionRequest,
	) -> Result<SessionInfo> {
		if self.shutdown.is_cancelled() {
			return Err(OrchestratorError::ShuttingDown);
		}

		let session_id = Uuid::new_v4().to_string();
		let lifetime = self.shutdown.child_token();
		let approvals = Arc::new(ApprovalRegistry::new());
		let gate = Arc::new(TurnGate::new());

		let transport = self.launcher.launch().await?;
		let bridge = ApprovalBridge::new(
			session_id.clone(),
			Arc::clone(&approvals),
			Arc::clone(&self.sink),
			lifetime.clone(),
		);
		let client =
			AppServerClient::start_with_handler(transport, self.config.client.clone(), Arc::new(bridge));

		tokio::spawn(pump_events(
			session_id.clone(),
			client.subscribe_events(),
			Arc::clone(&gate),
			Arc::clone(&self.sink),
			lifetime.clone(),
		));

		let opened = async {
			let info = ClientInfo {
				name: self.config.client_name.clone(),
				title: None,
				version: self.config.client_version.clone(),
			};
			client.initialize(&info, &lifetime).await?;
			let session = match thread_id {
				Some(thread_id) => {
					CodexSession::resume(client.clone(), thread_id, request.thread.clone(), &lifetime)
						.await?
				}
				None => CodexSession::start(client.clone(), request.thread.clone(), &lifetime).await?,
			};
			Ok::<_, OrchestratorError>(session)
		}
		.await;

		let session = match opened {
			Ok(session) => session,
			Err(e) => {
				warn!(session_id = %session_id, error = %e, "failed to open session");
				lifetime.cancel();
				client.dispose().await;
				return Err(e);
			}
		};

		let managed = Arc::new(ManagedSession {
			session_id: session_id.clone(),
			session,
			reasoning_effort: request.reasoning_effort,
			gate,
			approvals,
			active_turn: Mutex::new(None),
			lifetime,
			created_at: Utc::now(),
		});
		let info = managed.info();
		self.sessions().insert(session_id.clone(), managed);

		info!(session_id = %session_id, thread_id = %info.thread_id, "session created");
		self
			.sink
			.publish(EVENT_SESSION_CREATED, json!({ "session": info }));
		Ok(info)
	}

	pub fn list_sessions(&self) -> Vec<SessionInfo> {
		let mut sessions: Vec<_> = self.sessions().values().map(|s| s.info()).collect();
		sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		sessions
	}

	pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
		Ok(self.managed(session_id)?.info())
	}

	pub fn gate_snapshot(&self, session_id: &str) -> Result<GateSnapshot> {
		Ok(self.managed(session_id)?.gate.snapshot())
	}

	/// Queue a turn and wait for its terminal outcome.
	///
	/// Every turn that gets past input validation reports exactly one
	/// `turn_completed` event and releases the session's gate exactly once,
	/// including the queue timeout and session-ended paths.
	#[instrument(skip(self, request, progress))]
	pub async fn queue_turn(
		&self,
		session_id: &str,
		request: QueueTurnRequest,
		progress: Option<mpsc::UnboundedSender<TurnProgress>>,
	) -> Result<TurnCompletion> {
		let managed = self.managed(session_id)?;
		if build_input(&request.text, &request.images).is_empty() {
			return Err(SessionError::EmptyInput.into());
		}

		let mut guard = CompletionGuard {
			sink: Arc::clone(&self.sink),
			session_id: session_id.to_string(),
			turn_id: None,
			published: false,
		};

		let ticket = match managed
			.gate
			.acquire(
				self.config.queue_timeout,
				self.config.queue_poll_interval,
				&managed.lifetime,
			)
			.await
		{
			Ok(ticket) => ticket,
			Err(AcquireError::TimedOut) => {
				let completion = TurnCompletion::new(session_id, None, CompletionStatus::QueueTimedOut)
					.with_error(format!(
						"turn gate busy for {}ms",
						self.config.queue_timeout.as_millis()
					));
				warn!("queued turn timed out waiting for the gate");
				guard.publish(&completion);
				return Ok(completion);
			}
			Err(AcquireError::Cancelled) => {
				let completion = TurnCompletion::new(session_id, None, CompletionStatus::SessionEnded)
					.with_error("session stopped while queued");
				guard.publish(&completion);
				return Ok(completion);
			}
		};

		let turn_cancel = managed.lifetime.child_token();
		*managed.active_turn() = Some(turn_cancel.clone());

		let completion = self
			.run_turn(&managed, &ticket, &mut guard, request, progress, &turn_cancel)
			.await;

		managed.active_turn().take();
		ticket.release();
		guard.publish(&completion);
		info!(status = %completion.status, turn_id = ?completion.turn_id, "turn completed");
		Ok(completion)
	}

	async fn run_turn(
		&self,
		managed: &ManagedSession,
		ticket: &GateTicket,
		guard: &mut CompletionGuard,
		request: QueueTurnRequest,
		progress_sink: Option<mpsc::UnboundedSender<TurnProgress>>,
		cancel: &CancellationToken,
	) -> TurnCompletion {
		let session_id = managed.session_id.as_str();
		let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
		let (started_tx, mut started_rx) = oneshot::channel();
		let options = TurnOptions {
			model: request.model,
			effort: request.effort.or_else(|| managed.reasoning_effort.clone()),
			progress: Some(progress_tx),
			started: Some(started_tx),
			timeout: request.timeout,
		};

		let turn = managed
			.session
			.send_message(&request.text, &request.images, options, cancel);
		tokio::pin!(turn);

		let mut announced = false;
		let outcome = loop {
			tokio::select! {
				biased;
				started = &mut started_rx, if !announced => {
					announced = true;
					if let Ok(turn_id) = started {
						self.announce_turn(session_id, ticket, guard, turn_id);
					}
				}
				Some(progress) = progress_rx.recv() => {
					self.forward_progress(session_id, progress, progress_sink.as_ref());
				}
				outcome = &mut turn => break outcome,
			}
		};
		// The turn can start and finish within the poll that resolved it.
		if !announced {
			if let Ok(turn_id) = started_rx.try_recv() {
				self.announce_turn(session_id, ticket, guard, turn_id);
			}
		}
		// Deltas are queued before the turn resolves, so whatever is left is final.
		while let Ok(progress) = progress_rx.try_recv() {
			self.forward_progress(session_id, progress, progress_sink.as_ref());
		}

		let session_ended = managed.lifetime.is_cancelled();
		match outcome {
			Ok(result) => completion_from_result(session_id, result, session_ended),
			Err(SessionError::Cancelled) => {
				let status = if session_ended {
					CompletionStatus::SessionEnded
				} else {
					CompletionStatus::Interrupted
				};
				TurnCompletion::new(session_id, guard.turn_id.clone(), status)
					.with_error("turn cancelled before it started")
			}
			Err(e) => {
				let status = match &e {
					SessionError::Client(c) if c.is_connection_lost() || session_ended => {
						CompletionStatus::SessionEnded
					}
					_ => CompletionStatus::Failed,
				};
				TurnCompletion::new(session_id, guard.turn_id.clone(), status).with_error(e.to_string())
			}
		}
	}

	/// Bind the gate to the server's turn id so its own `turn/started` is not
	/// mistaken for a foreign turn.
	fn announce_turn(
		&self,
		session_id: &str,
		ticket: &GateTicket,
		guard: &mut CompletionGuard,
		turn_id: String,
	) {
		ticket.bind_turn(&turn_id);
		guard.turn_id = Some(turn_id.clone());
		self.sink.publish(
			EVENT_TURN_STARTED,
			json!({ "sessionId": session_id, "turnId": turn_id, "recovered": false }),
		);
	}

	fn forward_progress(
		&self,
		session_id: &str,
		progress: TurnProgress,
		caller: Option<&mpsc::UnboundedSender<TurnProgress>>,
	) {
		self.sink.publish(
			EVENT_TURN_PROGRESS,
			json!({
				"sessionId": session_id,
				"turnId": progress.turn_id,
				"delta": progress.delta,
			}),
		);
		if let Some(caller) = caller {
			let _ = caller.send(progress);
		}
	}

	/// Interrupt the running turn. Tries the protocol first; if the peer is
	/// unreachable or no turn is tracked, cancels the local wait instead.
	/// Returns whether anything was interrupted.
	#[instrument(skip(self))]
	pub async fn interrupt_turn(
		&self,
		session_id: &str,
		wait_for_start: Option<Duration>,
	) -> Result<bool> {
		let managed = self.managed(session_id)?;
		match managed
			.session
			.interrupt_turn(wait_for_start, &managed.lifetime)
			.await
		{
			Ok(true) => return Ok(true),
			Ok(false) => debug!("no tracked turn; falling back to local cancellation"),
			Err(e) => warn!(error = %e, "protocol interrupt failed; falling back to local cancellation"),
		}

		let local = match managed.active_turn().as_ref() {
			Some(token) => {
				token.cancel();
				true
			}
			None => false,
		};
		let recovered = managed.gate.clear_recovered();
		Ok(local || recovered)
	}

	/// Add input to the running turn.
	pub async fn steer_turn(&self, session_id: &str, text: &str) -> Result<Value> {
		let managed = self.managed(session_id)?;
		Ok(managed.session.steer(text, &managed.lifetime).await?)
	}

	pub async fn list_models(&self, session_id: &str) -> Result<Vec<ModelInfo>> {
		let managed = self.managed(session_id)?;
		Ok(managed.session.client().list_models(&managed.lifetime).await?)
	}

	pub fn pending_approvals(&self, session_id: &str) -> Result<Vec<PendingApproval>> {
		Ok(self.managed(session_id)?.approvals.list())
	}

	/// Supply a decision for a pending approval. Returns `false` if it was
	/// unknown or already decided.
	pub fn resolve_approval(
		&self,
		session_id: &str,
		approval_id: &str,
		decision: ApprovalDecision,
	) -> Result<bool> {
		let resolved = self
			.managed(session_id)?
			.approvals
			.try_resolve(approval_id, decision);
		if !resolved {
			debug!(session_id, approval_id, "approval not pending");
		}
		Ok(resolved)
	}

	/// Tear a session down. Safe while a turn is running: the turn reports
	/// `sessionEnded`.
	#[instrument(skip(self))]
	pub async fn stop_session(&self, session_id: &str) -> Result<()> {
		let managed = self
			.sessions()
			.remove(session_id)
			.ok_or_else(|| OrchestratorError::UnknownSession(session_id.to_string()))?;

		managed.lifetime.cancel();
		let cancelled = managed.approvals.cancel_all();
		managed.session.client().dispose().await;

		info!(cancelled_approvals = cancelled, "session stopped");
		self.sink.publish(
			EVENT_SESSION_STOPPED,
			json!({ "sessionId": session_id, "threadId": managed.session.thread_id() }),
		);
		Ok(())
	}

	/// Stop every session and refuse new ones.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let ids: Vec<String> = self.sessions().keys().cloned().collect();
		for id in ids {
			if let Err(e) = self.stop_session(&id).await {
				debug!(session_id = %id, error = %e, "session already gone at shutdown");
			}
		}
	}
}

fn completion_from_result(session_id: &str, result: TurnResult, session_ended: bool) -> TurnCompletion {
	let status = match result.status {
		TurnStatus::Completed => CompletionStatus::Completed,
		TurnStatus::Failed if session_ended => CompletionStatus::SessionEnded,
		TurnStatus::Failed => CompletionStatus::Failed,
		TurnStatus::TimedOut => CompletionStatus::TimedOut,
		TurnStatus::Interrupted if session_ended => CompletionStatus::SessionEnded,
		TurnStatus::Interrupted => CompletionStatus::Interrupted,
		TurnStatus::Pending | TurnStatus::Streaming => CompletionStatus::Abandoned,
	};
	TurnCompletion {
		session_id: session_id.to_string(),
		turn_id: Some(result.turn_id),
		status,
		text: result.text,
		error: result.error,
	}
}

/// Forward a session's core events to observers and feed raw traffic into
/// turn recovery.
async fn pump_events(
	session_id: String,
	mut events: broadcast::Receiver<CoreEvent>,
	gate: Arc<TurnGate>,
	sink: Arc<dyn BroadcastSink>,
	lifetime: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			_ = lifetime.cancelled() => break,
			event = events.recv() => event,
		};
		let event = match event {
			Ok(event) => event,
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				warn!(session_id = %session_id, skipped, "core event subscriber lagged");
				continue;
			}
			Err(broadcast::error::RecvError::Closed) => break,
		};

		if matches!(event.kind, CoreEventKind::Notification | CoreEventKind::Stderr) {
			if let Some(signal) = recovery::inspect(&event.message) {
				apply_recovered(&session_id, &gate, sink.as_ref(), signal);
			}
		}
		if event.kind != CoreEventKind::Notification {
			sink.publish(EVENT_CORE, json!({ "sessionId": session_id, "event": event }));
		}
	}
	debug!(session_id = %session_id, "event pump exited");
}

fn apply_recovered(
	session_id: &str,
	gate: &TurnGate,
	sink: &dyn BroadcastSink,
	signal: RecoveredSignal,
) {
	match &signal {
		RecoveredSignal::TurnStarted { turn_id, .. } => {
			if gate.mark_recovered_started(turn_id) {
				info!(session_id, turn_id = %turn_id, "recovered turn start from raw traffic");
				sink.publish(
					EVENT_TURN_STARTED,
					json!({ "sessionId": session_id, "turnId": turn_id, "recovered": true }),
				);
			}
		}
		RecoveredSignal::TurnFinished { turn_id, .. } => {
			if gate.mark_recovered_completed(turn_id) {
				info!(session_id, turn_id = %turn_id, "recovered turn completion from raw traffic");
				let completion = TurnCompletion::new(
					session_id,
					Some(turn_id.clone()),
					CompletionStatus::Completed,
				);
				sink.publish(EVENT_TURN_COMPLETED, json!(completion));
			}
		}
	}
}
