// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A thread bound to a live client, issuing at most one turn at a time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::AppServerClient;
use crate::error::{ClientError, SessionError, SessionResult};
use crate::protocol::{
	TurnStatus, UserInput, METHOD_THREAD_RESUME, METHOD_THREAD_START, METHOD_TURN_START,
};
use crate::registry::TurnRegistry;
use crate::turn::{ProgressSink, TurnResult, TurnTracker};

/// Thread-level settings sent with `thread/start` and `thread/resume`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThreadOptions {
	pub cwd: Option<PathBuf>,
	pub model: Option<String>,
	pub approval_policy: Option<String>,
	pub sandbox: Option<String>,
}

/// Per-turn overrides for [`CodexSession::send_message`].
#[derive(Debug, Default)]
pub struct TurnOptions {
	pub model: Option<String>,
	pub effort: Option<String>,
	pub progress: Option<ProgressSink>,
	/// Receives the turn id once `turn/start` is accepted.
	pub started: Option<oneshot::Sender<String>>,
	/// Overrides the client's `turn_timeout`.
	pub timeout: Option<Duration>,
}

/// Build turn input from text plus image references. References that look
/// like URLs are sent as remote images, everything else as local paths.
pub fn build_input(text: &str, images: &[String]) -> Vec<UserInput> {
	let mut input = Vec::with_capacity(images.len() + 1);
	if !text.trim().is_empty() {
		input.push(UserInput::Text {
			text: text.to_string(),
		});
	}
	for image in images.iter().filter(|i| !i.trim().is_empty()) {
		if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("data:") {
			input.push(UserInput::Image { url: image.clone() });
		} else {
			input.push(UserInput::LocalImage {
				path: image.clone(),
			});
		}
	}
	input
}

pub struct CodexSession {
	client: AppServerClient,
	thread_id: String,
	cwd: Option<PathBuf>,
	model: Option<String>,
	gate: Arc<Semaphore>,
	current_turn: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for CodexSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CodexSession")
			.field("thread_id", &self.thread_id)
			.field("model", &self.model)
			.field("current_turn", &self.current_turn_id())
			.finish()
	}
}

impl CodexSession {
	/// Start a new thread.
	#[instrument(skip(client, options, cancel))]
	pub async fn start(
		client: AppServerClient,
		options: ThreadOptions,
		cancel: &CancellationToken,
	) -> SessionResult<Self> {
		let params = thread_params(None, &options);
		let result = client
			.send_request(METHOD_THREAD_START, params, cancel)
			.await
			.map_err(cancelled)?;
		let thread_id = thread_id_from(&result).ok_or_else(|| SessionError::MissingThreadId {
			method: METHOD_THREAD_START.to_string(),
		})?;
		info!(thread_id = %thread_id, "thread started");
		Ok(Self::bound(client, thread_id, &options, &result))
	}

	/// Re-attach to an existing thread.
	#[instrument(skip(client, options, cancel))]
	pub async fn resume(
		client: AppServerClient,
		thread_id: &str,
		options: ThreadOptions,
		cancel: &CancellationToken,
	) -> SessionResult<Self> {
		let params = thread_params(Some(thread_id), &options);
		let result = client
			.send_request(METHOD_THREAD_RESUME, params, cancel)
			.await
			.map_err(cancelled)?;
		let thread_id = thread_id_from(&result).unwrap_or_else(|| thread_id.to_string());
		info!(thread_id = %thread_id, "thread resumed");
		Ok(Self::bound(client, thread_id, &options, &result))
	}

	fn bound(
		client: AppServerClient,
		thread_id: String,
		options: &ThreadOptions,
		result: &Value,
	) -> Self {
		let model = result
			.get("model")
			.and_then(Value::as_str)
			.map(str::to_string)
			.or_else(|| options.model.clone());
		Self {
			client,
			thread_id,
			cwd: options.cwd.clone(),
			model,
			gate: Arc::new(Semaphore::new(1)),
			current_turn: Arc::new(Mutex::new(None)),
		}
	}

	pub fn thread_id(&self) -> &str {
		&self.thread_id
	}

	pub fn cwd(&self) -> Option<&PathBuf> {
		self.cwd.as_ref()
	}

	pub fn model(&self) -> Option<&str> {
		self.model.as_deref()
	}

	pub fn client(&self) -> &AppServerClient {
		&self.client
	}

	pub fn current_turn_id(&self) -> Option<String> {
		self
			.current_turn
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	/// Free single-flight capacity: 1 when idle, 0 while a turn runs.
	pub fn gate_available(&self) -> usize {
		self.gate.available_permits()
	}

	/// Run one turn and wait for its terminal result.
	///
	/// Callers queue on the session's gate until any earlier turn on this
	/// thread has finished. Turn-level failures (peer error, timeout,
	/// interruption) come back inside the [`TurnResult`]; only input and
	/// connection problems are returned as errors.
	#[instrument(skip(self, text, images, options, cancel), fields(thread_id = %self.thread_id))]
	pub async fn send_message(
		&self,
		text: &str,
		images: &[String],
		options: TurnOptions,
		cancel: &CancellationToken,
	) -> SessionResult<TurnResult> {
		let input = build_input(text, images);
		if input.is_empty() {
			return Err(SessionError::EmptyInput);
		}

		let _permit = tokio::select! {
			permit = Arc::clone(&self.gate).acquire_owned() => {
				permit.map_err(|_| SessionError::Client(ClientError::Disposed))?
			}
			_ = cancel.cancelled() => return Err(SessionError::Cancelled),
		};

		let mut params = Map::new();
		params.insert("threadId".into(), json!(self.thread_id));
		params.insert("input".into(), serde_json::to_value(&input).map_err(ClientError::from)?);
		if let Some(model) = &options.model {
			params.insert("model".into(), json!(model));
		}
		if let Some(effort) = &options.effort {
			params.insert("effort".into(), json!(effort));
		}

		let result = self
			.client
			.send_request(METHOD_TURN_START, Value::Object(params), cancel)
			.await
			.map_err(cancelled)?;
		let turn_id = turn_id_from(&result).ok_or_else(|| SessionError::MissingTurnId {
			method: METHOD_TURN_START.to_string(),
		})?;

		let config = self.client.config();
		let (tracker, waiter) = TurnTracker::new(
			turn_id.clone(),
			self.thread_id.clone(),
			config.completion_grace,
			options.progress,
		);
		let _active = ActiveTurn::register(
			self.client.turns(),
			&tracker,
			Arc::clone(&self.current_turn),
		)?;
		debug!(turn_id = %turn_id, "turn started");
		if let Some(started) = options.started {
			let _ = started.send(turn_id.clone());
		}

		let limit = options.timeout.unwrap_or(config.turn_timeout);
		let result = tokio::select! {
			result = waiter => result,
			_ = tokio::time::sleep(limit) => {
				warn!(turn_id = %turn_id, timeout_ms = limit.as_millis() as u64, "turn timed out");
				tracker.resolve(
					TurnStatus::TimedOut,
					Some(format!("turn timed out after {}ms", limit.as_millis())),
				);
				self.best_effort_interrupt(&turn_id).await;
				resolved(&tracker)
			}
			_ = cancel.cancelled() => {
				debug!(turn_id = %turn_id, "turn wait cancelled");
				tracker.resolve(TurnStatus::Interrupted, Some("turn cancelled".to_string()));
				self.best_effort_interrupt(&turn_id).await;
				resolved(&tracker)
			}
		};

		info!(
			turn_id = %result.turn_id,
			status = %result.status,
			chars = result.text.len(),
			"turn finished"
		);
		Ok(result)
	}

	/// Ask the peer to interrupt the running turn.
	///
	/// With a wait budget and no tracked turn yet, polls at the client's
	/// `interrupt_poll_interval` until one appears. Returns `false` if no
	/// turn was found in time.
	#[instrument(skip(self, cancel), fields(thread_id = %self.thread_id))]
	pub async fn interrupt_turn(
		&self,
		wait_for_start: Option<Duration>,
		cancel: &CancellationToken,
	) -> SessionResult<bool> {
		let config = self.client.config();
		let deadline = tokio::time::Instant::now() + wait_for_start.unwrap_or_default();

		let tracker = loop {
			if let Some(tracker) = self.client.turns().active_for_thread(&self.thread_id) {
				break tracker;
			}
			let now = tokio::time::Instant::now();
			if now >= deadline {
				debug!("no turn to interrupt");
				return Ok(false);
			}
			let nap = config.interrupt_poll_interval.min(deadline - now);
			tokio::select! {
				_ = tokio::time::sleep(nap) => {}
				_ = cancel.cancelled() => return Err(SessionError::Cancelled),
			}
		};

		let turn_id = tracker.turn_id().to_string();
		self.send_interrupt(&turn_id, cancel).await?;
		info!(turn_id = %turn_id, "interrupt sent");
		Ok(true)
	}

	/// Append input to the running turn.
	#[instrument(skip(self, text, cancel), fields(thread_id = %self.thread_id))]
	pub async fn steer(&self, text: &str, cancel: &CancellationToken) -> SessionResult<Value> {
		let input = build_input(text, &[]);
		if input.is_empty() {
			return Err(SessionError::EmptyInput);
		}
		let tracker = self
			.client
			.turns()
			.active_for_thread(&self.thread_id)
			.ok_or_else(|| SessionError::NoActiveTurn(self.thread_id.clone()))?;
		let result = self
			.client
			.steer_turn(&self.thread_id, tracker.turn_id(), &input, cancel)
			.await
			.map_err(cancelled)?;
		Ok(result)
	}

	async fn send_interrupt(&self, turn_id: &str, cancel: &CancellationToken) -> SessionResult<()> {
		let limit = self.client.config().interrupt_request_timeout;
		match tokio::time::timeout(
			limit,
			self.client.interrupt_turn(&self.thread_id, turn_id, cancel),
		)
		.await
		{
			Ok(result) => result.map_err(cancelled),
			Err(_) => Err(SessionError::Client(ClientError::Timeout {
				method: crate::protocol::METHOD_TURN_INTERRUPT.to_string(),
			})),
		}
	}

	async fn best_effort_interrupt(&self, turn_id: &str) {
		if self.client.is_closed() {
			return;
		}
		if let Err(e) = self.send_interrupt(turn_id, &CancellationToken::new()).await {
			debug!(turn_id = %turn_id, error = %e, "interrupt after local stop failed");
		}
	}
}

/// Registry membership and the session's current-turn pointer for one turn.
/// Dropping it unregisters the turn on every exit path.
struct ActiveTurn<'a> {
	turns: &'a TurnRegistry,
	turn_id: String,
	current: Arc<Mutex<Option<String>>>,
}

impl<'a> ActiveTurn<'a> {
	fn register(
		turns: &'a TurnRegistry,
		tracker: &Arc<TurnTracker>,
		current: Arc<Mutex<Option<String>>>,
	) -> SessionResult<Self> {
		let replayed = turns.prime(tracker)?;
		if replayed > 0 {
			debug!(turn_id = %tracker.turn_id(), replayed, "replayed buffered signals");
		}
		*current.lock().unwrap_or_else(|e| e.into_inner()) = Some(tracker.turn_id().to_string());
		Ok(Self {
			turns,
			turn_id: tracker.turn_id().to_string(),
			current,
		})
	}
}

impl Drop for ActiveTurn<'_> {
	fn drop(&mut self) {
		if let Some(tracker) = self.turns.remove(&self.turn_id) {
			if !tracker.is_resolved() {
				tracker.resolve(TurnStatus::Interrupted, Some("turn abandoned".to_string()));
			}
		}
		let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
		if current.as_deref() == Some(self.turn_id.as_str()) {
			*current = None;
		}
	}
}

fn resolved(tracker: &TurnTracker) -> TurnResult {
	tracker.result().unwrap_or_else(|| TurnResult {
		turn_id: tracker.turn_id().to_string(),
		thread_id: tracker.thread_id().to_string(),
		status: tracker.status(),
		text: tracker.text(),
		error: None,
	})
}

fn cancelled(err: ClientError) -> SessionError {
	match err {
		ClientError::Cancelled => SessionError::Cancelled,
		other => SessionError::Client(other),
	}
}

fn thread_params(thread_id: Option<&str>, options: &ThreadOptions) -> Value {
	let mut params = match serde_json::to_value(options) {
		Ok(Value::Object(map)) => map,
		_ => Map::new(),
	};
	params.retain(|_, v| !v.is_null());
	if let Some(thread_id) = thread_id {
		params.insert("threadId".into(), json!(thread_id));
	}
	Value::Object(params)
}

fn thread_id_from(result: &Value) -> Option<String> {
	["/thread/id", "/threadId", "/id"]
		.iter()
		.find_map(|p| result.pointer(p).and_then(Value::as_str))
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

fn turn_id_from(result: &Value) -> Option<String> {
	["/turn/id", "/turnId", "/id"]
		.iter()
		.find_map(|p| result.pointer(p).and_then(Value::as_str))
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_input_splits_urls_and_paths() {
		let input = build_input(
			"look",
			&["https://x.test/a.png".to_string(), "/tmp/b.png".to_string()],
		);
		assert_eq!(
			input,
			vec![
				UserInput::Text {
					text: "look".to_string()
				},
				UserInput::Image {
					url: "https://x.test/a.png".to_string()
				},
				UserInput::LocalImage {
					path: "/tmp/b.png".to_string()
				},
			]
		);
	}

	#[test]
	fn blank_text_without_images_is_empty() {
		assert!(build_input("  \n", &[]).is_empty());
		assert_eq!(build_input("", &["/a.png".to_string()]).len(), 1);
	}

	#[test]
	fn thread_params_omit_unset_fields() {
		let params = thread_params(
			Some("th-1"),
			&ThreadOptions {
				model: Some("gpt-5".to_string()),
				..Default::default()
			},
		);
		assert_eq!(params, json!({"model": "gpt-5", "threadId": "th-1"}));
	}

	#[test]
	fn ids_from_nested_or_flat_results() {
		assert_eq!(
			turn_id_from(&json!({"turn": {"id": "t1"}})),
			Some("t1".to_string())
		);
		assert_eq!(turn_id_from(&json!({"turnId": "t2"})), Some("t2".to_string()));
		assert_eq!(turn_id_from(&json!({"turn": {}})), None);
		assert_eq!(
			thread_id_from(&json!({"thread": {"id": "th"}})),
			Some("th".to_string())
		);
	}
}
