// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Correlation engine for the app server protocol.
//!
//! Owns the read loops for both transport channels, assigns request ids,
//! matches responses to waiters, answers peer-initiated requests, and routes
//! notifications into the [`TurnRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{CoreEvent, CoreEventKind, CoreEventLevel, EventPublisher};
use crate::peer::{DefaultPeerHandler, PeerRequest, PeerRequestHandler, PeerResponse};
use crate::protocol::{
	error_message, Notification, OutgoingNotification, OutgoingRequest, OutgoingResponse,
	RawFrame, RequestId, RpcErrorBody, TurnSignal, TurnStatus, UserInput, METHOD_INITIALIZE,
	METHOD_INITIALIZED, METHOD_MODEL_LIST, METHOD_TURN_INTERRUPT, METHOD_TURN_STEER,
};
use crate::registry::TurnRegistry;
use crate::transport::{LineReader, LineWriter, ProcessHandle, Transport};

struct PendingRequest {
	method: String,
	tx: oneshot::Sender<ClientResult<Value>>,
}

#[derive(Default)]
struct PendingState {
	requests: HashMap<RequestId, PendingRequest>,
	/// Set once the primary stream is gone; no new waiters may register.
	closed: Option<ClientError>,
}

/// Identity sent with `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	pub version: String,
}

/// One entry of a `model/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
	pub id: String,
	#[serde(default)]
	pub model: Option<String>,
	#[serde(default)]
	pub display_name: Option<String>,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub is_default: bool,
}

/// Handle to one app server connection. Cheap to clone.
#[derive(Clone)]
pub struct AppServerClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	writer: tokio::sync::Mutex<LineWriter>,
	pending: Mutex<PendingState>,
	next_id: AtomicU64,
	turns: TurnRegistry,
	events: EventPublisher,
	notifications: broadcast::Sender<Notification>,
	handler: RwLock<Arc<dyn PeerRequestHandler>>,
	config: ClientConfig,
	disposed: AtomicBool,
	shutdown: CancellationToken,
	process: tokio::sync::Mutex<ProcessHandle>,
}

impl std::fmt::Debug for AppServerClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AppServerClient")
			.field("pending", &self.pending_requests())
			.field("turns", &self.inner.turns.len())
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl AppServerClient {
	/// Take ownership of a transport and start both read loops. Peer requests
	/// are answered by [`DefaultPeerHandler`] until another handler is set.
	pub fn start(transport: Transport, config: ClientConfig) -> Self {
		Self::start_with_handler(transport, config, Arc::new(DefaultPeerHandler))
	}

	pub fn start_with_handler(
		transport: Transport,
		config: ClientConfig,
		handler: Arc<dyn PeerRequestHandler>,
	) -> Self {
		let parts = transport.into_parts();
		let events = EventPublisher::new(config.event_capacity);
		let (notifications, _) = broadcast::channel(config.event_capacity.max(1));
		let turns = TurnRegistry::new(
			events.clone(),
			config.max_buffered_turns,
			config.retired_turn_memory,
		);

		let inner = Arc::new(ClientInner {
			writer: tokio::sync::Mutex::new(parts.writer),
			pending: Mutex::new(PendingState::default()),
			next_id: AtomicU64::new(1),
			turns,
			events,
			notifications,
			handler: RwLock::new(handler),
			config,
			disposed: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
			process: tokio::sync::Mutex::new(parts.process),
		});

		tokio::spawn(run_primary(
			Arc::downgrade(&inner),
			parts.primary,
			inner.shutdown.clone(),
		));
		if let Some(diagnostic) = parts.diagnostic {
			tokio::spawn(run_diagnostic(
				Arc::downgrade(&inner),
				diagnostic,
				inner.shutdown.clone(),
			));
		}

		Self { inner }
	}

	pub fn set_peer_handler(&self, handler: Arc<dyn PeerRequestHandler>) {
		*self
			.inner
			.handler
			.write()
			.unwrap_or_else(|e| e.into_inner()) = handler;
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	pub fn turns(&self) -> &TurnRegistry {
		&self.inner.turns
	}

	pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
		self.inner.events.subscribe()
	}

	pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
		self.inner.notifications.subscribe()
	}

	/// True once the primary stream closed or the client was disposed.
	pub fn is_closed(&self) -> bool {
		self.inner.pending().closed.is_some()
	}

	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::SeqCst)
	}

	pub fn pending_requests(&self) -> usize {
		self.inner.pending().requests.len()
	}

	/// Send a request and wait for its response, the caller's cancellation,
	/// disposal, or the configured request timeout. The waiter is removed on
	/// every path that does not consume a response.
	#[instrument(skip(self, params, cancel), fields(request_id))]
	pub async fn send_request(
		&self,
		method: &str,
		params: Value,
		cancel: &CancellationToken,
	) -> ClientResult<Value> {
		let (id, rx) = self.inner.register(method)?;
		tracing::Span::current().record("request_id", id);
		let _guard = PendingGuard {
			inner: &self.inner,
			id,
		};

		let line = serde_json::to_string(&OutgoingRequest { id, method, params })?;
		// The write shares the select with cancellation so a peer that stops
		// reading cannot pin the caller.
		let exchange = async {
			self.inner.write_line(&line).await?;
			trace!(id, method, "request sent");
			rx.await.unwrap_or(Err(ClientError::TransportClosed))
		};

		let timeout = self.inner.config.request_timeout;
		tokio::select! {
			result = exchange => result,
			_ = cancel.cancelled() => {
				debug!(id, method, "request cancelled by caller");
				Err(ClientError::Cancelled)
			}
			_ = self.inner.shutdown.cancelled() => Err(ClientError::Disposed),
			_ = sleep_or_forever(timeout) => {
				warn!(id, method, "request timed out");
				Err(ClientError::Timeout { method: method.to_string() })
			}
		}
	}

	/// Typed wrapper over [`send_request`](Self::send_request).
	pub async fn request<P, R>(
		&self,
		method: &str,
		params: &P,
		cancel: &CancellationToken,
	) -> ClientResult<R>
	where
		P: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let params = serde_json::to_value(params)?;
		let value = self.send_request(method, params, cancel).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Answer a peer-initiated request, echoing its id verbatim.
	pub async fn send_response(&self, id: Value, response: PeerResponse) -> ClientResult<()> {
		self.inner.send_response(id, response).await
	}

	pub async fn send_notification(&self, method: &str, params: Value) -> ClientResult<()> {
		let line = serde_json::to_string(&OutgoingNotification { method, params })?;
		self.inner.write_line(&line).await
	}

	/// `initialize` handshake followed by the `initialized` notification.
	#[instrument(skip(self, cancel), fields(client = %client_info.name))]
	pub async fn initialize(
		&self,
		client_info: &ClientInfo,
		cancel: &CancellationToken,
	) -> ClientResult<Value> {
		let result = self
			.send_request(
				METHOD_INITIALIZE,
				json!({ "clientInfo": client_info }),
				cancel,
			)
			.await?;
		self.send_notification(METHOD_INITIALIZED, Value::Null).await?;
		info!(user_agent = ?result.get("userAgent"), "app server initialized");
		Ok(result)
	}

	pub async fn list_models(&self, cancel: &CancellationToken) -> ClientResult<Vec<ModelInfo>> {
		let result = self.send_request(METHOD_MODEL_LIST, json!({}), cancel).await?;
		let data = result
			.get("data")
			.or_else(|| result.get("models"))
			.cloned()
			.unwrap_or(Value::Array(Vec::new()));
		Ok(serde_json::from_value(data)?)
	}

	pub async fn interrupt_turn(
		&self,
		thread_id: &str,
		turn_id: &str,
		cancel: &CancellationToken,
	) -> ClientResult<()> {
		self
			.send_request(
				METHOD_TURN_INTERRUPT,
				json!({ "threadId": thread_id, "turnId": turn_id }),
				cancel,
			)
			.await
			.map(|_| ())
	}

	pub async fn steer_turn(
		&self,
		thread_id: &str,
		turn_id: &str,
		input: &[UserInput],
		cancel: &CancellationToken,
	) -> ClientResult<Value> {
		self
			.send_request(
				METHOD_TURN_STEER,
				json!({ "threadId": thread_id, "expectedTurnId": turn_id, "input": input }),
				cancel,
			)
			.await
	}

	/// Tear the connection down: fail pending requests, resolve every live
	/// turn as interrupted, stop the read loops and terminate the process.
	/// Safe to call more than once.
	#[instrument(skip(self))]
	pub async fn dispose(&self) {
		if self.inner.disposed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.shutdown.cancel();
		let failed = self.inner.close_pending(ClientError::Disposed);
		let turns = self
			.inner
			.turns
			.resolve_all(TurnStatus::Interrupted, "client disposed");
		self.inner.events.publish(
			CoreEventLevel::Info,
			CoreEventKind::Disposed,
			format!("client disposed; failed {failed} request(s) and {turns} turn(s)"),
		);
		// Kill the process first: a writer blocked on a full pipe holds the
		// writer lock until the pipe breaks.
		self.inner.process.lock().await.terminate().await;
		self.inner.writer.lock().await.close().await;
	}
}

struct PendingGuard<'a> {
	inner: &'a ClientInner,
	id: RequestId,
}

impl Drop for PendingGuard<'_> {
	fn drop(&mut self) {
		self.inner.pending().requests.remove(&self.id);
	}
}

impl ClientInner {
	fn pending(&self) -> MutexGuard<'_, PendingState> {
		self.pending.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn handler(&self) -> Arc<dyn PeerRequestHandler> {
		Arc::clone(&self.handler.read().unwrap_or_else(|e| e.into_inner()))
	}

	fn register(
		&self,
		method: &str,
	) -> ClientResult<(RequestId, oneshot::Receiver<ClientResult<Value>>)> {
		let mut pending = self.pending();
		if let Some(err) = &pending.closed {
			return Err(err.clone());
		}
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		pending.requests.insert(
			id,
			PendingRequest {
				method: method.to_string(),
				tx,
			},
		);
		Ok((id, rx))
	}

	/// Mark the connection closed and fail every waiter. Returns the count.
	fn close_pending(&self, reason: ClientError) -> usize {
		let drained: Vec<_> = {
			let mut pending = self.pending();
			if pending.closed.is_none() {
				pending.closed = Some(reason.clone());
			}
			pending.requests.drain().collect()
		};
		let count = drained.len();
		for (_, request) in drained {
			let _ = request.tx.send(Err(reason.clone()));
		}
		count
	}

	async fn write_line(&self, line: &str) -> ClientResult<()> {
		let write = async {
			let mut writer = self.writer.lock().await;
			writer.write_line(line).await
		};
		tokio::select! {
			biased;
			_ = self.shutdown.cancelled() => Err(ClientError::Disposed),
			written = write => Ok(written?),
		}
	}

	async fn send_response(&self, id: Value, response: PeerResponse) -> ClientResult<()> {
		let frame = match response {
			PeerResponse::Result(result) => OutgoingResponse {
				id,
				result: Some(result),
				error: None,
			},
			PeerResponse::Error { code, message } => OutgoingResponse {
				id,
				result: None,
				error: Some(RpcErrorBody {
					code,
					message,
					data: None,
				}),
			},
		};
		let line = serde_json::to_string(&frame)?;
		self.write_line(&line).await
	}

	fn handle_line(self: &Arc<Self>, line: &str) {
		let line = line.trim();
		if line.is_empty() {
			return;
		}

		let frame = match RawFrame::parse(line) {
			Ok(frame) => frame,
			Err(e) => {
				self.events.publish(
					CoreEventLevel::Warn,
					CoreEventKind::MalformedFrame,
					format!("unparseable line ({e}): {}", truncate(line, 256)),
				);
				return;
			}
		};

		match (frame.id.clone(), frame.method.clone()) {
			// A frame naming a method is never a response, even if its id happens
			// to collide with one of ours.
			(Some(id), Some(method)) => self.dispatch_peer_request(id, method, frame.params),
			(Some(id), None) => self.resolve_response(id, frame),
			(None, Some(method)) => {
				let notification = Notification::new(method, frame.params.unwrap_or(Value::Null));
				self.events.publish(
					CoreEventLevel::Trace,
					CoreEventKind::Notification,
					line.to_string(),
				);
				self.route_notification(&notification);
				let _ = self.notifications.send(notification);
			}
			(None, None) => self.events.publish(
				CoreEventLevel::Warn,
				CoreEventKind::MalformedFrame,
				format!("frame has neither id nor method: {}", truncate(line, 256)),
			),
		}
	}

	fn resolve_response(&self, id: Value, frame: RawFrame) {
		let pending = frame
			.numeric_id()
			.and_then(|id| self.pending().requests.remove(&id));
		let Some(pending) = pending else {
			self.events.publish(
				CoreEventLevel::Debug,
				CoreEventKind::StrayResponse,
				format!("response for unknown request id {id}"),
			);
			return;
		};

		let outcome = match (frame.result, frame.error) {
			(_, Some(error)) if !error.is_null() => Err(ClientError::Remote {
				code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
				message: error_message(&error).unwrap_or_else(|| error.to_string()),
			}),
			(Some(result), _) => Ok(result),
			(None, _) => {
				warn!(%id, method = %pending.method, "response without result or error");
				Err(ClientError::MalformedResponse {
					method: pending.method.clone(),
				})
			}
		};
		let _ = pending.tx.send(outcome);
	}

	fn dispatch_peer_request(self: &Arc<Self>, id: Value, method: String, params: Option<Value>) {
		let request = PeerRequest {
			id,
			method,
			params: params.unwrap_or(Value::Null),
		};
		self.events.publish(
			CoreEventLevel::Debug,
			CoreEventKind::PeerRequest,
			format!("{} (id {})", request.method, request.id),
		);

		let handler = self.handler();
		let inner = Arc::clone(self);
		tokio::spawn(async move {
			let id = request.id.clone();
			let method = request.method.clone();
			let response = handler.handle(request).await;
			if let Err(e) = inner.send_response(id, response).await {
				warn!(method = %method, error = %e, "failed to answer peer request");
			}
		});
	}

	fn route_notification(&self, notification: &Notification) {
		let Some(signal) = TurnSignal::from_notification(notification) else {
			return;
		};

		match notification.turn_id() {
			Some(turn_id) => {
				self.turns.route(turn_id, signal);
			}
			None => match (&signal, notification.thread_id()) {
				(TurnSignal::Error { .. }, Some(thread_id)) => {
					self.turns.route_to_thread(thread_id, signal);
				}
				(TurnSignal::Error { .. }, None) => {
					self.turns.route_to_all(signal);
				}
				_ => debug!(method = %notification.method, "turn signal without turn id; dropping"),
			},
		}
	}

	fn on_closed(&self, reason: &str) {
		if self.disposed.load(Ordering::SeqCst) {
			return;
		}
		let failed = self.close_pending(ClientError::TransportClosed);
		let turns = self.turns.resolve_all(TurnStatus::Failed, "transport closed");
		self.events.publish(
			CoreEventLevel::Warn,
			CoreEventKind::TransportClosed,
			format!("{reason}; failed {failed} request(s) and {turns} turn(s)"),
		);
	}
}

async fn run_primary(
	inner: Weak<ClientInner>,
	mut lines: LineReader,
	shutdown: CancellationToken,
) {
	loop {
		let next = tokio::select! {
			_ = shutdown.cancelled() => break,
			next = lines.next_line() => next,
		};
		let Some(inner) = inner.upgrade() else {
			break;
		};
		match next {
			Ok(Some(line)) => inner.handle_line(&line),
			Ok(None) => {
				inner.on_closed("primary stream ended");
				break;
			}
			Err(e) => {
				inner.on_closed(&format!("primary stream read failed: {e}"));
				break;
			}
		}
	}
	debug!("primary read loop exited");
}

async fn run_diagnostic(
	inner: Weak<ClientInner>,
	mut lines: LineReader,
	shutdown: CancellationToken,
) {
	loop {
		let next = tokio::select! {
			_ = shutdown.cancelled() => break,
			next = lines.next_line() => next,
		};
		let Some(inner) = inner.upgrade() else {
			break;
		};
		match next {
			Ok(Some(line)) => {
				if !line.trim().is_empty() {
					inner
						.events
						.publish(CoreEventLevel::Debug, CoreEventKind::Stderr, line);
				}
			}
			Ok(None) => break,
			Err(e) => {
				// Diagnostic noise never affects the protocol.
				debug!(error = %e, "diagnostic stream read failed");
				break;
			}
		}
	}
	debug!("diagnostic read loop exited");
}

async fn sleep_or_forever(limit: Option<Duration>) {
	match limit {
		Some(limit) => tokio::time::sleep(limit).await,
		None => std::future::pending().await,
	}
}

fn truncate(line: &str, max: usize) -> &str {
	match line.char_indices().nth(max) {
		Some((idx, _)) => &line[..idx],
		None => line,
	}
}
