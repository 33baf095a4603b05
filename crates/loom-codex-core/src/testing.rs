// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory app server peers for tests.
//!
//! [`FakePeer`] gives a test frame-level control over the other end of a
//! [`Transport`]. [`ScriptedAppServer`] is a small behaving app server that
//! answers the thread/turn methods on its own, which is what session and
//! orchestrator tests usually want.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{
	METHOD_COMMAND_APPROVAL, METHOD_INITIALIZE, METHOD_MODEL_LIST, METHOD_THREAD_RESUME,
	METHOD_THREAD_START, METHOD_TURN_INTERRUPT, METHOD_TURN_START, METHOD_TURN_STEER,
	NOTIFY_AGENT_MESSAGE_DELTA, NOTIFY_TURN_COMPLETED, NOTIFY_TURN_STARTED,
};
use crate::transport::Transport;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A frame the client wrote, as seen by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
	pub id: Option<Value>,
	pub method: Option<String>,
	pub params: Value,
	pub result: Option<Value>,
	pub error: Option<Value>,
}

impl ClientFrame {
	fn from_value(value: Value) -> Self {
		let field = |name: &str| value.get(name).cloned();
		Self {
			id: field("id"),
			method: value
				.get("method")
				.and_then(Value::as_str)
				.map(str::to_string),
			params: field("params").unwrap_or(Value::Null),
			result: field("result"),
			error: field("error"),
		}
	}

	pub fn is_request(&self) -> bool {
		self.id.is_some() && self.method.is_some()
	}

	pub fn is_response(&self) -> bool {
		self.id.is_some() && self.method.is_none()
	}

	pub fn numeric_id(&self) -> Option<u64> {
		self.id.as_ref().and_then(Value::as_u64)
	}
}

/// Frame-level control of the far end of an in-memory transport.
pub struct FakePeer {
	incoming: Lines<BufReader<DuplexStream>>,
	outgoing: Option<DuplexStream>,
	diagnostic: Option<DuplexStream>,
}

impl FakePeer {
	/// Build a connected `(Transport, FakePeer)` pair.
	pub fn pair() -> (Transport, FakePeer) {
		let (client_out, peer_in) = duplex(PIPE_CAPACITY);
		let (peer_out, client_in) = duplex(PIPE_CAPACITY);
		let (peer_diag, client_diag) = duplex(PIPE_CAPACITY);
		let transport = Transport::from_streams(client_out, client_in).with_diagnostic(client_diag);
		let peer = FakePeer {
			incoming: BufReader::new(peer_in).lines(),
			outgoing: Some(peer_out),
			diagnostic: Some(peer_diag),
		};
		(transport, peer)
	}

	/// Next frame written by the client, or `None` once it closed its writer.
	pub async fn next_frame(&mut self) -> Option<ClientFrame> {
		loop {
			let line = self.incoming.next_line().await.ok()??;
			if line.trim().is_empty() {
				continue;
			}
			let value: Value = serde_json::from_str(&line).ok()?;
			return Some(ClientFrame::from_value(value));
		}
	}

	/// Next client request, skipping notifications and responses.
	pub async fn next_request(&mut self) -> Option<ClientFrame> {
		loop {
			let frame = self.next_frame().await?;
			if frame.is_request() {
				return Some(frame);
			}
		}
	}

	/// Next client response to one of our requests, skipping everything else.
	pub async fn next_response(&mut self) -> Option<ClientFrame> {
		loop {
			let frame = self.next_frame().await?;
			if frame.is_response() {
				return Some(frame);
			}
		}
	}

	pub async fn respond(&mut self, id: &Value, result: Value) -> std::io::Result<()> {
		self.send(&json!({ "id": id, "result": result })).await
	}

	pub async fn respond_error(&mut self, id: &Value, code: i64, message: &str) -> std::io::Result<()> {
		self
			.send(&json!({ "id": id, "error": { "code": code, "message": message } }))
			.await
	}

	pub async fn notify(&mut self, method: &str, params: Value) -> std::io::Result<()> {
		self.send(&json!({ "method": method, "params": params })).await
	}

	/// Issue a peer-initiated request to the client.
	pub async fn request(&mut self, id: Value, method: &str, params: Value) -> std::io::Result<()> {
		self
			.send(&json!({ "id": id, "method": method, "params": params }))
			.await
	}

	pub async fn send(&mut self, frame: &Value) -> std::io::Result<()> {
		self.send_raw(&frame.to_string()).await
	}

	pub async fn send_raw(&mut self, line: &str) -> std::io::Result<()> {
		self.send_bytes(line.as_bytes()).await
	}

	/// Write `bytes` plus a newline on the primary channel, UTF-8 or not.
	pub async fn send_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
		write_line(self.outgoing.as_mut(), bytes).await
	}

	/// Write a line on the diagnostic channel.
	pub async fn diagnostic(&mut self, line: &str) -> std::io::Result<()> {
		self.diagnostic_bytes(line.as_bytes()).await
	}

	pub async fn diagnostic_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
		write_line(self.diagnostic.as_mut(), bytes).await
	}

	/// Close the primary channel; the client sees end-of-stream.
	pub fn close(&mut self) {
		self.outgoing = None;
		self.diagnostic = None;
	}
}

async fn write_line(stream: Option<&mut DuplexStream>, bytes: &[u8]) -> std::io::Result<()> {
	let stream = stream.ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
	stream.write_all(bytes).await?;
	stream.write_all(b"\n").await?;
	stream.flush().await
}

/// How a [`ScriptedAppServer`] plays each turn.
#[derive(Debug, Clone)]
pub struct ScriptedBehavior {
	/// Text streamed as one delta before completion.
	pub reply: String,
	/// Leave turns running until [`ScriptedHandle::complete_turn`] or an
	/// interrupt arrives.
	pub hold_turns: bool,
	/// Ask for a command approval before replying, and echo the decision.
	pub request_approval: bool,
	/// Send `turn/completed` before the delta, exercising the grace window.
	pub complete_before_delta: bool,
}

impl Default for ScriptedBehavior {
	fn default() -> Self {
		Self {
			reply: "ok".to_string(),
			hold_turns: false,
			request_approval: false,
			complete_before_delta: false,
		}
	}
}

#[derive(Debug, Default)]
struct ScriptedState {
	methods: Vec<String>,
	approval_decisions: Vec<Value>,
	active_turns: Vec<(String, String)>,
	threads: usize,
	turns: usize,
}

enum Control {
	Complete { turn_id: String, text: String },
	Notify { method: String, params: Value },
	Close,
}

/// Observes and steers a running [`ScriptedAppServer`].
#[derive(Clone)]
pub struct ScriptedHandle {
	state: Arc<Mutex<ScriptedState>>,
	control: mpsc::UnboundedSender<Control>,
}

impl ScriptedHandle {
	fn state(&self) -> MutexGuard<'_, ScriptedState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Every request method received, in order.
	pub fn methods(&self) -> Vec<String> {
		self.state().methods.clone()
	}

	pub fn count(&self, method: &str) -> usize {
		self.state().methods.iter().filter(|m| *m == method).count()
	}

	pub fn approval_decisions(&self) -> Vec<Value> {
		self.state().approval_decisions.clone()
	}

	/// `(thread_id, turn_id)` of turns started but not yet completed.
	pub fn active_turns(&self) -> Vec<(String, String)> {
		self.state().active_turns.clone()
	}

	/// Finish a held turn with the given text.
	pub fn complete_turn(&self, turn_id: &str, text: &str) {
		let _ = self.control.send(Control::Complete {
			turn_id: turn_id.to_string(),
			text: text.to_string(),
		});
	}

	/// Push an arbitrary notification to the client.
	pub fn notify(&self, method: &str, params: Value) {
		let _ = self.control.send(Control::Notify {
			method: method.to_string(),
			params,
		});
	}

	/// Drop the server's output streams.
	pub fn close(&self) {
		let _ = self.control.send(Control::Close);
	}
}

/// A behaving in-memory app server.
pub struct ScriptedAppServer;

impl ScriptedAppServer {
	/// Start a server task and return the client-side transport plus a handle.
	pub fn spawn(behavior: ScriptedBehavior) -> (Transport, ScriptedHandle) {
		let (client_out, peer_in) = duplex(PIPE_CAPACITY);
		let (peer_out, client_in) = duplex(PIPE_CAPACITY);
		let transport = Transport::from_streams(client_out, client_in);

		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let handle = ScriptedHandle {
			state: Arc::new(Mutex::new(ScriptedState::default())),
			control: control_tx,
		};

		let server = ServerLoop {
			behavior,
			state: Arc::clone(&handle.state),
			out: Some(peer_out),
			awaiting_approval: HashMap::new(),
			approvals: 0,
		};
		tokio::spawn(server.run(BufReader::new(peer_in).lines(), control_rx));
		(transport, handle)
	}
}

struct ServerLoop {
	behavior: ScriptedBehavior,
	state: Arc<Mutex<ScriptedState>>,
	out: Option<DuplexStream>,
	/// approval request id -> (thread id, turn id)
	awaiting_approval: HashMap<String, (String, String)>,
	approvals: usize,
}

impl ServerLoop {
	async fn run(
		mut self,
		mut incoming: Lines<BufReader<DuplexStream>>,
		mut control: mpsc::UnboundedReceiver<Control>,
	) {
		loop {
			tokio::select! {
				line = incoming.next_line() => match line {
					Ok(Some(line)) => {
						if let Ok(value) = serde_json::from_str::<Value>(&line) {
							self.on_frame(ClientFrame::from_value(value)).await;
						}
					}
					_ => break,
				},
				Some(cmd) = control.recv() => match cmd {
					Control::Complete { turn_id, text } => {
						let thread_id = self.take_active(&turn_id);
						if let Some(thread_id) = thread_id {
							self.finish_turn(&thread_id, &turn_id, &text, "completed").await;
						}
					}
					Control::Notify { method, params } => {
						self.emit(json!({ "method": method, "params": params })).await;
					}
					Control::Close => {
						self.out = None;
					}
				},
			}
		}
		debug!("scripted app server exited");
	}

	fn state(&self) -> MutexGuard<'_, ScriptedState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn take_active(&self, turn_id: &str) -> Option<String> {
		let mut state = self.state();
		let idx = state.active_turns.iter().position(|(_, t)| t == turn_id)?;
		Some(state.active_turns.remove(idx).0)
	}

	async fn emit(&mut self, frame: Value) {
		let Some(out) = self.out.as_mut() else {
			return;
		};
		let line = format!("{frame}\n");
		if out.write_all(line.as_bytes()).await.is_err() {
			self.out = None;
		}
	}

	async fn on_frame(&mut self, frame: ClientFrame) {
		if frame.is_response() {
			self.on_response(frame).await;
			return;
		}
		let (Some(id), Some(method)) = (frame.id.clone(), frame.method.clone()) else {
			return;
		};
		self.state().methods.push(method.clone());
		let params = frame.params;

		match method.as_str() {
			METHOD_INITIALIZE => {
				self
					.emit(json!({ "id": id, "result": { "userAgent": "scripted/0.0.0" } }))
					.await
			}
			METHOD_THREAD_START => {
				let thread_id = {
					let mut state = self.state();
					state.threads += 1;
					format!("thread-{}", state.threads)
				};
				self
					.emit(json!({ "id": id, "result": { "thread": { "id": thread_id } } }))
					.await
			}
			METHOD_THREAD_RESUME => {
				let thread_id = params.get("threadId").cloned().unwrap_or(Value::Null);
				self
					.emit(json!({ "id": id, "result": { "thread": { "id": thread_id } } }))
					.await
			}
			METHOD_MODEL_LIST => {
				self
					.emit(json!({
						"id": id,
						"result": { "data": [
							{ "id": "gpt-5-codex", "displayName": "GPT-5 Codex", "isDefault": true },
							{ "id": "gpt-5", "displayName": "GPT-5", "isDefault": false }
						] }
					}))
					.await
			}
			METHOD_TURN_START => self.start_turn(id, &params).await,
			METHOD_TURN_STEER => {
				let turn_id = params.get("expectedTurnId").cloned().unwrap_or(Value::Null);
				self.emit(json!({ "id": id, "result": { "turnId": turn_id } })).await
			}
			METHOD_TURN_INTERRUPT => {
				self.emit(json!({ "id": id, "result": {} })).await;
				let turn_id = params
					.get("turnId")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_string();
				if let Some(thread_id) = self.take_active(&turn_id) {
					self.finish_turn(&thread_id, &turn_id, "", "interrupted").await;
				}
			}
			other => {
				self
					.emit(json!({
						"id": id,
						"error": { "code": -32601, "message": format!("unknown method {other}") }
					}))
					.await
			}
		}
	}

	async fn start_turn(&mut self, id: Value, params: &Value) {
		let thread_id = params
			.get("threadId")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		let turn_id = {
			let mut state = self.state();
			state.turns += 1;
			let turn_id = format!("turn-{}", state.turns);
			state
				.active_turns
				.push((thread_id.clone(), turn_id.clone()));
			turn_id
		};

		self
			.emit(json!({
				"id": id,
				"result": { "turn": { "id": turn_id, "status": "inProgress" } }
			}))
			.await;
		self
			.emit(json!({
				"method": NOTIFY_TURN_STARTED,
				"params": { "threadId": thread_id, "turn": { "id": turn_id, "status": "inProgress" } }
			}))
			.await;

		if self.behavior.request_approval {
			self.approvals += 1;
			let approval_id = format!("approval-{}", self.approvals);
			self
				.awaiting_approval
				.insert(approval_id.clone(), (thread_id.clone(), turn_id.clone()));
			self
				.emit(json!({
					"id": approval_id,
					"method": METHOD_COMMAND_APPROVAL,
					"params": {
						"threadId": thread_id,
						"turnId": turn_id,
						"itemId": "item-1",
						"command": "cargo test",
						"cwd": "/work",
						"reason": "run the test suite"
					}
				}))
				.await;
			return;
		}

		if !self.behavior.hold_turns {
			self.take_active(&turn_id);
			let reply = self.behavior.reply.clone();
			self.finish_turn(&thread_id, &turn_id, &reply, "completed").await;
		}
	}

	async fn on_response(&mut self, frame: ClientFrame) {
		let Some(approval_id) = frame.id.as_ref().and_then(Value::as_str) else {
			return;
		};
		let Some((thread_id, turn_id)) = self.awaiting_approval.remove(approval_id) else {
			return;
		};
		let decision = frame
			.result
			.as_ref()
			.and_then(|r| r.get("decision"))
			.cloned()
			.unwrap_or(Value::Null);
		self.state().approval_decisions.push(decision.clone());

		if self.behavior.hold_turns {
			return;
		}
		self.take_active(&turn_id);
		let text = format!("{} ({})", self.behavior.reply, decision.as_str().unwrap_or("none"));
		self.finish_turn(&thread_id, &turn_id, &text, "completed").await;
	}

	async fn finish_turn(&mut self, thread_id: &str, turn_id: &str, text: &str, status: &str) {
		let delta = json!({
			"method": NOTIFY_AGENT_MESSAGE_DELTA,
			"params": { "threadId": thread_id, "turnId": turn_id, "itemId": "msg-1", "delta": text }
		});
		let completed = json!({
			"method": NOTIFY_TURN_COMPLETED,
			"params": { "threadId": thread_id, "turn": { "id": turn_id, "status": status } }
		});

		let send_delta = !text.is_empty();
		if self.behavior.complete_before_delta {
			self.emit(completed).await;
			if send_delta {
				self.emit(delta).await;
			}
		} else {
			if send_delta {
				self.emit(delta).await;
			}
			self.emit(completed).await;
		}
	}
}

/// Small pause for tests that need the read loop to drain.
pub async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
	tokio::time::sleep(Duration::from_millis(1)).await;
}
