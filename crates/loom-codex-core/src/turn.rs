// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-turn lifecycle tracking.
//!
//! A [`TurnTracker`] aggregates streamed deltas for one turn and resolves a
//! single terminal [`TurnResult`]. Signals are applied synchronously under the
//! tracker's own lock; the only asynchronous piece is the deferred-completion
//! timer that covers a completion racing ahead of the first delta.
//!
//! ```text
//! pending ──delta──▶ streaming ──completed──▶ completed
//!    │                   │
//!    └──────────────────┴──error/abort/timeout──▶ failed | interrupted | timedOut
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::{TurnSignal, TurnStatus};

/// Terminal outcome of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
	pub turn_id: String,
	pub thread_id: String,
	pub status: TurnStatus,
	pub text: String,
	pub error: Option<String>,
}

impl TurnResult {
	pub fn is_success(&self) -> bool {
		self.status == TurnStatus::Completed
	}
}

/// Streamed fragment forwarded to a progress sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnProgress {
	pub turn_id: String,
	pub thread_id: String,
	pub delta: String,
}

pub type ProgressSink = mpsc::UnboundedSender<TurnProgress>;

pub struct TurnTracker {
	turn_id: String,
	thread_id: String,
	grace: Duration,
	progress: Option<ProgressSink>,
	primed: AtomicBool,
	state: Mutex<TrackerState>,
}

struct TrackerState {
	status: TurnStatus,
	text: String,
	last_error: Option<String>,
	deferred: Option<JoinHandle<()>>,
	result_tx: Option<oneshot::Sender<TurnResult>>,
	result: Option<TurnResult>,
}

impl std::fmt::Debug for TurnTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TurnTracker")
			.field("turn_id", &self.turn_id)
			.field("thread_id", &self.thread_id)
			.field("status", &self.status())
			.finish()
	}
}

impl TurnTracker {
	/// Create a tracker and the waiter that receives its terminal result.
	pub fn new(
		turn_id: impl Into<String>,
		thread_id: impl Into<String>,
		grace: Duration,
		progress: Option<ProgressSink>,
	) -> (Arc<Self>, TurnWaiter) {
		let (tx, rx) = oneshot::channel();
		let tracker = Arc::new(Self {
			turn_id: turn_id.into(),
			thread_id: thread_id.into(),
			grace,
			progress,
			primed: AtomicBool::new(false),
			state: Mutex::new(TrackerState {
				status: TurnStatus::Pending,
				text: String::new(),
				last_error: None,
				deferred: None,
				result_tx: Some(tx),
				result: None,
			}),
		});
		let waiter = TurnWaiter {
			turn_id: tracker.turn_id.clone(),
			thread_id: tracker.thread_id.clone(),
			rx,
		};
		(tracker, waiter)
	}

	pub fn turn_id(&self) -> &str {
		&self.turn_id
	}

	pub fn thread_id(&self) -> &str {
		&self.thread_id
	}

	pub fn status(&self) -> TurnStatus {
		self.lock().status
	}

	pub fn text(&self) -> String {
		self.lock().text.clone()
	}

	pub fn is_resolved(&self) -> bool {
		self.lock().result.is_some()
	}

	/// The terminal result, once resolved.
	pub fn result(&self) -> Option<TurnResult> {
		self.lock().result.clone()
	}

	/// Returns true the first time only.
	pub(crate) fn mark_primed(&self) -> bool {
		!self.primed.swap(true, Ordering::SeqCst)
	}

	/// Apply one turn-scoped signal. Signals arriving after resolution are
	/// discarded.
	pub fn apply(self: &Arc<Self>, signal: TurnSignal) {
		let mut state = self.lock();
		if state.result.is_some() {
			trace!(turn_id = %self.turn_id, ?signal, "discarding signal for resolved turn");
			return;
		}

		match signal {
			TurnSignal::Delta(delta) => {
				if delta.is_empty() {
					return;
				}
				state.text.push_str(&delta);
				if state.status == TurnStatus::Pending {
					state.status = TurnStatus::Streaming;
				}
				if let Some(progress) = &self.progress {
					let _ = progress.send(TurnProgress {
						turn_id: self.turn_id.clone(),
						thread_id: self.thread_id.clone(),
						delta,
					});
				}
				if state.deferred.is_some() {
					debug!(turn_id = %self.turn_id, "late delta settled deferred completion");
					self.finish(&mut state, TurnStatus::Completed, None);
				}
			}
			TurnSignal::Completed { status, error } => {
				let notified_error = error.filter(|e| !e.is_empty());
				if status == TurnStatus::Completed
					&& notified_error.is_none()
					&& state.last_error.is_none()
					&& state.text.is_empty()
				{
					if state.deferred.is_none() {
						debug!(
							turn_id = %self.turn_id,
							grace_ms = self.grace.as_millis() as u64,
							"completion arrived before content; deferring"
						);
						state.deferred = Some(self.spawn_deferred());
					}
					return;
				}

				let (status, error) = match status {
					TurnStatus::Completed if notified_error.is_some() => {
						(TurnStatus::Failed, notified_error)
					}
					TurnStatus::Completed if state.text.is_empty() => {
						(TurnStatus::Failed, state.last_error.clone())
					}
					TurnStatus::Completed => (TurnStatus::Completed, None),
					// A non-terminal status on a completion frame is a protocol oddity;
					// treat it as a failure rather than leaving the turn open.
					TurnStatus::Pending | TurnStatus::Streaming => (
						TurnStatus::Failed,
						notified_error.or_else(|| state.last_error.clone()),
					),
					other => (other, notified_error.or_else(|| state.last_error.clone())),
				};
				self.finish(&mut state, status, error);
			}
			TurnSignal::Error {
				message,
				will_retry,
			} => {
				state.last_error = Some(message.clone());
				if will_retry == Some(false) {
					debug!(turn_id = %self.turn_id, error = %message, "peer gave up; failing turn");
					self.finish(&mut state, TurnStatus::Failed, Some(message));
				}
			}
		}
	}

	/// Force a terminal state. Returns false if the turn was already resolved.
	pub fn resolve(&self, status: TurnStatus, error: Option<String>) -> bool {
		let mut state = self.lock();
		if state.result.is_some() {
			return false;
		}
		self.finish(&mut state, status, error);
		true
	}

	fn spawn_deferred(self: &Arc<Self>) -> JoinHandle<()> {
		let tracker = Arc::clone(self);
		let grace = self.grace;
		tokio::spawn(async move {
			tokio::time::sleep(grace).await;
			tracker.settle_deferred();
		})
	}

	fn settle_deferred(&self) {
		let mut state = self.lock();
		if state.result.is_some() || state.deferred.is_none() {
			return;
		}
		// Drop our own handle without aborting the running task.
		state.deferred = None;
		let (status, error) = match state.last_error.clone() {
			Some(error) if state.text.is_empty() => (TurnStatus::Failed, Some(error)),
			_ => (TurnStatus::Completed, None),
		};
		debug!(turn_id = %self.turn_id, %status, "grace window elapsed");
		self.finish(&mut state, status, error);
	}

	fn finish(&self, state: &mut TrackerState, status: TurnStatus, error: Option<String>) {
		if let Some(handle) = state.deferred.take() {
			handle.abort();
		}
		state.status = status;
		let result = TurnResult {
			turn_id: self.turn_id.clone(),
			thread_id: self.thread_id.clone(),
			status,
			text: state.text.clone(),
			error,
		};
		debug!(
			turn_id = %self.turn_id,
			%status,
			text_len = result.text.len(),
			error = ?result.error,
			"turn resolved"
		);
		state.result = Some(result.clone());
		if let Some(tx) = state.result_tx.take() {
			let _ = tx.send(result);
		}
	}

	fn lock(&self) -> MutexGuard<'_, TrackerState> {
		// Signal application never panics while holding the lock, but recover the
		// state rather than propagate poison.
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}
}

/// Resolves to the tracker's terminal result.
#[derive(Debug)]
pub struct TurnWaiter {
	turn_id: String,
	thread_id: String,
	rx: oneshot::Receiver<TurnResult>,
}

impl TurnWaiter {
	pub fn turn_id(&self) -> &str {
		&self.turn_id
	}
}

impl Future for TurnWaiter {
	type Output = TurnResult;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = &mut *self;
		Pin::new(&mut this.rx).poll(cx).map(|r| {
			r.unwrap_or_else(|_| TurnResult {
				turn_id: this.turn_id.clone(),
				thread_id: this.thread_id.clone(),
				status: TurnStatus::Failed,
				text: String::new(),
				error: Some("turn tracker dropped".to_string()),
			})
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	const GRACE: Duration = Duration::from_millis(50);

	fn completed() -> TurnSignal {
		TurnSignal::Completed {
			status: TurnStatus::Completed,
			error: None,
		}
	}

	fn delta(text: &str) -> TurnSignal {
		TurnSignal::Delta(text.to_string())
	}

	#[tokio::test]
	async fn deltas_aggregate_and_completion_resolves() {
		let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, Some(progress_tx));

		tracker.apply(delta("Hello, "));
		assert_eq!(tracker.status(), TurnStatus::Streaming);
		tracker.apply(delta("world"));
		tracker.apply(completed());

		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Completed);
		assert_eq!(result.text, "Hello, world");
		assert_eq!(result.error, None);
		assert_eq!(progress_rx.recv().await.unwrap().delta, "Hello, ");
		assert_eq!(progress_rx.recv().await.unwrap().delta, "world");
	}

	#[tokio::test(start_paused = true)]
	async fn empty_completion_waits_for_late_delta() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);

		tracker.apply(completed());
		assert!(!tracker.is_resolved());

		tokio::time::sleep(Duration::from_millis(10)).await;
		tracker.apply(delta("late"));

		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Completed);
		assert_eq!(result.text, "late");
	}

	#[tokio::test(start_paused = true)]
	async fn empty_completion_resolves_after_grace() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);

		tracker.apply(completed());
		tokio::time::sleep(GRACE / 2).await;
		assert!(!tracker.is_resolved());

		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Completed);
		assert!(result.text.is_empty());
		assert!(result.error.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_completion_during_grace_keeps_single_timer() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(completed());
		tracker.apply(completed());
		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Completed);
	}

	#[tokio::test]
	async fn explicit_failure_resolves_immediately() {
		let (tracker, _waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(TurnSignal::Completed {
			status: TurnStatus::Failed,
			error: Some("model overloaded".to_string()),
		});
		let result = tracker.result().unwrap();
		assert_eq!(result.status, TurnStatus::Failed);
		assert_eq!(result.error.as_deref(), Some("model overloaded"));
	}

	#[tokio::test]
	async fn final_error_without_completion_fails_turn() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(TurnSignal::Error {
			message: "retrying".to_string(),
			will_retry: Some(true),
		});
		assert!(!tracker.is_resolved());
		tracker.apply(TurnSignal::Error {
			message: "gave up".to_string(),
			will_retry: Some(false),
		});
		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Failed);
		assert_eq!(result.error.as_deref(), Some("gave up"));
	}

	#[tokio::test]
	async fn recorded_error_fails_empty_completion() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(TurnSignal::Error {
			message: "stream disconnected".to_string(),
			will_retry: None,
		});
		tracker.apply(completed());
		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Failed);
		assert_eq!(result.error.as_deref(), Some("stream disconnected"));
	}

	#[tokio::test]
	async fn retried_error_is_dropped_once_content_arrives() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(TurnSignal::Error {
			message: "reconnecting".to_string(),
			will_retry: Some(true),
		});
		tracker.apply(delta("answer"));
		tracker.apply(completed());
		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Completed);
		assert_eq!(result.error, None);
	}

	#[tokio::test]
	async fn signals_after_resolution_are_ignored() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", GRACE, None);
		tracker.apply(delta("a"));
		tracker.apply(completed());
		tracker.apply(delta("b"));
		tracker.apply(TurnSignal::Completed {
			status: TurnStatus::Failed,
			error: Some("late".to_string()),
		});
		assert!(!tracker.resolve(TurnStatus::Interrupted, None));

		let result = waiter.await;
		assert_eq!(result.text, "a");
		assert_eq!(result.status, TurnStatus::Completed);
		assert_eq!(tracker.text(), "a");
	}

	#[tokio::test]
	async fn forced_resolution_cancels_deferred_timer() {
		let (tracker, waiter) = TurnTracker::new("t1", "thr", Duration::from_secs(60), None);
		tracker.apply(completed());
		assert!(tracker.resolve(TurnStatus::Interrupted, Some("disposed".to_string())));
		let result = waiter.await;
		assert_eq!(result.status, TurnStatus::Interrupted);
	}

	fn arb_signal() -> impl Strategy<Value = TurnSignal> {
		prop_oneof![
			"[a-z]{0,4}".prop_map(TurnSignal::Delta),
			prop_oneof![
				Just(TurnStatus::Completed),
				Just(TurnStatus::Failed),
				Just(TurnStatus::Interrupted),
			]
			.prop_flat_map(|status| {
				proptest::option::of("[a-z]{1,6}")
					.prop_map(move |error| TurnSignal::Completed { status, error })
			}),
			("[a-z]{1,6}", proptest::option::of(any::<bool>())).prop_map(|(message, will_retry)| {
				TurnSignal::Error {
					message,
					will_retry,
				}
			}),
		]
	}

	proptest! {
		/// **Property: a turn delivers its terminal result at most once**
		///
		/// Whatever mix of deltas, completions and errors arrives, the waiter
		/// observes exactly one result once the grace window has elapsed, and
		/// that result never changes afterwards.
		#[test]
		fn terminal_result_is_delivered_once(signals in prop::collection::vec(arb_signal(), 0..16)) {
			let rt = tokio::runtime::Builder::new_current_thread()
				.enable_time()
				.start_paused(true)
				.build()
				.unwrap();
			rt.block_on(async {
				let (tracker, waiter) = TurnTracker::new("t", "thr", GRACE, None);
				for signal in signals {
					tracker.apply(signal);
				}
				tokio::time::sleep(GRACE * 2).await;
				let first = tracker.result();
				// Force a resolution attempt; it must be rejected if already resolved.
				let forced = tracker.resolve(TurnStatus::TimedOut, None);
				prop_assert_eq!(forced, first.is_none());
				let delivered = waiter.await;
				prop_assert_eq!(Some(delivered.clone()), tracker.result());
				if let Some(first) = first {
					prop_assert_eq!(first, delivered);
				}
				Ok::<(), TestCaseError>(())
			})?;
		}
	}
}
