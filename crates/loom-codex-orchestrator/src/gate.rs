// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-session turn gate.
//!
//! A capacity-1 semaphore paired with a small state block (`held`,
//! `in_flight`, recovered turn, recently settled turns). The state is only
//! changed under its mutex together with the permit, so "held" and
//! "in flight" never disagree with the semaphore except in the stuck state
//! that [`TurnGate::try_acquire`] repairs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turn ids remembered after they settle, so lagging recovery signals for
/// them are ignored.
const SETTLED_MEMORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
	TimedOut,
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
	pub held: bool,
	pub in_flight: bool,
	pub available: usize,
	pub active_turn: Option<String>,
	pub recovered_turn: Option<String>,
	pub heals: u64,
}

#[derive(Debug, Default)]
struct GateState {
	held: bool,
	in_flight: bool,
	active_turn: Option<String>,
	recovered_turn: Option<String>,
	settled: VecDeque<String>,
	heals: u64,
}

impl GateState {
	fn settle(&mut self, turn_id: &str) {
		if self.settled.iter().any(|t| t == turn_id) {
			return;
		}
		self.settled.push_back(turn_id.to_string());
		while self.settled.len() > SETTLED_MEMORY {
			self.settled.pop_front();
		}
	}

	fn is_settled(&self, turn_id: &str) -> bool {
		self.settled.iter().any(|t| t == turn_id)
	}
}

#[derive(Debug)]
pub struct TurnGate {
	permits: Semaphore,
	state: Mutex<GateState>,
	released: Notify,
}

impl Default for TurnGate {
	fn default() -> Self {
		Self::new()
	}
}

impl TurnGate {
	pub fn new() -> Self {
		Self {
			permits: Semaphore::new(1),
			state: Mutex::new(GateState::default()),
			released: Notify::new(),
		}
	}

	#[cfg(test)]
	pub(crate) fn permits_for_test(&self) -> &Semaphore {
		&self.permits
	}

	fn lock(&self) -> MutexGuard<'_, GateState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn snapshot(&self) -> GateSnapshot {
		let state = self.lock();
		GateSnapshot {
			held: state.held,
			in_flight: state.in_flight,
			available: self.permits.available_permits(),
			active_turn: state.active_turn.clone(),
			recovered_turn: state.recovered_turn.clone(),
			heals: state.heals,
		}
	}

	/// Take the gate if it is free. A gate that is neither held nor in flight
	/// but has no capacity lost a release somewhere; one unit is restored
	/// before trying.
	pub fn try_acquire(self: &Arc<Self>) -> Option<GateTicket> {
		let mut state = self.lock();
		if state.in_flight || state.held {
			return None;
		}
		if self.permits.available_permits() == 0 {
			state.heals += 1;
			warn!(heals = state.heals, "turn gate stuck with no capacity; releasing one unit");
			self.permits.add_permits(1);
		}
		let permit = self.permits.try_acquire().ok()?;
		permit.forget();
		state.held = true;
		state.in_flight = true;
		Some(GateTicket {
			gate: Arc::clone(self),
			released: false,
		})
	}

	/// Wait for the gate, re-checking at `poll` and whenever it is released,
	/// for at most `timeout`.
	pub async fn acquire(
		self: &Arc<Self>,
		timeout: Duration,
		poll: Duration,
		cancel: &CancellationToken,
	) -> Result<GateTicket, AcquireError> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let released = self.released.notified();
			tokio::pin!(released);
			released.as_mut().enable();

			if let Some(ticket) = self.try_acquire() {
				return Ok(ticket);
			}
			let now = tokio::time::Instant::now();
			if now >= deadline {
				return Err(AcquireError::TimedOut);
			}
			let nap = poll.min(deadline - now);
			tokio::select! {
				_ = &mut released => {}
				_ = tokio::time::sleep(nap) => {}
				_ = cancel.cancelled() => return Err(AcquireError::Cancelled),
			}
		}
	}

	fn release(&self, turn_id: Option<&str>) {
		{
			let mut state = self.lock();
			if !state.held {
				return;
			}
			state.held = false;
			state.in_flight = false;
			state.active_turn = None;
			if let Some(turn_id) = turn_id {
				state.settle(turn_id);
				// A recovered start for our own turn is not a second turn.
				if state.recovered_turn.as_deref() == Some(turn_id) {
					state.recovered_turn = None;
				}
			}
			if state.recovered_turn.is_some() {
				state.in_flight = true;
			}
			self.permits.add_permits(1);
		}
		self.released.notify_waiters();
	}

	/// An externally observed turn start. Marks the gate in flight without
	/// holding it, unless the turn is already known. Returns whether the
	/// signal changed anything.
	pub fn mark_recovered_started(&self, turn_id: &str) -> bool {
		let mut state = self.lock();
		if state.is_settled(turn_id)
			|| state.held
			|| state.active_turn.as_deref() == Some(turn_id)
			|| state.recovered_turn.as_deref() == Some(turn_id)
		{
			return false;
		}
		debug!(turn_id, "recovered turn start");
		state.in_flight = true;
		state.recovered_turn = Some(turn_id.to_string());
		true
	}

	/// An externally observed turn completion. Clears a matching recovered
	/// in-flight mark. Returns whether the mark was cleared.
	pub fn mark_recovered_completed(&self, turn_id: &str) -> bool {
		let cleared = {
			let mut state = self.lock();
			state.settle(turn_id);
			if state.recovered_turn.as_deref() != Some(turn_id) {
				return false;
			}
			state.recovered_turn = None;
			if !state.held {
				state.in_flight = false;
			}
			debug!(turn_id, "recovered turn completion");
			true
		};
		self.released.notify_waiters();
		cleared
	}

	/// Drop any recovered in-flight mark. Used when a turn is interrupted
	/// locally and no completion signal will follow.
	pub fn clear_recovered(&self) -> bool {
		let cleared = {
			let mut state = self.lock();
			let Some(turn_id) = state.recovered_turn.take() else {
				return false;
			};
			state.settle(&turn_id);
			if !state.held {
				state.in_flight = false;
			}
			true
		};
		self.released.notify_waiters();
		cleared
	}
}

/// Proof of gate ownership. Dropping it releases the gate exactly once.
#[derive(Debug)]
pub struct GateTicket {
	gate: Arc<TurnGate>,
	released: bool,
}

impl GateTicket {
	/// Record the turn id the holder started.
	pub fn bind_turn(&self, turn_id: &str) {
		let mut state = self.gate.lock();
		state.active_turn = Some(turn_id.to_string());
		if state.recovered_turn.as_deref() == Some(turn_id) {
			state.recovered_turn = None;
		}
	}

	pub fn release(mut self) {
		self.release_once();
	}

	fn release_once(&mut self) {
		if self.released {
			return;
		}
		self.released = true;
		let turn_id = self.gate.lock().active_turn.clone();
		self.gate.release(turn_id.as_deref());
	}
}

impl Drop for GateTicket {
	fn drop(&mut self) {
		self.release_once();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gate() -> Arc<TurnGate> {
		Arc::new(TurnGate::new())
	}

	#[test]
	fn acquire_and_release_are_balanced() {
		let gate = gate();
		let ticket = gate.try_acquire().unwrap();
		assert!(gate.try_acquire().is_none());
		let snap = gate.snapshot();
		assert!(snap.held && snap.in_flight);
		assert_eq!(snap.available, 0);

		drop(ticket);
		let snap = gate.snapshot();
		assert!(!snap.held && !snap.in_flight);
		assert_eq!(snap.available, 1);
	}

	#[test]
	fn explicit_release_then_drop_releases_once() {
		let gate = gate();
		let ticket = gate.try_acquire().unwrap();
		ticket.release();
		assert_eq!(gate.snapshot().available, 1);
		let again = gate.try_acquire().unwrap();
		drop(again);
		assert_eq!(gate.snapshot().available, 1);
	}

	#[test]
	fn stuck_gate_heals_one_unit() {
		let gate = gate();
		// Lose a permit without going through a ticket.
		gate.permits.try_acquire().unwrap().forget();
		assert_eq!(gate.snapshot().available, 0);

		let ticket = gate.try_acquire().expect("healed acquisition");
		let snap = gate.snapshot();
		assert_eq!(snap.heals, 1);
		assert!(snap.held);
		drop(ticket);
		assert_eq!(gate.snapshot().available, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn acquire_times_out_without_starting() {
		let gate = gate();
		let _held = gate.try_acquire().unwrap();
		let started = tokio::time::Instant::now();
		let result = gate
			.acquire(
				Duration::from_secs(1),
				Duration::from_millis(250),
				&CancellationToken::new(),
			)
			.await;
		assert_eq!(result.unwrap_err(), AcquireError::TimedOut);
		assert!(started.elapsed() >= Duration::from_secs(1));
	}

	#[tokio::test(start_paused = true)]
	async fn waiter_wakes_on_release() {
		let gate = gate();
		let held = gate.try_acquire().unwrap();
		let waiter = {
			let gate = Arc::clone(&gate);
			tokio::spawn(async move {
				gate
					.acquire(
						Duration::from_secs(60),
						Duration::from_secs(30),
						&CancellationToken::new(),
					)
					.await
					.map(|t| t.release())
			})
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		drop(held);
		assert!(waiter.await.unwrap().is_ok());
		assert_eq!(gate.snapshot().available, 1);
	}

	#[tokio::test]
	async fn acquire_observes_cancellation() {
		let gate = gate();
		let _held = gate.try_acquire().unwrap();
		let cancel = CancellationToken::new();
		cancel.cancel();
		let result = gate
			.acquire(Duration::from_secs(5), Duration::from_millis(50), &cancel)
			.await;
		assert_eq!(result.unwrap_err(), AcquireError::Cancelled);
	}

	#[test]
	fn recovered_start_blocks_without_holding() {
		let gate = gate();
		assert!(gate.mark_recovered_started("ext-1"));
		let snap = gate.snapshot();
		assert!(snap.in_flight);
		assert!(!snap.held);
		assert_eq!(snap.available, 1);
		assert!(gate.try_acquire().is_none());

		// Duplicate start is suppressed.
		assert!(!gate.mark_recovered_started("ext-1"));
		assert!(!gate.mark_recovered_completed("other"));
		assert!(gate.try_acquire().is_none());

		assert!(gate.mark_recovered_completed("ext-1"));
		let ticket = gate.try_acquire().unwrap();
		assert_eq!(gate.snapshot().heals, 0);
		drop(ticket);
	}

	#[test]
	fn recovered_start_for_own_turn_is_suppressed() {
		let gate = gate();
		let ticket = gate.try_acquire().unwrap();
		ticket.bind_turn("t1");
		assert!(!gate.mark_recovered_started("t1"));
		drop(ticket);

		// A lagging start for a turn that already finished is ignored.
		assert!(!gate.mark_recovered_started("t1"));
		assert!(!gate.snapshot().in_flight);
	}

	#[test]
	fn clear_recovered_unblocks() {
		let gate = gate();
		gate.mark_recovered_started("ext");
		assert!(gate.clear_recovered());
		assert!(!gate.snapshot().in_flight);
		assert!(gate.try_acquire().is_some());
	}
}
