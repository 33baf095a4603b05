// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turn registry and notification router.
//!
//! A turn-scoped notification can arrive before `turn/start` has returned the
//! turn id to us, so there is no tracker to hand it to yet. Such signals are
//! buffered per turn id and replayed, in arrival order, when the tracker is
//! primed. Registration, buffering and replay happen under one lock, so a
//! signal routed concurrently with [`TurnRegistry::prime`] is either part of
//! the replayed buffer or applied strictly after it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::error::TurnError;
use crate::events::{CoreEventKind, CoreEventLevel, EventPublisher};
use crate::protocol::{TurnSignal, TurnStatus};
use crate::turn::TurnTracker;

/// What happened to a routed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
	Delivered,
	Buffered,
	/// The turn already resolved and was retired.
	Discarded,
}

pub struct TurnRegistry {
	state: Mutex<RegistryState>,
	events: EventPublisher,
	max_buffered_turns: usize,
	retired_capacity: usize,
}

#[derive(Default)]
struct RegistryState {
	trackers: HashMap<String, Arc<TurnTracker>>,
	buffered: HashMap<String, Vec<TurnSignal>>,
	buffer_order: VecDeque<String>,
	retired: HashSet<String>,
	retired_order: VecDeque<String>,
}

impl std::fmt::Debug for TurnRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.lock();
		f.debug_struct("TurnRegistry")
			.field("trackers", &state.trackers.len())
			.field("buffered_turns", &state.buffered.len())
			.finish()
	}
}

impl TurnRegistry {
	pub fn new(events: EventPublisher, max_buffered_turns: usize, retired_capacity: usize) -> Self {
		Self {
			state: Mutex::new(RegistryState::default()),
			events,
			max_buffered_turns: max_buffered_turns.max(1),
			retired_capacity,
		}
	}

	/// Deliver a signal to its tracker, or buffer it until one is primed.
	pub fn route(&self, turn_id: &str, signal: TurnSignal) -> RouteOutcome {
		let mut state = self.lock();

		if let Some(tracker) = state.trackers.get(turn_id) {
			tracker.apply(signal);
			return RouteOutcome::Delivered;
		}

		if state.retired.contains(turn_id) {
			trace!(turn_id, "discarding signal for retired turn");
			return RouteOutcome::Discarded;
		}

		if !state.buffered.contains_key(turn_id) {
			while state.buffer_order.len() >= self.max_buffered_turns {
				let Some(evicted) = state.buffer_order.pop_front() else {
					break;
				};
				let dropped = state.buffered.remove(&evicted).map_or(0, |b| b.len());
				self.events.publish(
					CoreEventLevel::Warn,
					CoreEventKind::BufferEvicted,
					format!("evicted {dropped} buffered signal(s) for unclaimed turn {evicted}"),
				);
			}
			state.buffer_order.push_back(turn_id.to_string());
		}
		state
			.buffered
			.entry(turn_id.to_string())
			.or_default()
			.push(signal);
		trace!(turn_id, "buffered signal for unregistered turn");
		RouteOutcome::Buffered
	}

	/// Deliver a signal to every unresolved tracker on a thread. Used for
	/// errors that name a thread but no turn.
	pub fn route_to_thread(&self, thread_id: &str, signal: TurnSignal) -> usize {
		let state = self.lock();
		let mut delivered = 0;
		for tracker in state.trackers.values() {
			if tracker.thread_id() == thread_id && !tracker.is_resolved() {
				tracker.apply(signal.clone());
				delivered += 1;
			}
		}
		delivered
	}

	/// Deliver a signal to every unresolved tracker.
	pub fn route_to_all(&self, signal: TurnSignal) -> usize {
		let state = self.lock();
		let mut delivered = 0;
		for tracker in state.trackers.values() {
			if !tracker.is_resolved() {
				tracker.apply(signal.clone());
				delivered += 1;
			}
		}
		delivered
	}

	/// Register a freshly created tracker and replay anything buffered for its
	/// turn id. Priming the same tracker twice is a no-op; priming a different
	/// tracker under a live turn id is an error. Returns the replay count.
	pub fn prime(&self, tracker: &Arc<TurnTracker>) -> Result<usize, TurnError> {
		let mut state = self.lock();
		let turn_id = tracker.turn_id();

		if let Some(existing) = state.trackers.get(turn_id) {
			if Arc::ptr_eq(existing, tracker) {
				return Ok(0);
			}
			return Err(TurnError::DuplicateTurnId(turn_id.to_string()));
		}
		if !tracker.mark_primed() {
			// Primed before and since removed.
			return Ok(0);
		}

		state.trackers.insert(turn_id.to_string(), Arc::clone(tracker));
		let buffered = state.buffered.remove(turn_id).unwrap_or_default();
		if !buffered.is_empty() {
			state.buffer_order.retain(|id| id != turn_id);
		}
		let replayed = buffered.len();
		for signal in buffered {
			tracker.apply(signal);
		}
		debug!(turn_id, replayed, "primed turn tracker");
		Ok(replayed)
	}

	pub fn get(&self, turn_id: &str) -> Option<Arc<TurnTracker>> {
		self.lock().trackers.get(turn_id).cloned()
	}

	/// The unresolved tracker for a thread, if any.
	pub fn active_for_thread(&self, thread_id: &str) -> Option<Arc<TurnTracker>> {
		self
			.lock()
			.trackers
			.values()
			.find(|t| t.thread_id() == thread_id && !t.is_resolved())
			.cloned()
	}

	/// Drop a tracker and remember its id so late signals are discarded.
	pub fn remove(&self, turn_id: &str) -> Option<Arc<TurnTracker>> {
		let mut state = self.lock();
		let removed = state.trackers.remove(turn_id);
		if removed.is_some() && self.retired_capacity > 0 && state.retired.insert(turn_id.to_string()) {
			state.retired_order.push_back(turn_id.to_string());
			while state.retired_order.len() > self.retired_capacity {
				if let Some(oldest) = state.retired_order.pop_front() {
					state.retired.remove(&oldest);
				}
			}
		}
		removed
	}

	/// Resolve every live tracker with the given status and clear all state.
	/// Returns how many trackers this call resolved.
	pub fn resolve_all(&self, status: TurnStatus, error: &str) -> usize {
		let mut state = self.lock();
		let trackers: Vec<_> = state.trackers.drain().map(|(_, t)| t).collect();
		state.buffered.clear();
		state.buffer_order.clear();
		drop(state);

		trackers
			.iter()
			.filter(|t| t.resolve(status, Some(error.to_string())))
			.count()
	}

	pub fn len(&self) -> usize {
		self.lock().trackers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn buffered_len(&self, turn_id: &str) -> usize {
		self.lock().buffered.get(turn_id).map_or(0, Vec::len)
	}

	fn lock(&self) -> MutexGuard<'_, RegistryState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}
}
