// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Runs many Codex sessions side by side.
//!
//! This crate provides:
//! - A per-session turn gate that admits one turn at a time and heals itself
//! - Approval bridging from peer requests to externally supplied decisions
//! - Turn recovery from raw traffic when a turn was started elsewhere
//! - A broadcast seam for observers

pub mod approval;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gate;
pub mod launcher;
pub mod orchestrator;
pub mod recovery;

pub use approval::{ApprovalBridge, ApprovalDecision, ApprovalKind, ApprovalRegistry, PendingApproval};
pub use broadcast::{BroadcastEvent, BroadcastSink, ChannelSink, NullSink};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use gate::{AcquireError, GateSnapshot, GateTicket, TurnGate};
pub use launcher::{ClientLauncher, ProcessLauncher};
pub use orchestrator::{
	CompletionStatus, CreateSessionRequest, Orchestrator, QueueTurnRequest, SessionInfo,
	TurnCompletion,
};
pub use recovery::RecoveredSignal;
