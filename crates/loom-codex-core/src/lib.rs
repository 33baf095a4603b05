// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Protocol and concurrency core for driving a Codex app server process.
//!
//! This crate provides:
//! - Line-delimited JSON-RPC framing over a primary and a diagnostic stream
//! - Request/response correlation with peer-request dispatch
//! - Turn tracking that tolerates notifications arriving before their turn
//! - Single-flight sessions bound to one thread

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod turn;

pub use client::{AppServerClient, ClientInfo, ModelInfo};
pub use config::{AppServerCommand, ClientConfig};
pub use error::{ClientError, ClientResult, SessionError, SessionResult, TurnError};
pub use events::{CoreEvent, CoreEventKind, CoreEventLevel, EventPublisher};
pub use peer::{DefaultPeerHandler, PeerRequest, PeerRequestHandler, PeerResponse};
pub use protocol::{Notification, TurnSignal, TurnStatus, UserInput};
pub use registry::{RouteOutcome, TurnRegistry};
pub use session::{CodexSession, ThreadOptions, TurnOptions};
pub use transport::Transport;
pub use turn::{ProgressSink, TurnProgress, TurnResult, TurnTracker, TurnWaiter};
