// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the app server client, turn tracking and sessions.

use thiserror::Error;

/// Errors surfaced by the correlation engine.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
	#[error("transport closed before response")]
	TransportClosed,

	#[error("client disposed")]
	Disposed,

	#[error("request cancelled")]
	Cancelled,

	#[error("request timed out: {method}")]
	Timeout { method: String },

	#[error("malformed response to {method}: neither result nor error present")]
	MalformedResponse { method: String },

	#[error("remote error {code}: {message}")]
	Remote { code: i64, message: String },

	#[error("I/O error: {0}")]
	Io(String),

	#[error("serialization error: {0}")]
	Serialization(String),
}

impl ClientError {
	/// True when the connection itself is gone and retrying on it is pointless.
	pub fn is_connection_lost(&self) -> bool {
		matches!(self, ClientError::TransportClosed | ClientError::Disposed)
	}
}

impl From<std::io::Error> for ClientError {
	fn from(err: std::io::Error) -> Self {
		ClientError::Io(err.to_string())
	}
}

impl From<serde_json::Error> for ClientError {
	fn from(err: serde_json::Error) -> Self {
		ClientError::Serialization(err.to_string())
	}
}

/// Errors raised by the turn registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
	#[error("turn {0} is already tracked")]
	DuplicateTurnId(String),
}

/// Errors raised by a session.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("turn input has neither text nor images")]
	EmptyInput,

	#[error("{method} response did not contain a turn id")]
	MissingTurnId { method: String },

	#[error("{method} response did not contain a thread id")]
	MissingThreadId { method: String },

	#[error("no active turn on thread {0}")]
	NoActiveTurn(String),

	#[error("cancelled while waiting for the session")]
	Cancelled,

	#[error(transparent)]
	Client(#[from] ClientError),

	#[error(transparent)]
	Turn(#[from] TurnError),
}

pub type ClientResult<T> = Result<T, ClientError>;
pub type SessionResult<T> = Result<T, SessionError>;
