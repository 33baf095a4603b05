// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! `loom-codex`: drive a Codex app server from the terminal.

mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use loom_codex_orchestrator::broadcast::{
	EVENT_APPROVAL_REQUESTED, EVENT_CORE, EVENT_SESSION_STOPPED, EVENT_TURN_COMPLETED,
	EVENT_TURN_PROGRESS,
};
use loom_codex_orchestrator::{
	ApprovalDecision, BroadcastEvent, ChannelSink, CompletionStatus, Orchestrator, ProcessLauncher,
	QueueTurnRequest, TurnCompletion,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{CliOverrides, CodexCliConfig};

const RENDER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "loom-codex", version, about = "Drive a Codex app server from the terminal")]
struct Args {
	/// Config file (default: $XDG_CONFIG_HOME/loom/codex.toml)
	#[arg(long, global = true, env = "LOOM_CODEX_CONFIG")]
	config: Option<PathBuf>,

	/// Path to the codex executable
	#[arg(long, global = true, env = "LOOM_CODEX_BIN")]
	codex_bin: Option<String>,

	#[arg(long, global = true, env = "LOOM_CODEX_MODEL")]
	model: Option<String>,

	/// Working directory for the thread
	#[arg(long, global = true)]
	cwd: Option<PathBuf>,

	#[arg(long, global = true)]
	effort: Option<String>,

	/// How approval requests from the agent are answered
	#[arg(long, global = true, value_enum, default_value_t = ApprovalPolicy::Decline)]
	approval_policy: ApprovalPolicy,

	/// Emit logs as JSON
	#[arg(long, global = true)]
	log_json: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run one prompt and print the reply
	Run {
		prompt: String,
		/// Attach an image (URL or local path)
		#[arg(long = "image")]
		images: Vec<String>,
		/// Resume this thread instead of starting a new one
		#[arg(long)]
		thread: Option<String>,
	},
	/// Interactive prompt loop
	Repl {
		#[arg(long)]
		thread: Option<String>,
	},
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ApprovalPolicy {
	Accept,
	Decline,
	/// Prompt on the terminal
	Ask,
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr);
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_tracing(args.log_json);

	let overrides = CliOverrides {
		codex_bin: args.codex_bin.clone(),
		model: args.model.clone(),
		cwd: args.cwd.clone(),
		reasoning_effort: args.effort.clone(),
	};
	let config = CodexCliConfig::load(args.config.as_deref(), &overrides)
		.context("failed to load configuration")?;

	let (sink, events) = ChannelSink::channel();
	let orch = Arc::new(Orchestrator::new(
		config.orchestrator.clone(),
		Arc::new(ProcessLauncher::new(config.app_server.clone())),
		Arc::new(sink),
	));

	let thread = match &args.command {
		Command::Run { thread, .. } | Command::Repl { thread } => thread.clone(),
	};
	let session = match thread {
		Some(thread_id) => orch.attach_session(&thread_id, config.session_request()).await,
		None => orch.create_session(config.session_request()).await,
	}
	.context("failed to open a Codex session")?;
	tracing::info!(session_id = %session.session_id, thread_id = %session.thread_id, "session ready");

	let app = App {
		orch: Arc::clone(&orch),
		session_id: session.session_id.clone(),
		policy: args.approval_policy,
	};
	let renderer = tokio::spawn(render_events(events, app.clone()));

	let outcome = match args.command {
		Command::Run { prompt, images, .. } => app.run(prompt, images).await,
		Command::Repl { .. } => app.repl().await,
	};

	// Shutdown publishes session_stopped, which ends the renderer once it has
	// printed everything queued before it.
	orch.shutdown().await;
	if tokio::time::timeout(RENDER_DRAIN, renderer).await.is_err() {
		tracing::warn!("event renderer did not finish after shutdown");
	}
	outcome
}

#[derive(Clone)]
struct App {
	orch: Arc<Orchestrator>,
	session_id: String,
	policy: ApprovalPolicy,
}

impl App {
	fn queue(&self, request: QueueTurnRequest) -> JoinHandle<anyhow::Result<TurnCompletion>> {
		let orch = Arc::clone(&self.orch);
		let session_id = self.session_id.clone();
		tokio::spawn(async move { Ok(orch.queue_turn(&session_id, request, None).await?) })
	}

	async fn run(&self, prompt: String, images: Vec<String>) -> anyhow::Result<()> {
		let mut turn = self.queue(QueueTurnRequest {
			text: prompt,
			images,
			..Default::default()
		});
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		let mut stdin_open = self.policy == ApprovalPolicy::Ask;

		let completion = loop {
			tokio::select! {
				joined = &mut turn => break joined.context("turn task failed")??,
				_ = tokio::signal::ctrl_c() => {
					eprintln!("\ninterrupting...");
					self.interrupt().await;
				}
				line = lines.next_line(), if stdin_open => match line? {
					Some(line) => self.answer_approval(line.trim()),
					None => stdin_open = false,
				},
			}
		};

		match completion.status {
			CompletionStatus::Completed => Ok(()),
			status => bail!(
				"turn ended {status}{}",
				completion
					.error
					.map(|e| format!(": {e}"))
					.unwrap_or_default()
			),
		}
	}

	async fn repl(&self) -> anyhow::Result<()> {
		eprintln!("session {} ready; /interrupt, /models, /quit", self.session_id);
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		let mut turns: Vec<JoinHandle<anyhow::Result<TurnCompletion>>> = Vec::new();

		loop {
			let line = tokio::select! {
				line = lines.next_line() => line?,
				_ = tokio::signal::ctrl_c() => {
					self.interrupt().await;
					continue;
				}
			};
			let Some(line) = line else { break };
			let line = line.trim();
			turns.retain(|t| !t.is_finished());

			match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
				("", _) => {}
				("/quit" | "/exit", _) => break,
				("/interrupt", _) => self.interrupt().await,
				("/models", _) => match self.orch.list_models(&self.session_id).await {
					Ok(models) => {
						for model in models {
							let marker = if model.is_default { "*" } else { " " };
							println!(
								"{marker} {} {}",
								model.id,
								model.display_name.as_deref().unwrap_or_default()
							);
						}
					}
					Err(e) => eprintln!("failed to list models: {e}"),
				},
				("/steer", text) => {
					if let Err(e) = self.orch.steer_turn(&self.session_id, text).await {
						eprintln!("steer failed: {e}");
					}
				}
				("/approve", decision) => self.answer_approval(if decision.is_empty() {
					"accept"
				} else {
					decision
				}),
				(command, _) if command.starts_with('/') => eprintln!("unknown command {command}"),
				_ if self.awaiting_approval() && line.parse::<ApprovalDecision>().is_ok() => {
					self.answer_approval(line)
				}
				_ => turns.push(self.queue(QueueTurnRequest::text(line))),
			}
		}

		for turn in turns.drain(..) {
			turn.abort();
		}
		Ok(())
	}

	async fn interrupt(&self) {
		let wait = self.orch.config().client.interrupt_wait;
		match self.orch.interrupt_turn(&self.session_id, Some(wait)).await {
			Ok(true) => {}
			Ok(false) => eprintln!("nothing to interrupt"),
			Err(e) => eprintln!("interrupt failed: {e}"),
		}
	}

	fn awaiting_approval(&self) -> bool {
		self
			.orch
			.pending_approvals(&self.session_id)
			.is_ok_and(|pending| !pending.is_empty())
	}

	/// Apply `decision` to the oldest pending approval.
	fn answer_approval(&self, decision: &str) {
		let decision = match decision.parse::<ApprovalDecision>() {
			Ok(decision) => decision,
			Err(e) => {
				eprintln!("{e}");
				return;
			}
		};
		match self.orch.pending_approvals(&self.session_id) {
			Ok(pending) => match pending.first() {
				Some(approval) => {
					let _ = self
						.orch
						.resolve_approval(&self.session_id, &approval.approval_id, decision);
				}
				None => eprintln!("no pending approval"),
			},
			Err(e) => eprintln!("{e}"),
		}
	}
}

async fn render_events(mut events: mpsc::UnboundedReceiver<BroadcastEvent>, app: App) {
	while let Some(event) = events.recv().await {
		match event.name.as_str() {
			EVENT_TURN_PROGRESS => {
				if let Some(delta) = event.payload["delta"].as_str() {
					print!("{delta}");
					let _ = std::io::stdout().flush();
				}
			}
			EVENT_TURN_COMPLETED => {
				println!();
				let status = event.payload["status"].as_str().unwrap_or_default();
				if status != CompletionStatus::Completed.as_str() {
					eprintln!("[turn {status}]");
				}
			}
			EVENT_APPROVAL_REQUESTED => {
				let approval = &event.payload["approval"];
				let summary = approval["summary"].as_str().unwrap_or("approval requested");
				let decision = match app.policy {
					ApprovalPolicy::Accept => Some(ApprovalDecision::Accept),
					ApprovalPolicy::Decline => Some(ApprovalDecision::Decline),
					ApprovalPolicy::Ask => None,
				};
				match (decision, approval["approvalId"].as_str()) {
					(Some(decision), Some(approval_id)) => {
						eprintln!("[{summary}: {decision}]");
						let _ = app.orch.resolve_approval(&app.session_id, approval_id, decision);
					}
					(None, _) => {
						eprintln!("[{summary}] answer accept, acceptForSession, decline or cancel")
					}
					(Some(_), None) => tracing::warn!(payload = %approval, "approval without an id"),
				}
			}
			EVENT_SESSION_STOPPED => break,
			EVENT_CORE => tracing::trace!(payload = %event.payload, "core event"),
			_ => {}
		}
	}
}
