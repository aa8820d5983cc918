//! The iteration loop.
//!
//! Each iteration checks the token budget, takes a periodic checkpoint when
//! due, streams one model turn, appends it and dispatches its tool calls. A
//! turn without tool calls ends the run. Model failures cost one iteration
//! and nothing else; cancellation and panics end in an emergency checkpoint.

use futures::FutureExt;
use quill_config::AppConfig;
use quill_core::error::ProviderError;
use quill_core::event::{DomainEvent, EventBus};
use quill_core::provider::{Provider, ProviderRequest, ToolChoice};
use quill_core::tool::ToolRegistry;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetMonitor;
use crate::compressor::{CompressionOutcome, ContextCompressor};
use crate::dispatcher::{DispatchOutcome, ToolDispatcher};
use crate::persistence::{BackupManager, Checkpoint, EmergencyOutcome};
use crate::prompt::compress_context_definition;
use crate::session::Session;
use crate::shutdown::ShutdownSignal;
use crate::stream_event::{AgentStreamEvent, StreamObserver};
use crate::streaming::{AssembledMessage, StreamAssembler};

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The model answered without requesting tools.
    Completed,
    /// The iteration cap was hit. `checkpoint` is the final snapshot, if it
    /// could be written.
    MaxIterationsReached { checkpoint: Option<Checkpoint> },
    /// Cancelled or crashed; the emergency path ran.
    Aborted {
        reason: String,
        emergency: EmergencyOutcome,
    },
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Iterations started
    pub iterations: u32,
    pub session: Session,
}

enum Step {
    Continue,
    Completed,
    Cancelled,
}

pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    temperature: f32,
    max_tokens: u32,
    max_iterations: u32,
    keep_recent: usize,
    backup_interval: u32,
    compressor: ContextCompressor,
    budget: BudgetMonitor,
    backups: BackupManager,
    event_bus: Arc<EventBus>,
    observer: StreamObserver,
    shutdown: ShutdownSignal,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, config: &AppConfig) -> Self {
        let compressor = ContextCompressor::new(
            provider.clone(),
            &config.model,
            config.context.summary_max_tokens,
            config.context.summary_timeout(),
        );
        let budget = BudgetMonitor::new(provider.clone(), &config.model, &config.context);
        Self {
            provider,
            tools,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_iterations: config.agent.max_iterations,
            keep_recent: config.context.keep_recent,
            backup_interval: config.backup.interval.max(1),
            compressor,
            budget,
            backups: BackupManager::new(&config.backup.dir, config.backup.keep_last),
            event_bus: Arc::new(EventBus::default()),
            observer: StreamObserver::none(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_observer(mut self, observer: StreamObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Drive `session` to completion, the iteration cap, or an abort.
    pub async fn run(&self, mut session: Session) -> RunReport {
        info!(
            model = %session.model,
            max_iterations = self.max_iterations,
            recovered = session.recovered_from.is_some(),
            "Starting run"
        );

        loop {
            if self.shutdown.is_triggered() {
                return self.abort(session, "interrupted".into()).await;
            }
            if session.iteration >= self.max_iterations {
                return self.finish_at_cap(session).await;
            }

            session.iteration += 1;
            let iteration = session.iteration;
            self.event_bus.publish(DomainEvent::IterationStarted {
                iteration,
                max_iterations: self.max_iterations,
                messages: session.messages.len(),
            });

            let step = AssertUnwindSafe(self.iterate(&mut session))
                .catch_unwind()
                .await;

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Completed) => {
                    info!(iterations = iteration, "Task completed");
                    return RunReport {
                        outcome: RunOutcome::Completed,
                        iterations: iteration,
                        session,
                    };
                }
                Ok(Step::Cancelled) => {
                    return self.abort(session, "interrupted".into()).await;
                }
                Err(payload) => {
                    let reason = format!(
                        "iteration {iteration} panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    error!(iteration, reason = %reason, "Unrecoverable loop failure");
                    self.event_bus.publish(DomainEvent::ErrorOccurred {
                        context: "agent loop".into(),
                        error_message: reason.clone(),
                        timestamp: chrono::Utc::now(),
                    });
                    return self.abort(session, reason).await;
                }
            }
        }
    }

    async fn iterate(&self, session: &mut Session) -> Step {
        let iteration = session.iteration;
        debug!(iteration, messages = session.messages.len(), "Iteration");

        let artifact_dir = session.project.artifact_dir();
        let check = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Step::Cancelled,
            check = self.budget.check(&session.messages, &self.compressor, &artifact_dir) => check,
        };
        self.event_bus.publish(DomainEvent::TokensEstimated {
            tokens: check.tokens,
            limit: self.budget.limit(),
            threshold: self.budget.threshold(),
        });
        if let Some(outcome) = check.compression {
            self.publish_compression(session.messages.len(), &outcome);
            session.messages = outcome.into_history();
        }

        if iteration % self.backup_interval == 0 {
            self.periodic_checkpoint(session).await;
        }

        let request = self.request(session);
        let turn = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Step::Cancelled,
            turn = self.stream_turn(request) => turn,
        };

        let assembled = match turn {
            Ok(assembled) => assembled,
            Err(e) => {
                warn!(iteration, error = %e, "Model call failed, continuing");
                self.observer.emit(AgentStreamEvent::Error {
                    message: e.to_string(),
                });
                self.event_bus.publish(DomainEvent::IterationFailed {
                    iteration,
                    error: e.to_string(),
                });
                return Step::Continue;
            }
        };

        let calls = assembled.tool_calls.clone();
        session.messages.push(assembled.into_message());

        let dispatcher = ToolDispatcher::new(&self.tools, &self.compressor, self.keep_recent)
            .with_event_bus(self.event_bus.clone())
            .with_observer(self.observer.clone());
        match dispatcher
            .dispatch(&mut session.messages, &calls, &mut session.project)
            .await
        {
            DispatchOutcome::Completed => Step::Completed,
            DispatchOutcome::Dispatched(invocations) => {
                debug!(iteration, calls = invocations.len(), "Tool calls dispatched");
                Step::Continue
            }
        }
    }

    fn request(&self, session: &Session) -> ProviderRequest {
        let mut tools = self.tools.definitions();
        tools.push(compress_context_definition());

        let mut request = ProviderRequest::simple(&session.model, session.messages.clone());
        request.temperature = self.temperature;
        request.max_tokens = Some(self.max_tokens);
        request.tools = tools;
        request.tool_choice = ToolChoice::Auto;
        request.stream = true;
        request
    }

    async fn stream_turn(&self, request: ProviderRequest) -> Result<AssembledMessage, ProviderError> {
        let mut rx = self.provider.stream(request).await?;
        StreamAssembler::new()
            .with_observer(self.observer.clone())
            .collect(&mut rx)
            .await
    }

    async fn periodic_checkpoint(&self, session: &Session) {
        info!(iteration = session.iteration, "Periodic checkpoint");
        match self.backups.checkpoint(&self.compressor, session).await {
            Ok(checkpoint) => self.publish_checkpoint(&checkpoint),
            Err(e) => {
                warn!(iteration = session.iteration, error = %e, "Checkpoint failed, continuing without backup");
                self.event_bus.publish(DomainEvent::CheckpointFailed {
                    iteration: session.iteration,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn finish_at_cap(&self, session: Session) -> RunReport {
        warn!(max_iterations = self.max_iterations, "Maximum iterations reached");
        let checkpoint = match self.backups.checkpoint(&self.compressor, &session).await {
            Ok(checkpoint) => {
                self.publish_checkpoint(&checkpoint);
                Some(checkpoint)
            }
            Err(e) => {
                warn!(error = %e, "Final checkpoint failed");
                self.event_bus.publish(DomainEvent::CheckpointFailed {
                    iteration: session.iteration,
                    error: e.to_string(),
                });
                None
            }
        };
        RunReport {
            outcome: RunOutcome::MaxIterationsReached { checkpoint },
            iterations: session.iteration,
            session,
        }
    }

    async fn abort(&self, session: Session, reason: String) -> RunReport {
        let emergency = self.backups.emergency(&self.compressor, &session, &reason).await;
        if let EmergencyOutcome::Checkpointed(checkpoint) = &emergency {
            self.publish_checkpoint(checkpoint);
        }
        RunReport {
            outcome: RunOutcome::Aborted { reason, emergency },
            iterations: session.iteration,
            session,
        }
    }

    fn publish_checkpoint(&self, checkpoint: &Checkpoint) {
        self.event_bus.publish(DomainEvent::CheckpointWritten {
            iteration: checkpoint.record.iteration,
            backup_file: checkpoint.backup_file.clone(),
            summary_file: checkpoint.record.summary_file.clone(),
            compression_ratio: checkpoint.record.compression_ratio,
        });
    }

    fn publish_compression(&self, messages_before: usize, outcome: &CompressionOutcome) {
        match outcome {
            CompressionOutcome::Compressed(report) => {
                self.event_bus.publish(DomainEvent::ContextCompressed {
                    messages_before,
                    messages_after: report.history.len(),
                    tokens_saved: report.tokens_saved,
                    summary_file: report.summary_file.clone(),
                })
            }
            other => self.event_bus.publish(DomainEvent::CompressionSkipped {
                reason: other.message().to_string(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::SUMMARY_START_MARKER;
    use crate::prompt::COMPRESS_CONTEXT_TOOL;
    use crate::test_helpers::{RecordingTool, ScriptedProvider, ScriptedTurn, text_turn, tool_turn};
    use quill_config::EstimationMode;
    use quill_core::message::Role;
    use quill_core::tool::ProjectContext;
    use std::path::Path;
    use std::time::Duration;

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.model = "moonshot/kimi-k2-thinking".into();
        config.output_dir = dir.join("output");
        config.backup.dir = dir.join("backups");
        config.backup.interval = 50;
        config.context.estimation = EstimationMode::Heuristic;
        config.context.keep_recent = 2;
        config.context.summary_timeout_secs = 5;
        config
    }

    fn session(dir: &Path) -> Session {
        let mut project = ProjectContext::new(dir.join("output"));
        project.set_active(dir);
        Session::new("moonshot/kimi-k2-thinking", "sys", "Write a story", project).unwrap()
    }

    fn tools() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(RecordingTool::new("outline")));
        Arc::new(tools)
    }

    fn backups_in(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir.join("backups"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.starts_with("backup_iter"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn text_only_turn_completes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("The end.")]));
        let agent = AgentLoop::new(provider.clone(), tools(), &config(dir.path()));

        let report = agent.run(session(dir.path())).await;
        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(report.iterations, 1);

        let last = report.session.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), "The end.");
        assert_eq!(last.reasoning.as_deref(), Some("thinking"));
        assert_eq!(report.session.messages.len(), 3);
    }

    #[tokio::test]
    async fn request_carries_manifest_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("ok")]));
        let mut config = config(dir.path());
        config.max_tokens = 1234;
        AgentLoop::new(provider.clone(), tools(), &config)
            .run(session(dir.path()))
            .await;

        let request = &provider.stream_requests()[0];
        assert!(request.stream);
        assert_eq!(request.tool_choice, ToolChoice::Auto);
        assert_eq!(request.max_tokens, Some(1234));
        let names: Vec<_> = request.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["outline", COMPRESS_CONTEXT_TOOL]);
    }

    #[tokio::test]
    async fn tool_round_then_completion() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_turn(&[("call_1", "outline", r#"{"chapters":3}"#)]),
            text_turn("All done."),
        ]));
        let report = AgentLoop::new(provider.clone(), tools(), &config(dir.path()))
            .run(session(dir.path()))
            .await;

        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(report.iterations, 2);

        let requests = provider.stream_requests();
        let second = &requests[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].tool_calls[0].arguments, r#"{"chapters":3}"#);
        assert_eq!(second[3].role, Role::Tool);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(second[3].text(), r#"outline ran with {"chapters":3}"#);
    }

    #[tokio::test]
    async fn failed_model_call_costs_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedTurn::Fail(ProviderError::Network("connection reset".into())),
            ScriptedTurn::Interrupted(
                vec![quill_core::provider::StreamDelta::text("half a")],
                ProviderError::StreamInterrupted("eof".into()),
            ),
            text_turn("Recovered."),
        ]));
        let bus = Arc::new(EventBus::new(64));
        let mut events = bus.subscribe();

        let report = AgentLoop::new(provider.clone(), tools(), &config(dir.path()))
            .with_event_bus(bus)
            .run(session(dir.path()))
            .await;

        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(report.iterations, 3);
        // Failed turns append nothing.
        assert_eq!(report.session.messages.len(), 3);
        assert_eq!(provider.stream_requests()[2].messages.len(), 2);

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.as_ref(), DomainEvent::IterationFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn cancellation_before_first_iteration_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![text_turn("never")]).summaries(vec!["Nothing yet."]),
        );
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let report = AgentLoop::new(provider.clone(), tools(), &config(dir.path()))
            .with_shutdown(shutdown)
            .run(session(dir.path()))
            .await;

        let RunOutcome::Aborted { reason, emergency } = report.outcome else {
            panic!("expected abort");
        };
        assert_eq!(reason, "interrupted");
        assert!(matches!(emergency, EmergencyOutcome::Checkpointed(_)));
        assert_eq!(report.iterations, 0);
        assert!(provider.stream_requests().is_empty());
        assert_eq!(backups_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn cancellation_abandons_pending_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::Hang]));
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            AgentLoop::new(provider.clone(), tools(), &config(dir.path()))
                .with_shutdown(shutdown)
                .run(session(dir.path())),
        )
        .await
        .unwrap();

        let RunOutcome::Aborted { emergency, .. } = report.outcome else {
            panic!("expected abort");
        };
        // No summary scripted, so the raw dump is the fallback.
        let EmergencyOutcome::RawDump { path, .. } = emergency else {
            panic!("expected raw dump");
        };
        assert!(path.ends_with("EMERGENCY_RAW_DUMP.json"));
        assert_eq!(report.iterations, 1);
        assert_eq!(report.session.messages.len(), 2);
    }

    #[tokio::test]
    async fn panic_in_iteration_routes_to_emergency() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![ScriptedTurn::Panic]).summaries(vec!["Saved."]),
        );
        let report = AgentLoop::new(provider, tools(), &config(dir.path()))
            .run(session(dir.path()))
            .await;

        let RunOutcome::Aborted { reason, emergency } = report.outcome else {
            panic!("expected abort");
        };
        assert!(reason.contains("scripted provider panic"));
        assert!(matches!(emergency, EmergencyOutcome::Checkpointed(_)));
    }

    #[tokio::test]
    async fn iteration_cap_takes_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![
                tool_turn(&[("a", "outline", "{}")]),
                tool_turn(&[("b", "outline", "{}")]),
                text_turn("unreached"),
            ])
            .summaries(vec!["Final state."]),
        );
        let report = AgentLoop::new(provider.clone(), tools(), &config(dir.path()))
            .with_max_iterations(2)
            .run(session(dir.path()))
            .await;

        let RunOutcome::MaxIterationsReached { checkpoint } = report.outcome else {
            panic!("expected cap");
        };
        let checkpoint = checkpoint.unwrap();
        assert_eq!(checkpoint.record.iteration, 2);
        assert!(checkpoint.record.summary_file.exists());
        assert_eq!(report.iterations, 2);
        assert_eq!(provider.stream_requests().len(), 2);
    }

    #[tokio::test]
    async fn periodic_checkpoint_runs_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![
                tool_turn(&[("a", "outline", "{}")]),
                tool_turn(&[("b", "outline", "{}")]),
                tool_turn(&[("c", "outline", "{}")]),
                text_turn("done"),
            ])
            .summaries(vec!["Checkpoint two.", "Checkpoint four."]),
        );
        let mut config = config(dir.path());
        config.backup.interval = 2;
        let bus = Arc::new(EventBus::new(128));
        let mut events = bus.subscribe();

        let report = AgentLoop::new(provider, tools(), &config)
            .with_event_bus(bus)
            .run(session(dir.path()))
            .await;
        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(backups_in(dir.path()).len(), 2);

        let mut written = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::CheckpointWritten { iteration, .. } = event.as_ref() {
                written.push(*iteration);
            }
        }
        assert_eq!(written, vec![2, 4]);
    }

    #[tokio::test]
    async fn failed_periodic_checkpoint_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("done")]));
        let mut config = config(dir.path());
        config.backup.interval = 1;

        let report = AgentLoop::new(provider, tools(), &config)
            .run(session(dir.path()))
            .await;
        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert!(backups_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn budget_threshold_compresses_before_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new(vec![
                tool_turn(&[("a", "outline", "{}"), ("b", "outline", "{}"), ("c", "outline", "{}")]),
                text_turn("done"),
            ])
            .summaries(vec!["Compressed story."])
            .token_counts(vec![Ok(10), Ok(190_000)]),
        );
        let mut config = config(dir.path());
        config.context.estimation = EstimationMode::Remote;

        AgentLoop::new(provider.clone(), tools(), &config)
            .run(session(dir.path()))
            .await;

        let requests = provider.stream_requests();
        // system + summary + the whole tool batch (assistant and three results)
        let second = &requests[1].messages;
        assert_eq!(second.len(), 6);
        assert_eq!(second[0].role, Role::System);
        assert!(second[1].text().starts_with(SUMMARY_START_MARKER));
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[2].tool_calls.len(), 3);
        assert!(second[3..].iter().all(|m| m.role == Role::Tool));
    }
}
