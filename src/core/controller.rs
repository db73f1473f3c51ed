// src/core/controller.rs — The iteration state machine

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::action::{
    render_error, render_ok, Action, BashAction, DispatchTrajAnalysisAgentAction, EditAction,
    EndIterationAction, FinishAction, MultiEditAction, ReadAction, ResetToIterationAction,
    RunEvalSuiteAction, SendSubagentMessageAction, UpdateProjectBreakdownAction, WriteAction,
};
use super::breakdown::ProjectBreakdown;
use super::state::SessionState;
use super::types::{
    pass_rate, ActionRecord, DiagnosisReport, EvalCase, EvalStatus, IterationRecord, Phase,
    ResetNote, SuiteResults,
};
use crate::eval::{EvalGateway, EvalRunner};
use crate::exec::BashExecutor;
use crate::infra::config::EngineConfig;
use crate::infra::errors::{EngineError, EngineResult};
use crate::infra::persist::SessionArchive;
use crate::store::backend::FileBackend;
use crate::store::FileStore;
use crate::subagent::{AnalysisSpawner, TrajectoryAnalysisDispatcher};

/// Result of processing one action.
pub struct Turn {
    /// The structured result object for this turn.
    pub result: Value,
    /// Present when the working conversation must be rebuilt from the
    /// compact session state (after `end_iteration` or a reset).
    pub collapsed_context: Option<String>,
    /// The session is over: `finish` was issued or the iteration budget
    /// ran out.
    pub finished: bool,
}

impl Turn {
    fn ok(payload: Value) -> Self {
        Self {
            result: render_ok(payload),
            collapsed_context: None,
            finished: false,
        }
    }

    fn error(err: &EngineError) -> Self {
        Self {
            result: render_error(err),
            collapsed_context: None,
            finished: false,
        }
    }
}

/// Drives one optimisation session: exactly one action per turn, phases
/// Analyzing → Investigating → Modifying → Testing → EndingIteration and
/// back, terminal Finished. Owns the session state and the context
/// collapse at every iteration boundary.
pub struct IterationController {
    config: EngineConfig,
    store: FileStore,
    gateway: EvalGateway,
    dispatcher: TrajectoryAnalysisDispatcher,
    bash: Arc<dyn BashExecutor>,
    state: SessionState,
    iteration: u32,
    phase: Phase,
    /// Diagnosis reports consulted during the current iteration.
    diagnoses: Vec<DiagnosisReport>,
    /// Reset recorded mid-iteration, attached to the next record.
    pending_reset: Option<ResetNote>,
}

impl IterationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        breakdown: ProjectBreakdown,
        backend: Arc<dyn FileBackend>,
        runner: Arc<dyn EvalRunner>,
        catalog: Vec<EvalCase>,
        spawner: Arc<dyn AnalysisSpawner>,
        bash: Arc<dyn BashExecutor>,
    ) -> Self {
        let store = FileStore::new(backend, config.snapshots.retention);
        let gateway = EvalGateway::new(
            runner,
            catalog,
            config.eval.concurrency,
            Duration::from_secs(config.eval.timeout_secs),
        );
        Self {
            store,
            gateway,
            dispatcher: TrajectoryAnalysisDispatcher::new(spawner),
            bash,
            state: SessionState::new(breakdown),
            iteration: 0,
            phase: Phase::Analyzing,
            diagnoses: Vec::new(),
            pending_reset: None,
            config,
        }
    }

    /// Resume a previously persisted session. Snapshot history and the
    /// cross-iteration state come from the archive; the working files are
    /// re-seeded from the latest snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        config: EngineConfig,
        archive: SessionArchive,
        backend: Arc<dyn FileBackend>,
        runner: Arc<dyn EvalRunner>,
        catalog: Vec<EvalCase>,
        spawner: Arc<dyn AnalysisSpawner>,
        bash: Arc<dyn BashExecutor>,
    ) -> Self {
        let mut controller = Self::new(
            config,
            archive.state.initial_breakdown.clone(),
            backend,
            runner,
            catalog,
            spawner,
            bash,
        );
        controller.store.load_snapshots(archive.snapshots);
        controller.state = archive.state;
        controller.iteration = archive.next_iteration;
        controller
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Failing evals the Analyzing phase should pursue (known limitations
    /// excluded).
    pub fn must_improve(&self) -> Vec<String> {
        self.state.failing_to_pursue()
    }

    /// The compact representation working context is rebuilt from.
    pub fn collapsed_context(&self) -> String {
        self.state.render(&self.config.policy)
    }

    /// Start the session: track the breakdown's key files, capture the
    /// baseline snapshot, run the initial full suite, and return the
    /// initial context for the driving agent.
    pub async fn begin(&mut self) -> EngineResult<String> {
        let key_files: Vec<String> = self.state.breakdown.key_files.keys().cloned().collect();
        for path in key_files {
            match self.store.track(&path).await {
                Ok(()) => {}
                Err(EngineError::NotFound { path }) => {
                    tracing::warn!(%path, "key file missing at session start");
                }
                Err(e) => return Err(e),
            }
        }

        self.store.snapshot(0);
        let results = self.gateway.run_full_suite().await?;
        tracing::info!(
            pass_rate = pass_rate(&results),
            evals = results.len(),
            "baseline suite complete"
        );
        self.state.initial_results = Some(results);
        self.iteration = 1;
        self.phase = Phase::Analyzing;
        Ok(self.collapsed_context())
    }

    /// Process exactly one action. Recoverable errors become the turn's
    /// structured error result; only a fatal internal fault is returned
    /// as `Err` and should stop the session.
    pub async fn step(&mut self, action: Action) -> anyhow::Result<Turn> {
        if self.phase == Phase::Finished {
            let err = EngineError::MalformedAction {
                field: "action_type".into(),
                message: "the session is finished; no further actions are accepted".into(),
            };
            return Ok(Turn::error(&err));
        }

        // A wholesale reset must never race an open sub-conversation; the
        // guard runs before the close-on-other-action rule below so the
        // error is actually reachable.
        if matches!(action, Action::ResetToIteration(_)) && self.dispatcher.is_open() {
            return Ok(Turn::error(&EngineError::SubagentOpen));
        }

        // Moving to any action other than a follow-up message closes the
        // open sub-conversation.
        if !matches!(action, Action::SendSubagentMessage(_)) {
            self.dispatcher.close();
        }

        let kind = action.kind();
        match self.execute(action).await {
            Ok(turn) => Ok(turn),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(action = kind, error = %e, "action failed");
                Ok(Turn::error(&e))
            }
            Err(fatal) => Err(anyhow::Error::new(fatal)),
        }
    }

    async fn execute(&mut self, action: Action) -> EngineResult<Turn> {
        match action {
            Action::Read(a) => self.handle_read(a).await,
            Action::Write(a) => self.handle_write(a).await,
            Action::Edit(a) => self.handle_edit(a).await,
            Action::MultiEdit(a) => self.handle_multi_edit(a).await,
            Action::Bash(a) => self.handle_bash(a).await,
            Action::RunEvalSuite(a) => self.handle_run_eval_suite(a).await,
            Action::DispatchTrajAnalysisAgent(a) => self.handle_dispatch(a).await,
            Action::SendSubagentMessage(a) => self.handle_send_subagent_message(a).await,
            Action::UpdateProjectBreakdown(a) => self.handle_update_breakdown(a),
            Action::EndIteration(a) => self.handle_end_iteration(a).await,
            Action::ResetToIteration(a) => self.handle_reset(a).await,
            Action::Finish(a) => self.handle_finish(a),
        }
    }

    async fn handle_read(&mut self, action: ReadAction) -> EngineResult<Turn> {
        self.phase = Phase::Investigating;
        let content = self.store.read(&action.path).await?;
        Ok(Turn::ok(json!({ "path": action.path, "content": content })))
    }

    async fn handle_write(&mut self, action: WriteAction) -> EngineResult<Turn> {
        self.phase = Phase::Modifying;
        self.store.write(&action.path, &action.content).await?;
        Ok(Turn::ok(json!({
            "path": action.path,
            "summary": format!("wrote {} bytes", action.content.len()),
        })))
    }

    async fn handle_edit(&mut self, action: EditAction) -> EngineResult<Turn> {
        self.phase = Phase::Modifying;
        self.store
            .edit(&action.path, &action.old, &action.new)
            .await?;
        Ok(Turn::ok(json!({
            "path": action.path,
            "summary": "replaced 1 occurrence",
        })))
    }

    async fn handle_multi_edit(&mut self, action: MultiEditAction) -> EngineResult<Turn> {
        self.phase = Phase::Modifying;
        self.store.multi_edit(&action.path, &action.edits).await?;
        Ok(Turn::ok(json!({
            "path": action.path,
            "summary": format!("applied {} edits", action.edits.len()),
        })))
    }

    async fn handle_bash(&mut self, action: BashAction) -> EngineResult<Turn> {
        self.phase = Phase::Investigating;
        let timeout = Duration::from_secs(self.config.bash.timeout_secs);
        let output = self.bash.run(&action.command, timeout).await?;
        self.store.record(ActionRecord::new(
            "bash",
            &action.command,
            format!("exit {}", output.exit_code),
        ));
        Ok(Turn::ok(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
        })))
    }

    async fn handle_run_eval_suite(&mut self, action: RunEvalSuiteAction) -> EngineResult<Turn> {
        if action.eval_ids.is_empty() {
            return Err(EngineError::MalformedAction {
                field: "eval_ids".into(),
                message: "at least one eval id is required".into(),
            });
        }
        self.phase = Phase::Testing;
        let results = self.gateway.run(&action.eval_ids).await?;
        self.store.record(ActionRecord::new(
            "run_eval_suite",
            action.eval_ids.join(","),
            format!("{:.1}% passed", pass_rate(&results)),
        ));
        Ok(Turn::ok(results_payload(&results)))
    }

    async fn handle_dispatch(
        &mut self,
        action: DispatchTrajAnalysisAgentAction,
    ) -> EngineResult<Turn> {
        self.phase = Phase::Investigating;
        let overview = self.state.breakdown.render();
        let report = self
            .dispatcher
            .dispatch(&self.gateway, &overview, &action.eval_id)
            .await?;

        self.store.record(ActionRecord::new(
            "dispatch_traj_analysis_agent",
            &action.eval_id,
            report
                .failure_categories
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ));
        self.diagnoses.push(report.clone());

        let payload = serde_json::to_value(&report)
            .map_err(|e| EngineError::Fatal(anyhow::anyhow!("diagnosis serialization: {e}")))?;
        Ok(Turn::ok(json!({ "report": payload })))
    }

    async fn handle_send_subagent_message(
        &mut self,
        action: SendSubagentMessageAction,
    ) -> EngineResult<Turn> {
        self.phase = Phase::Investigating;
        let reply = self.dispatcher.send_message(&action.message).await?;
        Ok(Turn::ok(json!({ "reply": reply })))
    }

    fn handle_update_breakdown(
        &mut self,
        action: UpdateProjectBreakdownAction,
    ) -> EngineResult<Turn> {
        if action.patch.is_empty() {
            return Err(EngineError::MalformedAction {
                field: "patch".into(),
                message: "no updates provided; include files, actions, or known_limitations"
                    .into(),
            });
        }
        let updated = self.state.breakdown.apply(&action.patch, self.iteration);
        Ok(Turn::ok(json!({ "updated": updated })))
    }

    /// Close the iteration: full suite, snapshot, immutable record,
    /// context collapse, counter bump.
    async fn handle_end_iteration(&mut self, action: EndIterationAction) -> EngineResult<Turn> {
        self.phase = Phase::EndingIteration;

        // A failure here surfaces as the turn's error and the iteration
        // stays open: no snapshot, no record, no collapse.
        let results = self.gateway.run_full_suite().await?;

        self.state.breakdown.apply(&action.breakdown_patch, self.iteration);
        let snapshot_id = self.store.snapshot(self.iteration);

        let record = IterationRecord {
            iteration_number: self.iteration,
            file_snapshot_id: snapshot_id.clone(),
            eval_results: results.clone(),
            actions_taken: self.store.drain_log(),
            diagnosis_reports: std::mem::take(&mut self.diagnoses),
            changelog: action.changelog,
            breakdown: self.state.breakdown.clone(),
            reset_from: self.pending_reset.take(),
            created_at: chrono::Utc::now(),
        };
        let closed = self.iteration;
        self.state.push_record(record);

        tracing::info!(
            iteration = closed,
            snapshot_id = %snapshot_id,
            pass_rate = pass_rate(&results),
            "iteration complete"
        );

        self.iteration += 1;
        self.phase = Phase::Analyzing;

        let budget_exhausted = self.iteration > self.config.session.max_iterations;
        if budget_exhausted {
            tracing::info!(
                max_iterations = self.config.session.max_iterations,
                "iteration budget exhausted"
            );
            self.phase = Phase::Finished;
        }

        let mut payload = results_payload(&results);
        payload["iteration"] = json!(closed);
        payload["budget_exhausted"] = json!(budget_exhausted);

        Ok(Turn {
            result: render_ok(payload),
            collapsed_context: Some(self.collapsed_context()),
            finished: budget_exhausted,
        })
    }

    /// Roll the whole working state back to iteration `n` and re-enter
    /// Analyzing as iteration `n + 1`. Later history is discarded, not
    /// hidden.
    async fn handle_reset(&mut self, action: ResetToIterationAction) -> EngineResult<Turn> {
        let snapshot_id = self.store.restore_iteration(action.n).await?;
        self.state.truncate_to(action.n);
        self.diagnoses.clear();

        let reason = action.reason.unwrap_or_default();
        self.pending_reset = Some(ResetNote {
            from_iteration: action.n,
            reason: reason.clone(),
        });
        self.iteration = action.n + 1;
        self.phase = Phase::Analyzing;

        tracing::info!(restored_to = action.n, %reason, "session reset");

        Ok(Turn {
            result: render_ok(json!({
                "restored_to": action.n,
                "snapshot_id": snapshot_id,
                "next_iteration": self.iteration,
            })),
            collapsed_context: Some(self.collapsed_context()),
            finished: false,
        })
    }

    fn handle_finish(&mut self, action: FinishAction) -> EngineResult<Turn> {
        self.phase = Phase::Finished;
        tracing::info!(iteration = self.iteration, "session finished");
        Ok(Turn {
            result: render_ok(json!({ "summary": action.summary })),
            collapsed_context: None,
            finished: true,
        })
    }

    /// Persist everything needed to resume after interruption.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let archive = SessionArchive {
            state: self.state.clone(),
            snapshots: self.store.snapshots().to_vec(),
            next_iteration: self.iteration,
        };
        crate::infra::persist::save(&archive, path).await
    }
}

/// Suite results as a turn payload. Trajectories stay behind their refs;
/// only availability is reported.
fn results_payload(results: &SuiteResults) -> Value {
    let entries: Vec<Value> = results
        .values()
        .map(|o| {
            json!({
                "eval_id": o.eval_id,
                "status": status_str(o.status),
                "score": o.score,
                "trajectory_available": o.trajectory.is_some(),
            })
        })
        .collect();
    json!({ "results": entries, "pass_rate": pass_rate(results) })
}

fn status_str(status: EvalStatus) -> &'static str {
    match status {
        EvalStatus::Pass => "pass",
        EvalStatus::Fail => "fail",
        EvalStatus::Error => "error",
    }
}
