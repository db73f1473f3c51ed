// src/subagent/dispatcher.rs — Isolated trajectory-analysis sub-conversations

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::types::{DiagnosisReport, EvalStatus};
use crate::eval::EvalGateway;
use crate::infra::errors::{EngineError, EngineResult};

/// Exactly the initial context a sub-conversation is seeded with: what the
/// target agent is generally supposed to do, the specific eval task, and
/// the full trajectory. Nothing else crosses the boundary, and the
/// subagent holds no handle to the store or session state.
#[derive(Debug, Clone)]
pub struct AnalysisBriefing {
    pub eval_id: String,
    pub target_overview: String,
    pub task_description: String,
    pub trajectory: serde_json::Value,
}

/// An open sub-conversation. Follow-up messages are strictly sequential;
/// `&mut self` keeps two from ever being in flight.
#[async_trait]
pub trait AnalysisSession: Send {
    async fn send(&mut self, message: &str) -> anyhow::Result<String>;
}

/// External collaborator that actually runs the analysis conversation
/// (the language-model machinery lives behind this trait).
#[async_trait]
pub trait AnalysisSpawner: Send + Sync {
    async fn open(
        &self,
        briefing: AnalysisBriefing,
    ) -> anyhow::Result<(Box<dyn AnalysisSession>, DiagnosisReport)>;
}

/// Dispatches trajectory-analysis subagents and tracks the one open
/// sub-conversation. A dispatch appears synchronous to the controller;
/// the subagent's internal turn-taking never touches the primary session.
pub struct TrajectoryAnalysisDispatcher {
    spawner: Arc<dyn AnalysisSpawner>,
    open: Option<OpenConversation>,
}

struct OpenConversation {
    eval_id: String,
    session: Box<dyn AnalysisSession>,
}

impl TrajectoryAnalysisDispatcher {
    pub fn new(spawner: Arc<dyn AnalysisSpawner>) -> Self {
        Self {
            spawner,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Eval id of the currently open sub-conversation, if any.
    pub fn open_eval_id(&self) -> Option<&str> {
        self.open.as_ref().map(|c| c.eval_id.as_str())
    }

    /// Open a sub-conversation scoped to `eval_id`'s most recent failing
    /// trajectory and return its diagnosis. Any previously open
    /// sub-conversation is closed first.
    pub async fn dispatch(
        &mut self,
        gateway: &EvalGateway,
        target_overview: &str,
        eval_id: &str,
    ) -> EngineResult<DiagnosisReport> {
        let no_trajectory = || EngineError::NoTrajectoryAvailable {
            eval_id: eval_id.to_string(),
        };

        let outcome = gateway.latest_outcome(eval_id).ok_or_else(no_trajectory)?;
        if outcome.status == EvalStatus::Pass {
            return Err(no_trajectory());
        }
        let reference = outcome.trajectory.as_ref().ok_or_else(no_trajectory)?;
        let trajectory = gateway.trajectory(reference).ok_or_else(no_trajectory)?;

        self.close();

        let briefing = AnalysisBriefing {
            eval_id: eval_id.to_string(),
            target_overview: target_overview.to_string(),
            task_description: gateway
                .description(eval_id)
                .unwrap_or_default()
                .to_string(),
            trajectory: trajectory.clone(),
        };

        tracing::info!(eval = %eval_id, "dispatching trajectory analysis subagent");
        let (session, report) =
            self.spawner
                .open(briefing)
                .await
                .map_err(|e| EngineError::SubagentFailed {
                    message: e.to_string(),
                })?;

        self.open = Some(OpenConversation {
            eval_id: eval_id.to_string(),
            session,
        });
        Ok(report)
    }

    /// Ask a follow-up question of the open sub-conversation.
    pub async fn send_message(&mut self, message: &str) -> EngineResult<String> {
        let conversation = self.open.as_mut().ok_or(EngineError::NoOpenSubagent)?;
        conversation
            .session
            .send(message)
            .await
            .map_err(|e| EngineError::SubagentFailed {
                message: e.to_string(),
            })
    }

    /// Close the open sub-conversation, if any. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        if let Some(conversation) = self.open.take() {
            tracing::debug!(eval = %conversation.eval_id, "closed subagent conversation");
            true
        } else {
            false
        }
    }
}
