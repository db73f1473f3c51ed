// src/core/action.rs — Action protocol: parse, validate, render results

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::breakdown::BreakdownPatch;
use crate::infra::errors::EngineError;

/// The closed set of actions the driving agent may issue, exactly one per
/// turn. The wire shape is a JSON object with an `action_type`
/// discriminator plus the variant's fields (see [`parse_action`]); extra
/// fields are rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Read(ReadAction),
    Write(WriteAction),
    Edit(EditAction),
    MultiEdit(MultiEditAction),
    Bash(BashAction),
    RunEvalSuite(RunEvalSuiteAction),
    EndIteration(EndIterationAction),
    ResetToIteration(ResetToIterationAction),
    DispatchTrajAnalysisAgent(DispatchTrajAnalysisAgentAction),
    SendSubagentMessage(SendSubagentMessageAction),
    UpdateProjectBreakdown(UpdateProjectBreakdownAction),
    Finish(FinishAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadAction {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteAction {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditAction {
    pub path: String,
    pub old: String,
    pub new: String,
}

/// One sub-edit within a `multi_edit` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditOp {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiEditAction {
    pub path: String,
    pub edits: Vec<EditOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BashAction {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunEvalSuiteAction {
    pub eval_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndIterationAction {
    /// The driving agent's summary of what changed this iteration.
    #[serde(default)]
    pub changelog: String,
    /// Breakdown updates folded in at the iteration boundary.
    #[serde(default)]
    pub breakdown_patch: BreakdownPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetToIterationAction {
    pub n: u32,
    /// Why the rollback happened; recorded so future context windows
    /// don't repeat the failed approach.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchTrajAnalysisAgentAction {
    pub eval_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendSubagentMessageAction {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProjectBreakdownAction {
    pub patch: BreakdownPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinishAction {
    pub summary: String,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Read(_) => "read",
            Action::Write(_) => "write",
            Action::Edit(_) => "edit",
            Action::MultiEdit(_) => "multi_edit",
            Action::Bash(_) => "bash",
            Action::RunEvalSuite(_) => "run_eval_suite",
            Action::EndIteration(_) => "end_iteration",
            Action::ResetToIteration(_) => "reset_to_iteration",
            Action::DispatchTrajAnalysisAgent(_) => "dispatch_traj_analysis_agent",
            Action::SendSubagentMessage(_) => "send_subagent_message",
            Action::UpdateProjectBreakdown(_) => "update_project_breakdown",
            Action::Finish(_) => "finish",
        }
    }
}

/// Parse one action request.
///
/// serde's internally-tagged enums cannot reject unknown fields, so the
/// tag is dispatched by hand and each payload struct carries
/// `deny_unknown_fields` (the original protocol forbids extras too).
pub fn parse_action(raw: &str) -> Result<Action, EngineError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| EngineError::MalformedAction {
        field: "action".into(),
        message: format!("not valid JSON: {e}"),
    })?;
    parse_action_value(value)
}

pub fn parse_action_value(value: Value) -> Result<Action, EngineError> {
    let Value::Object(mut obj) = value else {
        return Err(EngineError::MalformedAction {
            field: "action".into(),
            message: "expected a JSON object".into(),
        });
    };

    let tag = match obj.remove("action_type") {
        Some(Value::String(tag)) => tag,
        Some(other) => {
            return Err(EngineError::MalformedAction {
                field: "action_type".into(),
                message: format!("expected a string, got {other}"),
            })
        }
        None => {
            return Err(EngineError::MalformedAction {
                field: "action_type".into(),
                message: "missing required key".into(),
            })
        }
    };

    let payload = Value::Object(obj);
    match tag.as_str() {
        "read" => payload_as(payload).map(Action::Read),
        "write" => payload_as(payload).map(Action::Write),
        "edit" => payload_as(payload).map(Action::Edit),
        "multi_edit" => payload_as(payload).map(Action::MultiEdit),
        "bash" => payload_as(payload).map(Action::Bash),
        "run_eval_suite" => payload_as(payload).map(Action::RunEvalSuite),
        "end_iteration" => payload_as(payload).map(Action::EndIteration),
        "reset_to_iteration" => payload_as(payload).map(Action::ResetToIteration),
        "dispatch_traj_analysis_agent" => payload_as(payload).map(Action::DispatchTrajAnalysisAgent),
        "send_subagent_message" => payload_as(payload).map(Action::SendSubagentMessage),
        "update_project_breakdown" => payload_as(payload).map(Action::UpdateProjectBreakdown),
        "finish" => payload_as(payload).map(Action::Finish),
        _ => Err(EngineError::UnknownAction { action_type: tag }),
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, EngineError> {
    serde_json::from_value(payload).map_err(|e| EngineError::MalformedAction {
        field: offending_field(&e),
        message: e.to_string(),
    })
}

// serde_json names the field in backticks ("missing field `path`",
// "unknown field `foo`"); lift it out so the error can name it directly.
fn offending_field(err: &serde_json::Error) -> String {
    err.to_string()
        .split('`')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| "payload".into())
}

/// Structured success result for one turn.
pub fn render_ok(output: Value) -> Value {
    serde_json::json!({ "status": "ok", "output": output })
}

/// Structured error result for one turn.
pub fn render_error(err: &EngineError) -> Value {
    serde_json::json!({
        "status": "error",
        "error": err.code(),
        "message": err.to_string(),
    })
}
