// src/eval/gateway.rs — Uniform interface to the client-supplied eval runner

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::core::types::{EvalCase, EvalOutcome, EvalStatus, SuiteResults, TrajectoryRef};
use crate::infra::errors::{EngineError, EngineResult};

/// Result of one eval case as reported by the client harness.
pub struct CaseResult {
    pub status: EvalStatus,
    pub score: Option<f64>,
    /// The target agent's full conversation during the case. Required for
    /// failing cases so a trajectory-analysis subagent can be dispatched.
    pub trajectory: Option<serde_json::Value>,
}

/// External collaborator: runs one eval case against the current
/// target-file state. Evals may be non-deterministic; the gateway never
/// retries internally; retry policy belongs to the caller.
#[async_trait]
pub trait EvalRunner: Send + Sync {
    async fn run_case(&self, eval_id: &str) -> anyhow::Result<CaseResult>;
}

/// Gateway between the controller and the eval harness.
///
/// Fans cases out with bounded concurrency and merges outcomes into a
/// sorted map, so completion order never affects the merged result.
/// Trajectories of failing cases are parked here behind opaque refs; the
/// controller only ever sees the ref.
pub struct EvalGateway {
    runner: Arc<dyn EvalRunner>,
    catalog: Vec<EvalCase>,
    concurrency: usize,
    case_timeout: Duration,
    latest: BTreeMap<String, EvalOutcome>,
    trajectories: HashMap<String, serde_json::Value>,
}

impl EvalGateway {
    pub fn new(
        runner: Arc<dyn EvalRunner>,
        catalog: Vec<EvalCase>,
        concurrency: usize,
        case_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            catalog,
            concurrency: concurrency.max(1),
            case_timeout,
            latest: BTreeMap::new(),
            trajectories: HashMap::new(),
        }
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.catalog.iter().map(|c| c.id.clone()).collect()
    }

    pub fn description(&self, eval_id: &str) -> Option<&str> {
        self.catalog
            .iter()
            .find(|c| c.id == eval_id)
            .map(|c| c.description.as_str())
    }

    pub fn latest_outcome(&self, eval_id: &str) -> Option<&EvalOutcome> {
        self.latest.get(eval_id)
    }

    pub fn trajectory(&self, reference: &TrajectoryRef) -> Option<&serde_json::Value> {
        self.trajectories.get(&reference.0)
    }

    /// Run the full catalog. The only run legal inside `end_iteration`.
    pub async fn run_full_suite(&mut self) -> EngineResult<SuiteResults> {
        let ids = self.all_ids();
        self.run(&ids).await
    }

    /// Run a subset of cases and merge the outcomes.
    ///
    /// Cases already completed when another case times out or crashes are
    /// preserved in the latest-outcome table before the error is returned.
    pub async fn run(&mut self, eval_ids: &[String]) -> EngineResult<SuiteResults> {
        for id in eval_ids {
            if !self.catalog.iter().any(|c| c.id == *id) {
                return Err(EngineError::MalformedAction {
                    field: "eval_ids".into(),
                    message: format!("unknown eval id '{id}'"),
                });
            }
        }

        let timeout = self.case_timeout;
        let completions: Vec<(String, CaseCompletion)> = stream::iter(eval_ids.to_vec())
            .map(|id| {
                let runner = Arc::clone(&self.runner);
                async move {
                    let completion =
                        match tokio::time::timeout(timeout, runner.run_case(&id)).await {
                            Ok(Ok(case)) => CaseCompletion::Done(case),
                            Ok(Err(e)) => CaseCompletion::Crashed(e.to_string()),
                            Err(_) => CaseCompletion::TimedOut,
                        };
                    (id, completion)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut merged: SuiteResults = BTreeMap::new();
        let mut timed_out: Option<String> = None;
        let mut crashed: Option<(String, String)> = None;

        for (id, completion) in completions {
            match completion {
                CaseCompletion::Done(case) => {
                    let outcome = self.admit(&id, case);
                    merged.insert(id, outcome);
                }
                CaseCompletion::TimedOut => {
                    tracing::warn!(eval = %id, "eval case timed out");
                    timed_out.get_or_insert(id);
                }
                CaseCompletion::Crashed(message) => {
                    tracing::warn!(eval = %id, %message, "eval runner crashed");
                    crashed.get_or_insert((id, message));
                }
            }
        }

        // Completed outcomes survive even when the run as a whole fails.
        for (id, outcome) in &merged {
            self.latest.insert(id.clone(), outcome.clone());
        }

        if let Some((id, message)) = crashed {
            return Err(EngineError::EvalGateway {
                message: format!("eval case '{id}' crashed: {message}"),
            });
        }
        if let Some(id) = timed_out {
            return Err(EngineError::Timeout {
                what: format!("eval case '{id}'"),
                secs: timeout.as_secs(),
            });
        }
        Ok(merged)
    }

    /// Convert a raw case result into an outcome, parking the trajectory
    /// of a non-passing case behind an opaque ref.
    fn admit(&mut self, eval_id: &str, case: CaseResult) -> EvalOutcome {
        let trajectory = match (case.status, case.trajectory) {
            (EvalStatus::Pass, _) | (_, None) => None,
            (_, Some(raw)) => {
                let key = uuid::Uuid::new_v4().to_string();
                self.trajectories.insert(key.clone(), raw);
                Some(TrajectoryRef(key))
            }
        };
        EvalOutcome {
            eval_id: eval_id.to_string(),
            status: case.status,
            score: case.score,
            trajectory,
        }
    }
}

enum CaseCompletion {
    Done(CaseResult),
    TimedOut,
    Crashed(String),
}
