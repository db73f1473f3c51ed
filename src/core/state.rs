// src/core/state.rs — Cross-iteration session memory and context collapse

use serde::{Deserialize, Serialize};

use super::breakdown::ProjectBreakdown;
use super::types::{pass_rate, EvalStatus, IterationRecord, SuiteResults};
use crate::infra::config::PolicyConfig;

/// The persisted, cross-iteration memory of one optimisation session.
///
/// Owned by exactly one controller instance; crosses the persistence
/// boundary via serde. Working conversational context is discarded at
/// every iteration boundary; whatever must survive lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub breakdown: ProjectBreakdown,
    /// Breakdown as loaded at session start; reset-to-0 restores this.
    pub initial_breakdown: ProjectBreakdown,
    /// Baseline full-suite results from before iteration 1.
    pub initial_results: Option<SuiteResults>,
    /// Append-only, one record per completed iteration.
    pub history: Vec<IterationRecord>,
}

/// Suite-level regression relative to the best recorded state.
#[derive(Debug, Clone, PartialEq)]
pub struct Regression {
    pub current_pct: f64,
    pub best_pct: f64,
    pub best_iteration: u32,
    pub regressed_iteration: u32,
}

impl SessionState {
    pub fn new(breakdown: ProjectBreakdown) -> Self {
        Self {
            initial_breakdown: breakdown.clone(),
            breakdown,
            initial_results: None,
            history: Vec::new(),
        }
    }

    pub fn push_record(&mut self, record: IterationRecord) {
        self.history.push(record);
    }

    pub fn latest_results(&self) -> Option<&SuiteResults> {
        self.history
            .last()
            .map(|r| &r.eval_results)
            .or(self.initial_results.as_ref())
    }

    /// Discard iterations after `n` and restore the breakdown that was
    /// current when iteration `n` closed (`n = 0` means the baseline).
    pub fn truncate_to(&mut self, n: u32) {
        self.history.retain(|r| r.iteration_number <= n);
        self.breakdown = self
            .history
            .last()
            .map(|r| r.breakdown.clone())
            .unwrap_or_else(|| self.initial_breakdown.clone());
    }

    /// Failing evals worth pursuing: latest non-pass outcomes minus the
    /// accepted known limitations.
    pub fn failing_to_pursue(&self) -> Vec<String> {
        let Some(results) = self.latest_results() else {
            return Vec::new();
        };
        results
            .values()
            .filter(|o| !o.is_pass())
            .filter(|o| !self.breakdown.is_known_limitation(&o.eval_id))
            .map(|o| o.eval_id.clone())
            .collect()
    }

    /// How many iterations in a row the eval has failed, counting back
    /// from the most recent record. A pass or an absent result stops the
    /// count.
    pub fn consecutive_failures(&self, eval_id: &str) -> u32 {
        let mut count = 0;
        for record in self.history.iter().rev() {
            match record.eval_results.get(eval_id) {
                Some(outcome) if outcome.status != EvalStatus::Pass => count += 1,
                _ => break,
            }
        }
        count
    }

    /// Evals that have failed enough consecutive iterations to be worth
    /// accepting as known limitations. The decision stays with the driving
    /// agent (via `update_project_breakdown`); the engine only surfaces
    /// the candidates.
    pub fn limitation_candidates(&self, policy: &PolicyConfig) -> Vec<String> {
        let Some(results) = self.latest_results() else {
            return Vec::new();
        };
        results
            .values()
            .filter(|o| !o.is_pass())
            .filter(|o| !self.breakdown.is_known_limitation(&o.eval_id))
            .filter(|o| self.consecutive_failures(&o.eval_id) >= policy.limitation_candidate_after)
            .map(|o| o.eval_id.clone())
            .collect()
    }

    /// Best recorded suite pass-rate and the iteration that achieved it
    /// (0 = baseline).
    pub fn best_pass_rate(&self) -> Option<(f64, u32)> {
        let mut best = self.initial_results.as_ref().map(|r| (pass_rate(r), 0));
        for record in &self.history {
            let rate = record.pass_rate();
            if best.map(|(b, _)| rate > b).unwrap_or(true) {
                best = Some((rate, record.iteration_number));
            }
        }
        best
    }

    /// Suite-level regression check: the latest run is more than the
    /// policy threshold below the best recorded state. Evals are
    /// non-deterministic, so a single sample below threshold is treated
    /// as noise rather than ground truth.
    pub fn check_regression(&self, policy: &PolicyConfig) -> Option<Regression> {
        let last = self.history.last()?;
        let (best_pct, best_iteration) = self.best_pass_rate()?;
        let current_pct = last.pass_rate();

        if current_pct < best_pct - policy.regression_threshold_pct {
            Some(Regression {
                current_pct,
                best_pct,
                best_iteration,
                regressed_iteration: last.iteration_number,
            })
        } else {
            None
        }
    }

    /// Build the compact context the next iteration starts from. Always
    /// contains the full known-limitations set and the current breakdown;
    /// everything conversational from the finished iteration is gone.
    pub fn render(&self, policy: &PolicyConfig) -> String {
        let mut out = String::from("# Optimisation State\n\n");

        if let Some(initial) = &self.initial_results {
            out.push_str("## Baseline (before iteration 1)\n");
            render_results(&mut out, initial);
            out.push('\n');
        }

        if !self.history.is_empty() {
            out.push_str("## Optimisation History\n\n");
            for record in &self.history {
                render_record(&mut out, record);
            }
        }

        if let Some(regression) = self.check_regression(policy) {
            out.push_str("## Regression Detected\n\n");
            out.push_str(&format!(
                "Pass rate dropped to {:.1}% (iteration {}). Best recorded state: iteration {} ({:.1}%).\n",
                regression.current_pct,
                regression.regressed_iteration,
                regression.best_iteration,
                regression.best_pct,
            ));
            out.push_str(
                "Consider `reset_to_iteration` to return to a better state before making more changes.\n\n",
            );
        }

        let candidates = self.limitation_candidates(policy);
        if !candidates.is_empty() {
            out.push_str("## Limitation Candidates\n\n");
            out.push_str(&format!(
                "These evals have failed {} or more consecutive iterations without progress: {}.\n",
                policy.limitation_candidate_after,
                candidates.join(", "),
            ));
            out.push_str(
                "If you believe they cannot be fixed, accept them via `update_project_breakdown` instead of retrying indefinitely.\n\n",
            );
        }

        if !self.breakdown.known_limitations.is_empty() {
            out.push_str("## Known Limitations\n\n");
            for (eval_id, limitation) in &self.breakdown.known_limitations {
                out.push_str(&format!(
                    "- **{eval_id}** (accepted at iteration {}): {}\n",
                    limitation.accepted_at_iteration, limitation.reason
                ));
            }
            out.push_str("\nDo not spend time trying to fix these evals.\n\n");
        }

        out.push_str("## Current Project Breakdown\n\n");
        out.push_str(&self.breakdown.render());
        out.push('\n');

        out.push_str("## Instructions\n\n");
        out.push_str(
            "Continue optimising the target system. When your changes are ready to test, \
             use `end_iteration` to run the full eval suite and move to the next iteration.\n",
        );

        out
    }
}

fn render_results(out: &mut String, results: &SuiteResults) {
    for outcome in results.values() {
        let status = match outcome.status {
            EvalStatus::Pass => "PASS",
            EvalStatus::Fail => "FAIL",
            EvalStatus::Error => "ERROR",
        };
        match outcome.score {
            Some(score) => out.push_str(&format!(
                "- {}: {} (score: {:.1}%)\n",
                outcome.eval_id,
                status,
                score * 100.0
            )),
            None => out.push_str(&format!("- {}: {}\n", outcome.eval_id, status)),
        }
    }
    let passed = results.values().filter(|o| o.is_pass()).count();
    out.push_str(&format!(
        "**Total**: {:.1}% ({}/{} passed)\n",
        pass_rate(results),
        passed,
        results.len()
    ));
}

fn render_record(out: &mut String, record: &IterationRecord) {
    out.push_str(&format!("### Iteration {}\n", record.iteration_number));

    if let Some(reset) = &record.reset_from {
        out.push_str(&format!(
            "**Reset**: rolled back to iteration {} (reason: \"{}\")\n",
            reset.from_iteration, reset.reason
        ));
    }

    if !record.changelog.is_empty() {
        out.push_str(&format!("**Changes**: {}\n", record.changelog));
    }
    if !record.actions_taken.is_empty() {
        out.push_str(&format!(
            "**Actions**: {}\n",
            record
                .actions_taken
                .iter()
                .map(|a| format!("{} {}", a.kind, a.target))
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }
    for report in &record.diagnosis_reports {
        out.push_str(&format!(
            "**Diagnosis** ({}): {}\n",
            report
                .failure_categories
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            report.narrative
        ));
    }

    out.push_str("**Results**:\n");
    render_results(out, &record.eval_results);
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breakdown::BreakdownPatch;
    use crate::core::types::{ActionRecord, EvalOutcome};

    fn results(entries: &[(&str, EvalStatus)]) -> SuiteResults {
        entries
            .iter()
            .map(|(id, status)| {
                (
                    id.to_string(),
                    EvalOutcome {
                        eval_id: id.to_string(),
                        status: *status,
                        score: None,
                        trajectory: None,
                    },
                )
            })
            .collect()
    }

    fn record(
        n: u32,
        breakdown: &ProjectBreakdown,
        entries: &[(&str, EvalStatus)],
    ) -> IterationRecord {
        IterationRecord {
            iteration_number: n,
            file_snapshot_id: format!("snap-{n}"),
            eval_results: results(entries),
            actions_taken: vec![ActionRecord::new("edit", "calc.py", "replaced 1 occurrence")],
            diagnosis_reports: vec![],
            changelog: format!("iteration {n} changes"),
            breakdown: breakdown.clone(),
            reset_from: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn base_state() -> SessionState {
        let mut breakdown = ProjectBreakdown::default();
        breakdown.key_files.insert(
            "agent/system_message.md".into(),
            "The target agent's prompt".into(),
        );
        SessionState::new(breakdown)
    }

    // ─── regression ─────────────────────────────────────────────

    #[test]
    fn test_regression_detected_against_best() {
        let mut state = base_state();
        state.initial_results = Some(results(&[("a", EvalStatus::Fail), ("b", EvalStatus::Fail)]));
        let bd = state.breakdown.clone();
        state.push_record(record(
            1,
            &bd,
            &[("a", EvalStatus::Pass), ("b", EvalStatus::Pass)],
        ));
        state.push_record(record(
            2,
            &bd,
            &[("a", EvalStatus::Pass), ("b", EvalStatus::Fail)],
        ));

        let regression = state.check_regression(&PolicyConfig::default()).unwrap();
        assert_eq!(regression.best_iteration, 1);
        assert_eq!(regression.regressed_iteration, 2);
        assert!((regression.best_pct - 100.0).abs() < f64::EPSILON);
        assert!((regression.current_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_regression_within_threshold() {
        let mut state = base_state();
        let bd = state.breakdown.clone();
        state.push_record(record(1, &bd, &[("a", EvalStatus::Pass)]));
        state.push_record(record(2, &bd, &[("a", EvalStatus::Pass)]));
        assert!(state.check_regression(&PolicyConfig::default()).is_none());
    }

    // ─── consecutive failures / candidates ──────────────────────

    #[test]
    fn test_consecutive_failures_counts_from_latest() {
        let mut state = base_state();
        let bd = state.breakdown.clone();
        state.push_record(record(1, &bd, &[("a", EvalStatus::Fail)]));
        state.push_record(record(2, &bd, &[("a", EvalStatus::Pass)]));
        state.push_record(record(3, &bd, &[("a", EvalStatus::Fail)]));
        state.push_record(record(4, &bd, &[("a", EvalStatus::Error)]));
        // The pass at iteration 2 stops the count
        assert_eq!(state.consecutive_failures("a"), 2);
        assert_eq!(state.consecutive_failures("unknown"), 0);
    }

    #[test]
    fn test_limitation_candidates_after_three_fails() {
        let mut state = base_state();
        let bd = state.breakdown.clone();
        for n in 1..=3 {
            state.push_record(record(
                n,
                &bd,
                &[("stubborn", EvalStatus::Fail), ("fine", EvalStatus::Pass)],
            ));
        }
        let candidates = state.limitation_candidates(&PolicyConfig::default());
        assert_eq!(candidates, vec!["stubborn".to_string()]);
    }

    #[test]
    fn test_known_limitation_not_a_candidate_and_not_pursued() {
        let mut state = base_state();
        let patch = BreakdownPatch {
            known_limitations: [("stubborn".to_string(), "model capability gap".to_string())]
                .into(),
            ..Default::default()
        };
        state.breakdown.apply(&patch, 3);
        let bd = state.breakdown.clone();
        for n in 1..=3 {
            state.push_record(record(n, &bd, &[("stubborn", EvalStatus::Fail)]));
        }
        assert!(state
            .limitation_candidates(&PolicyConfig::default())
            .is_empty());
        assert!(state.failing_to_pursue().is_empty());
    }

    // ─── truncation ─────────────────────────────────────────────

    #[test]
    fn test_truncate_to_restores_breakdown() {
        let mut state = base_state();
        let bd_at_1 = state.breakdown.clone();
        state.push_record(record(1, &bd_at_1, &[("a", EvalStatus::Pass)]));

        let patch = BreakdownPatch {
            files: [("agent/tools/new.py".to_string(), "Added later".to_string())].into(),
            ..Default::default()
        };
        state.breakdown.apply(&patch, 2);
        let bd_at_2 = state.breakdown.clone();
        state.push_record(record(2, &bd_at_2, &[("a", EvalStatus::Fail)]));
        state.push_record(record(3, &bd_at_2, &[("a", EvalStatus::Fail)]));

        state.truncate_to(1);
        let numbers: Vec<u32> = state.history.iter().map(|r| r.iteration_number).collect();
        assert_eq!(numbers, vec![1]);
        assert!(!state.breakdown.key_files.contains_key("agent/tools/new.py"));

        state.truncate_to(0);
        assert!(state.history.is_empty());
        assert_eq!(state.breakdown.key_files, state.initial_breakdown.key_files);
    }

    // ─── rendering ──────────────────────────────────────────────

    #[test]
    fn test_render_contains_limitations_and_breakdown() {
        let mut state = base_state();
        let patch = BreakdownPatch {
            known_limitations: [(
                "calc_symbolic".to_string(),
                "needs symbolic algebra".to_string(),
            )]
            .into(),
            ..Default::default()
        };
        state.breakdown.apply(&patch, 2);
        let bd = state.breakdown.clone();
        state.initial_results = Some(results(&[("calc_add", EvalStatus::Fail)]));
        state.push_record(record(1, &bd, &[("calc_add", EvalStatus::Pass)]));

        let rendered = state.render(&PolicyConfig::default());
        assert!(rendered.contains("calc_symbolic"));
        assert!(rendered.contains("needs symbolic algebra"));
        assert!(rendered.contains("agent/system_message.md"));
        assert!(rendered.contains("### Iteration 1"));
        assert!(rendered.contains("Baseline"));
        assert!(rendered.contains("## Instructions"));
    }

    #[test]
    fn test_render_includes_reset_note() {
        let mut state = base_state();
        let bd = state.breakdown.clone();
        let mut rec = record(2, &bd, &[("a", EvalStatus::Pass)]);
        rec.reset_from = Some(crate::core::types::ResetNote {
            from_iteration: 1,
            reason: "broke two evals".into(),
        });
        state.push_record(rec);

        let rendered = state.render(&PolicyConfig::default());
        assert!(rendered.contains("rolled back to iteration 1"));
        assert!(rendered.contains("broke two evals"));
    }

    // ─── persistence shape ──────────────────────────────────────

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = base_state();
        let bd = state.breakdown.clone();
        state.initial_results = Some(results(&[("a", EvalStatus::Fail)]));
        state.push_record(record(1, &bd, &[("a", EvalStatus::Pass)]));

        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.history.len(), 1);
        assert_eq!(back.history[0].iteration_number, 1);
        assert_eq!(
            back.breakdown.key_files["agent/system_message.md"],
            "The target agent's prompt"
        );
    }
}
