// src/subagent/mod.rs — Trajectory-analysis subagent subsystem

pub mod dispatcher;

pub use dispatcher::{
    AnalysisBriefing, AnalysisSession, AnalysisSpawner, TrajectoryAnalysisDispatcher,
};
