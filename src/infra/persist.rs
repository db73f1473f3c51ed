// src/infra/persist.rs — Durable session archive

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::state::SessionState;
use crate::store::FileSnapshot;

/// Everything a session needs to resume after interruption. Working
/// conversational context is deliberately absent; it is rebuilt from the
/// state's compact rendering.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionArchive {
    pub state: SessionState,
    pub snapshots: Vec<FileSnapshot>,
    /// The iteration the session will continue with.
    pub next_iteration: u32,
}

/// Write the archive atomically: serialize to a sibling temp file, then
/// rename over the target. A failure here is fatal to the session,
/// since continuing without durable history risks silently losing it.
pub async fn save(archive: &SessionArchive, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(archive)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::info!(path = %path.display(), "session archive saved");
    Ok(())
}

pub async fn load(path: &Path) -> anyhow::Result<SessionArchive> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breakdown::ProjectBreakdown;

    #[tokio::test]
    async fn test_archive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut breakdown = ProjectBreakdown::default();
        breakdown
            .key_files
            .insert("agent/prompt.md".into(), "system prompt".into());

        let archive = SessionArchive {
            state: SessionState::new(breakdown),
            snapshots: vec![FileSnapshot {
                id: "abc123".into(),
                iteration: 0,
                files: [("agent/prompt.md".to_string(), "You are helpful.".to_string())].into(),
            }],
            next_iteration: 1,
        };

        save(&archive, &path).await.unwrap();
        let back = load(&path).await.unwrap();

        assert_eq!(back.next_iteration, 1);
        assert_eq!(back.snapshots.len(), 1);
        assert_eq!(back.snapshots[0].files["agent/prompt.md"], "You are helpful.");
        assert_eq!(
            back.state.breakdown.key_files["agent/prompt.md"],
            "system prompt"
        );
    }

    #[tokio::test]
    async fn test_load_missing_archive_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).await.is_err());
    }
}
