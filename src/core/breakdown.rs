// src/core/breakdown.rs — Project breakdown: the engine's model of the target system

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One capability the target agent exposes, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
}

/// An eval explicitly accepted as an unresolved failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownLimitation {
    pub reason: String,
    pub accepted_at_iteration: u32,
}

/// Describes the target system under optimisation.
///
/// Read once at session start from a YAML document, thereafter owned and
/// mutated only by the engine. Every mutation stamps `version` with the
/// iteration it happened in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectBreakdown {
    pub key_files: BTreeMap<String, String>,
    pub available_actions: Vec<Capability>,
    pub editing_guidelines: Vec<String>,
    pub known_limitations: BTreeMap<String, KnownLimitation>,
    pub version: u32,
}

/// Structured updates applied via `update_project_breakdown` or the
/// `end_iteration` patch. Absent sections are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakdownPatch {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    #[serde(default)]
    pub known_limitations: BTreeMap<String, String>,
}

impl BreakdownPatch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.actions.is_empty() && self.known_limitations.is_empty()
    }
}

impl ProjectBreakdown {
    /// Apply a patch, returning a human-readable list of what changed.
    pub fn apply(&mut self, patch: &BreakdownPatch, iteration: u32) -> Vec<String> {
        let mut updated = Vec::new();

        for (path, description) in &patch.files {
            tracing::info!(path = %path, "updating key file in breakdown");
            self.key_files.insert(path.clone(), description.clone());
            updated.push(format!("file: {path}"));
        }

        for (name, description) in &patch.actions {
            tracing::info!(action = %name, "updating capability in breakdown");
            self.update_action(name, description);
            updated.push(format!("action: {name}"));
        }

        for (eval_id, reason) in &patch.known_limitations {
            tracing::info!(eval = %eval_id, "marking eval as known limitation");
            self.known_limitations.insert(
                eval_id.clone(),
                KnownLimitation {
                    reason: reason.clone(),
                    accepted_at_iteration: iteration,
                },
            );
            updated.push(format!("known_limitation: {eval_id}"));
        }

        if !updated.is_empty() {
            self.version = iteration;
        }
        updated
    }

    /// Update a capability's description in place, preserving declaration
    /// order; unknown names are appended.
    fn update_action(&mut self, name: &str, description: &str) {
        if let Some(cap) = self.available_actions.iter_mut().find(|c| c.name == name) {
            cap.description = description.to_string();
        } else {
            self.available_actions.push(Capability {
                name: name.to_string(),
                description: description.to_string(),
            });
        }
    }

    pub fn is_known_limitation(&self, eval_id: &str) -> bool {
        self.known_limitations.contains_key(eval_id)
    }

    /// One-line-per-capability summary, used in the subagent briefing.
    pub fn capabilities_summary(&self) -> String {
        self.available_actions
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full rendering for the collapsed context.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("### Key files\n");
        for (path, purpose) in &self.key_files {
            out.push_str(&format!("- `{path}`: {purpose}\n"));
        }

        out.push_str("\n### Available actions\n");
        out.push_str(&self.capabilities_summary());
        out.push('\n');

        if !self.editing_guidelines.is_empty() {
            out.push_str("\n### Editing guidelines\n");
            for guideline in &self.editing_guidelines {
                out.push_str(&format!("- {guideline}\n"));
            }
        }

        out
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let doc: RawBreakdown = serde_yml::from_str(raw)?;

        // YAML mappings keep document order; capability order is
        // meaningful and must survive the load.
        let available_actions = typed_entries::<DescribedEntry>(doc.available_actions)?
            .into_iter()
            .map(|(name, entry)| Capability {
                name,
                description: entry.description,
            })
            .collect();

        Ok(Self {
            key_files: typed_entries::<DescribedEntry>(doc.key_files)?
                .into_iter()
                .map(|(path, entry)| (path, entry.description))
                .collect(),
            available_actions,
            editing_guidelines: typed_entries::<DescribedEntry>(doc.editing_guidelines)?
                .into_iter()
                .map(|(_, entry)| entry.description)
                .collect(),
            known_limitations: typed_entries::<LimitationEntry>(doc.known_limitations)?
                .into_iter()
                .map(|(eval_id, entry)| {
                    (
                        eval_id,
                        KnownLimitation {
                            reason: entry.reason,
                            accepted_at_iteration: 0,
                        },
                    )
                })
                .collect(),
            version: 0,
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct RawBreakdown {
    #[serde(default)]
    key_files: serde_yml::Mapping,
    #[serde(default)]
    available_actions: serde_yml::Mapping,
    #[serde(default)]
    editing_guidelines: serde_yml::Mapping,
    #[serde(default)]
    known_limitations: serde_yml::Mapping,
}

#[derive(Debug, Deserialize)]
struct DescribedEntry {
    description: String,
}

#[derive(Debug, Deserialize)]
struct LimitationEntry {
    reason: String,
}

// serde_yml::Mapping is Value -> Value; convert per section so errors can
// name the offending entry.
fn typed_entries<T: serde::de::DeserializeOwned>(
    mapping: serde_yml::Mapping,
) -> anyhow::Result<Vec<(String, T)>> {
    let mut out = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("breakdown keys must be strings, got {key:?}"))?
            .to_string();
        let entry: T = serde_yml::from_value(value)
            .map_err(|e| anyhow::anyhow!("breakdown entry '{name}': {e}"))?;
        out.push((name, entry));
    }
    Ok(out)
}
