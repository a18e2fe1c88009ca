//! Dataset input: evaluation cases and declared domain groups.
//!
//! Cases arrive as JSONL files; files whose stem mentions `negative` feed
//! the negative-control set. Domain groups are declared statically in a
//! YAML file and are the sole source of confusion-matrix axes, so matrix
//! dimensions never depend on what a particular run happened to predict.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Longest routing-index description kept per skill.
const MAX_DESCRIPTION_CHARS: usize = 120;

fn default_true() -> bool {
    true
}

/// One evaluation unit from the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    /// Case identifier.
    pub id: String,
    /// Domain group; negative controls have none.
    #[serde(default)]
    pub group: Option<String>,
    /// The natural-language request to route.
    pub user_prompt: String,
    /// The handler that should be selected.
    #[serde(default)]
    pub expected_skill: String,
    /// Alternates that also count as correct.
    #[serde(default)]
    pub acceptable_skills: Vec<String>,
    /// Whether any handler should legitimately activate.
    #[serde(default = "default_true")]
    pub should_activate: bool,
    /// Negative-control category.
    #[serde(default)]
    pub category: Option<String>,
}

/// Cases split into confusion prompts and negative controls.
#[derive(Debug, Default)]
pub struct LoadedCases {
    pub confusion: Vec<EvalCase>,
    pub negative: Vec<EvalCase>,
}

/// Loads all JSONL case files under `dir`.
///
/// Blank lines and `#` comments are skipped; unparseable lines are warned
/// about and dropped. `group_filter` narrows the confusion set only;
/// negative controls always load in full.
pub fn load_cases(dir: &Path, group_filter: Option<&str>) -> Result<LoadedCases> {
    let mut loaded = LoadedCases::default();
    if !dir.is_dir() {
        return Ok(loaded);
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    paths.sort();

    for path in paths {
        let is_negative = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.contains("negative"))
            .unwrap_or(false);

        let content = std::fs::read_to_string(&path)?;
        for (line_num, line) in content.lines().enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<EvalCase>(stripped) {
                Ok(case) => {
                    if is_negative {
                        loaded.negative.push(case);
                    } else {
                        loaded.confusion.push(case);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = line_num + 1,
                        error = %e,
                        "invalid case line skipped"
                    );
                }
            }
        }
    }

    if let Some(filter) = group_filter {
        loaded
            .confusion
            .retain(|c| c.group.as_deref() == Some(filter));
    }

    Ok(loaded)
}

/// One declared skill: routing identifier plus index description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillEntry {
    pub id: String,
    pub description: String,
}

/// The statically declared domain groups.
///
/// Each group names the overlapping skills the router must disambiguate
/// between; its routing index is scoped to exactly those skills.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainGroups {
    pub groups: BTreeMap<String, Vec<SkillEntry>>,
}

impl DomainGroups {
    /// Loads group declarations from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Returns the declared group names, sorted.
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Whether a group is declared.
    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Fixed matrix axes: group name to sorted skill identifiers.
    pub fn axes(&self) -> BTreeMap<String, Vec<String>> {
        self.groups
            .iter()
            .map(|(name, skills)| {
                let mut ids: Vec<String> = skills.iter().map(|s| s.id.clone()).collect();
                ids.sort();
                (name.clone(), ids)
            })
            .collect()
    }

    /// Renders the routing index for one group.
    ///
    /// Returns the index text and the number of entries it holds.
    pub fn build_group_index(&self, group: &str) -> (String, usize) {
        let Some(skills) = self.groups.get(group) else {
            return (String::new(), 0);
        };
        Self::render_index(skills.iter())
    }

    /// Renders a combined index over every declared group, for negative
    /// controls that must see the full routing surface.
    pub fn build_full_index(&self) -> (String, usize) {
        let mut by_id: BTreeMap<&str, &SkillEntry> = BTreeMap::new();
        for skills in self.groups.values() {
            for skill in skills {
                by_id.entry(&skill.id).or_insert(skill);
            }
        }
        Self::render_index(by_id.into_values())
    }

    fn render_index<'a>(skills: impl Iterator<Item = &'a SkillEntry>) -> (String, usize) {
        let mut entries: Vec<(String, String)> = Vec::new();
        for skill in skills {
            let description = skill
                .description
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            if description.is_empty() {
                continue;
            }
            let clamped = if description.chars().count() > MAX_DESCRIPTION_CHARS {
                let kept: String = description
                    .chars()
                    .take(MAX_DESCRIPTION_CHARS - 3)
                    .collect();
                format!("{}...", kept)
            } else {
                description
            };
            entries.push((skill.id.clone(), clamped));
        }
        entries.sort();

        let lines: Vec<String> = entries
            .iter()
            .map(|(id, desc)| format!("- {}: {}", id, desc))
            .collect();
        let count = lines.len();
        (lines.join("\n"), count)
    }
}
