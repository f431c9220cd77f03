//! Skills: named capabilities invoked through a `/name` prompt prefix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// A skill the engine knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl SkillInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Source of available skills.
#[async_trait]
pub trait SkillCatalog: Send + Sync {
    async fn list_skills(&self) -> Vec<SkillInfo>;
}

/// Fixed list of skills.
#[derive(Debug, Clone, Default)]
pub struct StaticSkillCatalog {
    skills: Vec<SkillInfo>,
}

impl StaticSkillCatalog {
    pub fn new(skills: Vec<SkillInfo>) -> Self {
        Self { skills }
    }
}

#[async_trait]
impl SkillCatalog for StaticSkillCatalog {
    async fn list_skills(&self) -> Vec<SkillInfo> {
        self.skills.clone()
    }
}

/// Skill names are a single token of letters, digits, `-`, `_`, `:` or `.`.
pub fn validate_skill_name(name: &str) -> Result<(), SessionError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSkill(name.to_string()))
    }
}

/// `/<skill> [args...]`, then a blank line and the free text if any.
pub fn build_skill_prompt(skill_name: &str, args: &[String], prompt: Option<&str>) -> String {
    let mut out = format!("/{skill_name}");
    for arg in args.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        out.push(' ');
        out.push_str(arg);
    }
    if let Some(text) = prompt.map(str::trim).filter(|t| !t.is_empty()) {
        out.push_str("\n\n");
        out.push_str(text);
    }
    out
}
