use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use switchboard_core::{Error, Result};

pub const MANIFEST_JSON: &str = "manifest.json";
pub const MANIFEST_YAML: &str = "manifest.yaml";

/// How a skill is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entrypoint {
    /// External program: arguments arrive as JSON on stdin, the result is
    /// read from stdout.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Handler registered in-process under `name`.
    Handler { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SkillRequires {
    #[serde(default)]
    pub bins: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters", alias = "parameter_schema", alias = "parameterSchema")]
    pub parameters: Value,
    pub entrypoint: Option<Entrypoint>,
    #[serde(default = "default_timeout_secs", alias = "timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requires: SkillRequires,
}

fn default_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn default_timeout_secs() -> u64 {
    30
}

impl SkillManifest {
    /// Reads `manifest.json` (or `manifest.yaml`) from a skill folder.
    /// Returns `Ok(None)` when the folder has no manifest at all.
    pub fn load(skill_dir: &Path) -> Result<Option<Self>> {
        let json_path = skill_dir.join(MANIFEST_JSON);
        if json_path.exists() {
            let content = std::fs::read_to_string(&json_path)?;
            let manifest = serde_json::from_str(&content).map_err(|e| {
                Error::Validation(format!("{}: {}", json_path.display(), e))
            })?;
            return Ok(Some(manifest));
        }

        let yaml_path = skill_dir.join(MANIFEST_YAML);
        if yaml_path.exists() {
            let content = std::fs::read_to_string(&yaml_path)?;
            let manifest = serde_yaml::from_str(&content).map_err(|e| {
                Error::Validation(format!("{}: {}", yaml_path.display(), e))
            })?;
            return Ok(Some(manifest));
        }

        Ok(None)
    }
}

/// Skill names double as directory and tool names.
pub fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
