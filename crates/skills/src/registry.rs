use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchboard_core::{Error, Paths, Result, Workspace};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::ProcessRunner;
use crate::manifest::{is_valid_skill_name, Entrypoint, SkillManifest};
use crate::validate::validate_arguments;

/// Where a skill was found. Declaration order is resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Workspace,
    Global,
    Builtin,
}

impl SkillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Workspace => "workspace",
            SkillSource::Global => "global",
            SkillSource::Builtin => "builtin",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub entrypoint: Entrypoint,
    pub source_root: SkillSource,
    pub path: PathBuf,
    pub timeout_secs: u64,
    /// A skill with the same name exists in a higher-priority root.
    pub shadowed: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

impl SkillDescriptor {
    fn is_exposed(&self) -> bool {
        !self.shadowed && self.available
    }

    /// OpenAI-style function descriptor.
    pub fn tool_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameter_schema,
            }
        })
    }
}

/// Result of one skill invocation as fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }

    fn from_value(value: Value) -> Self {
        let content = match value {
            Value::String(s) => s,
            Value::Object(ref map) if map.len() == 1 && map.get("output").is_some_and(Value::is_string) => {
                map["output"].as_str().unwrap_or_default().to_string()
            }
            other => other.to_string(),
        };
        Self::ok(content)
    }
}

/// A skill implemented inside the process.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value>;
}

/// Returns the `text` argument unchanged.
pub struct EchoHandler;

#[async_trait]
impl SkillHandler for EchoHandler {
    async fn call(&self, args: Value) -> Result<Value> {
        match args.get("text") {
            Some(Value::String(s)) => Ok(Value::String(s.clone())),
            Some(other) => Ok(Value::String(other.to_string())),
            None => Err(Error::Validation("missing 'text'".into())),
        }
    }
}

/// Skills enumerated from the workspace, global and builtin roots.
///
/// The filesystem is authoritative: `list_skills` rescans every root and
/// replaces the cached index that `tool_schemas` and `invoke` read.
pub struct SkillRegistry {
    roots: Vec<(SkillSource, PathBuf)>,
    index: RwLock<Vec<SkillDescriptor>>,
    handlers: RwLock<HashMap<String, Arc<dyn SkillHandler>>>,
}

impl SkillRegistry {
    pub fn new(workspace_dir: PathBuf, global_dir: PathBuf, builtin_dir: PathBuf) -> Self {
        let registry = Self {
            roots: vec![
                (SkillSource::Workspace, workspace_dir),
                (SkillSource::Global, global_dir),
                (SkillSource::Builtin, builtin_dir),
            ],
            index: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
        };
        registry.register_handler("echo", Arc::new(EchoHandler));
        registry
    }

    pub fn from_paths(paths: &Paths, workspace: &Workspace) -> Self {
        Self::new(
            workspace.skills_dir(),
            paths.global_skills_dir(),
            paths.builtin_skills_dir(),
        )
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn SkillHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name.to_string(), handler);
        }
    }

    pub fn root(&self, source: SkillSource) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, p)| p.as_path())
    }

    /// Walks all roots in priority order. Later duplicates are kept in the
    /// listing with `shadowed = true`.
    pub fn list_skills(&self) -> Vec<SkillDescriptor> {
        let mut found: Vec<SkillDescriptor> = Vec::new();
        for (source, dir) in &self.roots {
            for mut skill in self.scan_root(*source, dir) {
                skill.shadowed = found.iter().any(|s| s.name == skill.name);
                if skill.shadowed {
                    debug!(name = %skill.name, source = source.as_str(), "Skill shadowed by higher-priority root");
                }
                found.push(skill);
            }
        }

        if let Ok(mut index) = self.index.write() {
            *index = found.clone();
        }
        found
    }

    /// Rescans the roots; returns how many skills are exposed to the agent.
    pub fn reload(&self) -> usize {
        let count = self.list_skills().iter().filter(|s| s.is_exposed()).count();
        info!(count, "Skill registry loaded");
        count
    }

    fn scan_root(&self, source: SkillSource, dir: &Path) -> Vec<SkillDescriptor> {
        let mut skills = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return skills,
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
        paths.sort();

        for path in paths {
            match self.load_skill(source, &path) {
                Ok(Some(skill)) => skills.push(skill),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid skill"),
            }
        }
        skills
    }

    fn load_skill(&self, source: SkillSource, skill_dir: &Path) -> Result<Option<SkillDescriptor>> {
        let manifest = match SkillManifest::load(skill_dir)? {
            Some(m) => m,
            None => return Ok(None),
        };

        let dir_name = skill_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let name = if manifest.name.is_empty() { dir_name } else { manifest.name.clone() };
        if !is_valid_skill_name(&name) {
            return Err(Error::Validation(format!("invalid skill name '{}'", name)));
        }

        let entrypoint = manifest
            .entrypoint
            .clone()
            .ok_or_else(|| Error::Validation(format!("skill '{}' has no entrypoint", name)))?;

        if !manifest.parameters.is_object() {
            return Err(Error::Validation(format!(
                "skill '{}' parameters must be a JSON schema object",
                name
            )));
        }

        let (available, unavailable_reason) = self.check_availability(&manifest, &entrypoint);

        Ok(Some(SkillDescriptor {
            name,
            description: manifest.description,
            parameter_schema: manifest.parameters,
            entrypoint,
            source_root: source,
            path: skill_dir.to_path_buf(),
            timeout_secs: manifest.timeout_secs.max(1),
            shadowed: false,
            available,
            unavailable_reason,
        }))
    }

    fn check_availability(&self, manifest: &SkillManifest, entrypoint: &Entrypoint) -> (bool, Option<String>) {
        for bin in &manifest.requires.bins {
            if which::which(bin).is_err() {
                return (false, Some(format!("Missing binary: {}", bin)));
            }
        }

        for env_var in &manifest.requires.env {
            if std::env::var(env_var).is_err() {
                return (false, Some(format!("Missing env var: {}", env_var)));
            }
        }

        if let Entrypoint::Handler { name } = entrypoint {
            let known = self.handlers.read().map(|h| h.contains_key(name)).unwrap_or(false);
            if !known {
                return (false, Some(format!("Unknown handler: {}", name)));
            }
        }

        (true, None)
    }

    /// Descriptors the agent may call: one per name, highest root wins.
    pub fn tool_schemas(&self) -> Vec<Value> {
        self.index
            .read()
            .map(|index| {
                index
                    .iter()
                    .filter(|s| s.is_exposed())
                    .map(SkillDescriptor::tool_schema)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name and description of each exposed skill, for the system prompt.
    pub fn summaries(&self) -> Vec<(String, String)> {
        self.index
            .read()
            .map(|index| {
                index
                    .iter()
                    .filter(|s| s.is_exposed())
                    .map(|s| (s.name.clone(), s.description.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<SkillDescriptor> {
        self.index
            .read()
            .ok()?
            .iter()
            .find(|s| s.name == name && !s.shadowed)
            .cloned()
    }

    /// Validates `arguments` against the skill's schema and runs it under the
    /// skill's timeout. Failures come back as `is_error` outcomes, never as
    /// `Err`, so the model sees them.
    pub async fn invoke(&self, name: &str, arguments: &Value, cancel: &CancellationToken) -> ToolOutcome {
        let skill = match self.get(name) {
            Some(s) if s.available => s,
            Some(s) => {
                return ToolOutcome::error(format!(
                    "skill '{}' is unavailable: {}",
                    name,
                    s.unavailable_reason.unwrap_or_default()
                ))
            }
            None => return ToolOutcome::error(format!("unknown skill '{}'", name)),
        };

        if let Err(msg) = validate_arguments(&skill.parameter_schema, arguments) {
            warn!(skill = %name, error = %msg, "Rejected skill arguments");
            return ToolOutcome::error(msg);
        }

        let timeout = Duration::from_secs(skill.timeout_secs);
        let result = match &skill.entrypoint {
            Entrypoint::Process { command, args } => {
                ProcessRunner::new(command, args, &skill.path, timeout)
                    .run(arguments, cancel)
                    .await
            }
            Entrypoint::Handler { name: handler_name } => {
                let handler = self
                    .handlers
                    .read()
                    .ok()
                    .and_then(|h| h.get(handler_name).cloned());
                match handler {
                    Some(h) => {
                        tokio::select! {
                            res = tokio::time::timeout(timeout, h.call(arguments.clone())) => {
                                res.unwrap_or_else(|_| Err(Error::Timeout(format!("'{}' exceeded {}s", name, timeout.as_secs()))))
                            }
                            _ = cancel.cancelled() => Err(Error::Cancelled(format!("'{}' cancelled", name))),
                        }
                    }
                    None => Err(Error::NotFound(format!("handler '{}'", handler_name))),
                }
            }
        };

        match result {
            Ok(value) => {
                debug!(skill = %name, "Skill completed");
                ToolOutcome::from_value(value)
            }
            Err(e) => {
                warn!(skill = %name, error = %e, "Skill failed");
                ToolOutcome::error(e.to_string())
            }
        }
    }
}
