//! Bot identities: named persona bundles stored as `identities/<id>.json`.
//!
//! Activating an identity copies its four markdown fragments over the
//! workspace persona files, which the context builder reads on every turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use switchboard_core::{Error, Result, Workspace};
use tracing::{info, warn};

pub const DEFAULT_IDENTITY_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub agent_md: String,
    #[serde(default)]
    pub identity_md: String,
    #[serde(default)]
    pub soul_md: String,
    #[serde(default)]
    pub user_md: String,
}

impl Identity {
    fn persona(&self) -> [(&'static str, &str); 4] {
        [
            ("AGENT.md", &self.agent_md),
            ("IDENTITY.md", &self.identity_md),
            ("SOUL.md", &self.soul_md),
            ("USER.md", &self.user_md),
        ]
    }
}

struct Template {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    icon: &'static str,
    category: &'static str,
    agent_md: &'static str,
    identity_md: &'static str,
    soul_md: &'static str,
    user_md: &'static str,
}

const TEMPLATES: [Template; 2] = [
    Template {
        id: "car-sales",
        name: "Car Sales Assistant",
        description: "Automotive sales specialist helping customers find the right vehicle",
        icon: "🚗",
        category: "sales",
        agent_md: include_str!("../templates/car-sales/AGENT.md"),
        identity_md: include_str!("../templates/car-sales/IDENTITY.md"),
        soul_md: include_str!("../templates/car-sales/SOUL.md"),
        user_md: include_str!("../templates/car-sales/USER.md"),
    },
    Template {
        id: "receptionist",
        name: "Professional Receptionist",
        description: "Front desk assistant managing appointments and inquiries",
        icon: "👔",
        category: "service",
        agent_md: include_str!("../templates/receptionist/AGENT.md"),
        identity_md: include_str!("../templates/receptionist/IDENTITY.md"),
        soul_md: include_str!("../templates/receptionist/SOUL.md"),
        user_md: include_str!("../templates/receptionist/USER.md"),
    },
];

pub fn template_names() -> Vec<&'static str> {
    TEMPLATES.iter().map(|t| t.id).collect()
}

/// A fresh, inactive identity seeded from a built-in template.
pub fn template(name: &str) -> Option<Identity> {
    let t = TEMPLATES.iter().find(|t| t.id == name)?;
    let now = Utc::now();
    Some(Identity {
        id: t.id.to_string(),
        name: t.name.to_string(),
        description: t.description.to_string(),
        icon: t.icon.to_string(),
        category: t.category.to_string(),
        is_active: false,
        is_default: false,
        created_at: now,
        updated_at: now,
        agent_md: t.agent_md.to_string(),
        identity_md: t.identity_md.to_string(),
        soul_md: t.soul_md.to_string(),
        user_md: t.user_md.to_string(),
    })
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub struct IdentityStore {
    workspace: Workspace,
    // Serializes read-modify-write cycles across the identity files.
    write_lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            write_lock: Mutex::new(()),
        }
    }

    fn dir(&self) -> PathBuf {
        self.workspace.identities_dir()
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(Error::Validation(format!("invalid identity id '{}'", id)));
        }
        Ok(self.dir().join(format!("{}.json", id)))
    }

    fn write(&self, identity: &Identity) -> Result<()> {
        let path = self.path_for(&identity.id)?;
        write_atomic(&path, &serde_json::to_vec_pretty(identity)?)
    }

    fn read_all(&self) -> Result<Vec<Identity>> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)?;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|raw| serde_json::from_str::<Identity>(&raw).map_err(Error::from));
            match parsed {
                Ok(identity) => out.push(identity),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable identity"),
            }
        }
        Ok(out)
    }

    /// The persona currently on disk, presented as the default identity.
    pub fn default_identity(&self) -> Identity {
        let read = |name: &str| std::fs::read_to_string(self.workspace.persona_file(name)).unwrap_or_default();
        let now = Utc::now();
        Identity {
            id: DEFAULT_IDENTITY_ID.to_string(),
            name: "Personal Assistant".to_string(),
            description: "Default switchboard assistant".to_string(),
            icon: "🤖".to_string(),
            category: "personal".to_string(),
            is_active: true,
            is_default: true,
            created_at: now,
            updated_at: now,
            agent_md: read("AGENT.md"),
            identity_md: read("IDENTITY.md"),
            soul_md: read("SOUL.md"),
            user_md: read("USER.md"),
        }
    }

    /// Stored identities; the synthesised default when none exist yet.
    pub fn list(&self) -> Result<Vec<Identity>> {
        let identities = self.read_all()?;
        if identities.is_empty() {
            return Ok(vec![self.default_identity()]);
        }
        Ok(identities)
    }

    pub fn get(&self, id: &str) -> Result<Identity> {
        let path = self.path_for(id)?;
        if !path.exists() {
            if id == DEFAULT_IDENTITY_ID {
                return Ok(self.default_identity());
            }
            return Err(Error::NotFound(format!("identity '{}'", id)));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }

    /// Stores the default identity from the persona files the first time the
    /// store is written. Until then it is synthesised on every read, which
    /// would pick up whichever persona was activated last.
    fn persist_default(&self) -> Result<()> {
        let path = self.path_for(DEFAULT_IDENTITY_ID)?;
        if path.exists() {
            return Ok(());
        }
        let mut default = self.default_identity();
        default.is_active = !self.read_all()?.iter().any(|i| i.is_active);
        self.write(&default)?;
        info!("Default identity stored");
        Ok(())
    }

    /// Creates or updates an identity. Activation state is owned by
    /// [`IdentityStore::activate`] and is not taken from the input.
    pub fn save(&self, mut identity: Identity) -> Result<Identity> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_default()?;
        let now = Utc::now();
        if identity.id.trim().is_empty() {
            let mut stamp = now.timestamp_millis();
            while self.path_for(&format!("identity_{}", stamp))?.exists() {
                stamp += 1;
            }
            identity.id = format!("identity_{}", stamp);
        }
        if identity.name.trim().is_empty() {
            return Err(Error::Validation("identity name is required".to_string()));
        }

        let path = self.path_for(&identity.id)?;
        let existing: Option<Identity> = if path.exists() {
            Some(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
        } else {
            None
        };
        match existing {
            Some(prev) => {
                identity.created_at = prev.created_at;
                identity.is_active = prev.is_active;
                identity.is_default = prev.is_default;
            }
            None => {
                identity.created_at = now;
                identity.is_active = false;
                identity.is_default = identity.id == DEFAULT_IDENTITY_ID;
            }
        }
        identity.updated_at = now;

        self.write(&identity)?;
        info!(id = %identity.id, name = %identity.name, "Identity saved");
        Ok(identity)
    }

    /// Writes the identity's persona files to the workspace root and makes it
    /// the only active identity.
    pub fn activate(&self, id: &str) -> Result<Identity> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_default()?;
        let mut target = self.get(id)?;

        for (name, content) in target.persona() {
            write_atomic(&self.workspace.persona_file(name), content.as_bytes())?;
        }

        for mut other in self.read_all()? {
            if other.id != target.id && other.is_active {
                other.is_active = false;
                self.write(&other)?;
            }
        }
        target.is_active = true;
        target.updated_at = Utc::now();
        self.write(&target)?;

        info!(id = %target.id, name = %target.name, "Identity activated");
        Ok(target)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(Error::NotFound(format!("identity '{}'", id)));
        }
        let identity: Identity = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if identity.is_default {
            return Err(Error::Validation("cannot delete the default identity".to_string()));
        }
        if identity.is_active {
            return Err(Error::Validation(
                "cannot delete the active identity, activate another one first".to_string(),
            ));
        }
        std::fs::remove_file(&path)?;
        info!(id = %id, "Identity deleted");
        Ok(())
    }
}
