use std::path::{Path, PathBuf};

/// Locations under the config directory (`~/.switchboard` by default).
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".switchboard"))
            .unwrap_or_else(|| PathBuf::from(".switchboard"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn workspace(&self) -> PathBuf {
        self.base.join("workspace")
    }

    /// Skills shared by every workspace on this machine.
    pub fn global_skills_dir(&self) -> PathBuf {
        self.base.join("skills")
    }

    pub fn builtin_skills_dir(&self) -> PathBuf {
        // Try multiple candidate paths, return the first that exists on disk.
        // 1. exe/../skills  (installed layout: bin/switchboard + skills/)
        // 2. exe/../../skills (cargo layout: target/debug/switchboard + skills/)
        // 3. <base>/switchboard/skills
        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                for relative in &["../skills", "../../skills"] {
                    let candidate = exe_dir.join(relative);
                    if candidate.is_dir() {
                        return candidate;
                    }
                }
            }
        }
        self.base.join("switchboard").join("skills")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.global_skills_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

/// The four persona fragments that make up the live system prompt.
pub const PERSONA_FILES: [&str; 4] = ["AGENT.md", "IDENTITY.md", "SOUL.md", "USER.md"];

/// On-disk layout of the mutable workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn whatsapp_db(&self) -> PathBuf {
        self.root.join("whatsapp.db")
    }

    pub fn whatsapp_qr_ascii(&self) -> PathBuf {
        self.root.join("whatsapp_qr.txt")
    }

    pub fn whatsapp_qr_code(&self) -> PathBuf {
        self.root.join("whatsapp_qr_code.txt")
    }

    pub fn persona_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.identities_dir())?;
        std::fs::create_dir_all(self.skills_dir())?;
        Ok(())
    }
}
