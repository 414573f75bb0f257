use std::path::{Path, PathBuf};
use switchboard_core::{Config, Paths, Result, Workspace};

const AGENT_MD: &str = r#"# Agent Guidelines

You answer people who reach you through chat apps. Replies should read well
on a phone: short paragraphs, no wide tables.

- Use a skill when it can answer better than you can from memory.
- Ask one clarifying question when a request is ambiguous.
"#;

const IDENTITY_MD: &str = r#"# Identity

Name: Switchboard Assistant
Role: general-purpose helper available on every connected channel.
"#;

const SOUL_MD: &str = r#"# Personality

Calm, direct and friendly. Admit uncertainty instead of guessing.
"#;

const USER_MD: &str = r#"# User Preferences

<!-- Describe the people this assistant talks to. -->
- Preferred language: English
"#;

const PERSONA: [(&str, &str); 4] = [
    ("AGENT.md", AGENT_MD),
    ("IDENTITY.md", IDENTITY_MD),
    ("SOUL.md", SOUL_MD),
    ("USER.md", USER_MD),
];

/// What onboarding wrote, for the summary printout.
#[derive(Debug, Default)]
pub struct OnboardReport {
    pub config_written: bool,
    pub persona_written: Vec<PathBuf>,
}

/// Writes the config (unless present and not forced) and fills in any
/// missing workspace files. Existing persona files are never replaced.
pub fn write_skeleton(config_path: &Path, paths: &Paths, force: bool) -> Result<(Config, OnboardReport)> {
    let mut report = OnboardReport::default();
    let config = if config_path.exists() && !force {
        Config::load(config_path)?
    } else {
        let config = Config::default();
        config.save(config_path)?;
        report.config_written = true;
        config
    };

    paths.ensure_dirs()?;
    let workspace = Workspace::new(config.workspace_dir(paths));
    workspace.ensure_dirs()?;
    for (name, content) in PERSONA {
        let path = workspace.persona_file(name);
        if !path.exists() {
            std::fs::write(&path, content)?;
            report.persona_written.push(path);
        }
    }
    Ok((config, report))
}

pub async fn run(config_path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = config_path.unwrap_or_else(|| paths.config_file());
    let existed = config_path.exists();

    let (config, report) = write_skeleton(&config_path, &paths, force)?;

    if report.config_written {
        println!("✓ Wrote config: {}", config_path.display());
    } else if existed {
        println!("• Config exists, kept: {} (use --force to overwrite)", config_path.display());
    }
    println!("✓ Workspace: {}", config.workspace_dir(&paths).display());
    for path in &report.persona_written {
        println!("  + {}", path.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Add an API key under providers in {}", config_path.display());
    println!("  2. Enable a channel under channels and fill in its credentials");
    println!("  3. Run `switchboard gateway`");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Paths, PathBuf) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("home"));
        let config_path = dir.path().join("home").join("config.json");
        (dir, paths, config_path)
    }

    #[test]
    fn test_fresh_onboard_writes_everything() {
        let (_dir, paths, config_path) = setup();
        let (_, report) = write_skeleton(&config_path, &paths, false).unwrap();
        assert!(report.config_written);
        assert!(config_path.exists());
        assert_eq!(report.persona_written.len(), 4);
        assert!(paths.workspace().join("SOUL.md").exists());
        assert!(paths.workspace().join("identities").is_dir());
        assert!(paths.workspace().join("skills").is_dir());
    }

    #[test]
    fn test_rerun_keeps_user_edits() {
        let (_dir, paths, config_path) = setup();
        write_skeleton(&config_path, &paths, false).unwrap();

        let mut config = Config::load(&config_path).unwrap();
        config.gateway.port = 9999;
        config.save(&config_path).unwrap();
        std::fs::write(paths.workspace().join("SOUL.md"), "custom").unwrap();

        let (config, report) = write_skeleton(&config_path, &paths, false).unwrap();
        assert!(!report.config_written);
        assert!(report.persona_written.is_empty());
        assert_eq!(config.gateway.port, 9999);
        assert_eq!(std::fs::read_to_string(paths.workspace().join("SOUL.md")).unwrap(), "custom");

        let (config, report) = write_skeleton(&config_path, &paths, true).unwrap();
        assert!(report.config_written);
        assert_ne!(config.gateway.port, 9999);
        // --force resets config only.
        assert_eq!(std::fs::read_to_string(paths.workspace().join("SOUL.md")).unwrap(), "custom");
    }
}
